//! NVIDIA GPU telemetry
//!
//! The driver's management API is consumed through the narrow [`NvApi`] trait:
//! every call either returns its payload or an [`NvStatus`] code. Clock
//! queries exist in three structure versions; each GPU negotiates the richest
//! one it answers at construction (see [`NvidiaGpu`]).
//!
//! On Linux the trait is implemented on top of `nvidia-smi` ([`SmiApi`]).

mod gpu;
mod smi;

pub use gpu::{NvidiaCapability, NvidiaGpu};
pub use smi::SmiApi;

use std::sync::Arc;

use crate::constants::nvidia::{MAX_CLOCK_DOMAINS, LEGACY_CLOCK_COUNT};
use crate::constants::KHZ_PER_MHZ;
use crate::Result;
use cw_error::CoolwatchError;
use tracing::{debug, info};

/// Status code returned by a failed API call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvStatus(pub i32);

impl NvStatus {
    pub const OK: NvStatus = NvStatus(0);
    pub const ERROR: NvStatus = NvStatus(-1);
    pub const LIBRARY_NOT_FOUND: NvStatus = NvStatus(-2);
    pub const NVIDIA_DEVICE_NOT_FOUND: NvStatus = NvStatus(-6);
    pub const INCOMPATIBLE_STRUCT_VERSION: NvStatus = NvStatus(-9);
    pub const EXPECTED_PHYSICAL_GPU_HANDLE: NvStatus = NvStatus(-101);
    pub const NOT_SUPPORTED: NvStatus = NvStatus(-104);

    /// The GPU handle no longer refers to a present device
    pub fn is_device_lost(&self) -> bool {
        *self == Self::NVIDIA_DEVICE_NOT_FOUND || *self == Self::EXPECTED_PHYSICAL_GPU_HANDLE
    }
}

impl std::fmt::Display for NvStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NvStatus({})", self.0)
    }
}

pub type NvResult<T> = std::result::Result<T, NvStatus>;

/// Opaque physical GPU handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalGpu(pub u32);

/// Clock frequency structure version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClockGeneration {
    V1,
    V2,
    V3,
}

impl ClockGeneration {
    /// Richest first
    pub const NEGOTIATION_ORDER: [ClockGeneration; 3] =
        [ClockGeneration::V3, ClockGeneration::V2, ClockGeneration::V1];

    /// Which clock types a structure version can carry
    pub fn supports(&self, clock_type: ClockType) -> bool {
        match clock_type {
            ClockType::Current => true,
            ClockType::Base => *self >= ClockGeneration::V2,
            ClockType::Boost => *self >= ClockGeneration::V3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockType {
    Current,
    Base,
    Boost,
}

/// One clock domain slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockDomain {
    pub present: bool,
    pub frequency_khz: u32,
}

/// Clock frequencies structure: one slot per domain, each with a present flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockFrequencies {
    pub domains: [ClockDomain; MAX_CLOCK_DOMAINS],
}

impl Default for ClockFrequencies {
    fn default() -> Self {
        Self {
            domains: [ClockDomain::default(); MAX_CLOCK_DOMAINS],
        }
    }
}

impl ClockFrequencies {
    pub fn with_domain(mut self, domain: usize, frequency_khz: u32) -> Self {
        if let Some(slot) = self.domains.get_mut(domain) {
            *slot = ClockDomain {
                present: true,
                frequency_khz,
            };
        }
        self
    }

    /// Number of domains with the present flag set
    pub fn present_count(&self) -> usize {
        self.domains.iter().filter(|d| d.present).count()
    }

    /// Frequency of `domain` in MHz, `None` when the domain is not present
    pub fn mhz(&self, domain: usize) -> Option<f32> {
        self.domains
            .get(domain)
            .filter(|d| d.present)
            .map(|d| d.frequency_khz as f32 / KHZ_PER_MHZ)
    }
}

/// Thermal sensor target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThermalTarget {
    Gpu,
    Memory,
    PowerSupply,
    Board,
    Hotspot,
}

impl ThermalTarget {
    pub fn label(&self) -> &'static str {
        match self {
            ThermalTarget::Gpu => "GPU Core",
            ThermalTarget::Memory => "GPU Memory",
            ThermalTarget::PowerSupply => "GPU Power Supply",
            ThermalTarget::Board => "GPU Board",
            ThermalTarget::Hotspot => "GPU Hot Spot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThermalSensor {
    pub target: ThermalTarget,
    /// Degrees Celsius
    pub current_temp: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThermalSettings {
    pub sensors: Vec<ThermalSensor>,
}

/// Dynamic P-state utilisation, each domain independently present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Utilization {
    pub gpu: Option<u32>,
    pub frame_buffer: Option<u32>,
    pub video_engine: Option<u32>,
}

/// Functional interface to the NVIDIA management API
#[cfg_attr(test, mockall::automock)]
pub trait NvApi: Send + Sync {
    fn physical_gpus(&self) -> NvResult<Vec<PhysicalGpu>>;

    fn full_name(&self, gpu: PhysicalGpu) -> NvResult<String>;

    fn thermal_settings(&self, gpu: PhysicalGpu) -> NvResult<ThermalSettings>;

    fn clock_frequencies(
        &self,
        gpu: PhysicalGpu,
        generation: ClockGeneration,
        clock_type: ClockType,
    ) -> NvResult<ClockFrequencies>;

    /// Pre-versioned clock query: a flat array of kHz values
    fn all_clocks(&self, gpu: PhysicalGpu) -> NvResult<[u32; LEGACY_CLOCK_COUNT]>;

    /// Fan tachometer in RPM
    fn tachometer(&self, gpu: PhysicalGpu) -> NvResult<u32>;

    /// Cooler level in percent
    fn cooler_level(&self, gpu: PhysicalGpu) -> NvResult<u32>;

    fn utilization(&self, gpu: PhysicalGpu) -> NvResult<Utilization>;

    /// Board power draw in milliwatts
    fn power_draw_mw(&self, gpu: PhysicalGpu) -> NvResult<u32>;
}

/// Enumerate physical GPUs and construct one negotiated device per GPU
pub fn enumerate(api: Arc<dyn NvApi>) -> Result<Vec<NvidiaGpu>> {
    let handles = api
        .physical_gpus()
        .map_err(|s| CoolwatchError::sdk("NvAPI_EnumPhysicalGPUs", s.0))?;
    debug!("NVAPI reported {} physical GPU(s)", handles.len());

    let gpus: Vec<NvidiaGpu> = handles
        .into_iter()
        .enumerate()
        .map(|(index, handle)| NvidiaGpu::new(api.clone(), handle, index as u32))
        .collect();

    for gpu in &gpus {
        info!(
            gpu = %gpu.identity.name,
            capability = ?gpu.capability_kind(),
            "NVIDIA GPU ready"
        );
    }
    Ok(gpus)
}
