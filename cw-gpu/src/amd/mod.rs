//! AMD GPU telemetry
//!
//! The display library exposes four incompatible Overdrive generations. Each
//! adapter negotiates the richest one it answers (see [`AmdGpu`]); the
//! generation decides which sensors exist for the lifetime of the device.
//!
//! On Linux the [`AdlApi`] trait is implemented over the amdgpu sysfs files
//! ([`SysfsAdl`]).

mod gpu;
mod sysfs;

pub use gpu::{AmdCapability, AmdGpu};
pub use sysfs::SysfsAdl;

use std::collections::HashSet;
use std::sync::Arc;

use crate::constants::amd::PMLOG_MAX_SENSORS;
use crate::constants::AMD_VENDOR_ID_NUMERIC;
use crate::Result;
use cw_error::CoolwatchError;
use tracing::{debug, info};

/// Status code returned by a failed library call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdlStatus(pub i32);

impl AdlStatus {
    pub const OK: AdlStatus = AdlStatus(0);
    pub const ERR: AdlStatus = AdlStatus(-1);
    pub const NOT_INIT: AdlStatus = AdlStatus(-2);
    pub const INVALID_ADAPTER: AdlStatus = AdlStatus(-5);
    pub const NOT_SUPPORTED: AdlStatus = AdlStatus(-8);
    pub const DISABLED_ADAPTER: AdlStatus = AdlStatus(-10);

    /// The adapter index no longer refers to an active GPU
    pub fn is_device_lost(&self) -> bool {
        *self == Self::INVALID_ADAPTER || *self == Self::DISABLED_ADAPTER
    }
}

impl std::fmt::Display for AdlStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AdlStatus({})", self.0)
    }
}

pub type AdlResult<T> = std::result::Result<T, AdlStatus>;

/// One adapter as reported by the library
///
/// A physical GPU shows up once per display output, so several entries can
/// share a PCI bus/device pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub index: i32,
    pub vendor_id: i32,
    pub bus: i32,
    pub device: i32,
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PmLogEntry {
    pub supported: bool,
    pub value: i32,
}

/// Overdrive8 PM-log sensor array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmLogSensors {
    pub entries: Vec<PmLogEntry>,
}

impl Default for PmLogSensors {
    fn default() -> Self {
        Self {
            entries: vec![PmLogEntry::default(); PMLOG_MAX_SENSORS],
        }
    }
}

impl PmLogSensors {
    pub fn with(mut self, index: usize, value: i32) -> Self {
        if let Some(entry) = self.entries.get_mut(index) {
            *entry = PmLogEntry {
                supported: true,
                value,
            };
        }
        self
    }

    pub fn supported_count(&self) -> usize {
        self.entries.iter().filter(|e| e.supported).count()
    }

    /// Value of a supported slot
    pub fn get(&self, index: usize) -> Option<i32> {
        self.entries
            .get(index)
            .filter(|e| e.supported)
            .map(|e| e.value)
    }
}

/// OverdriveN performance status; clocks in 10 kHz units, voltage in mV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OdnPerformanceStatus {
    pub core_clock: i32,
    pub memory_clock: i32,
    pub gpu_activity_percent: i32,
    pub vddc_mv: i32,
}

impl OdnPerformanceStatus {
    /// Fields the driver actually filled in
    pub fn nonzero_count(&self) -> usize {
        [
            self.core_clock,
            self.memory_clock,
            self.gpu_activity_percent,
            self.vddc_mv,
        ]
        .iter()
        .filter(|v| **v != 0)
        .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OdnTemperature {
    Core,
    Junction,
    Memory,
}

/// Overdrive6 current status; clocks in 10 kHz units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Od6Status {
    pub engine_clock: i32,
    pub memory_clock: i32,
    pub activity_percent: i32,
}

/// Overdrive5 activity; clocks in 10 kHz units, voltage in mV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Od5Activity {
    pub engine_clock: i32,
    pub memory_clock: i32,
    pub vddc_mv: i32,
    pub activity_percent: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FanSpeedUnit {
    Rpm,
    Percent,
}

/// Functional interface to the AMD display library
#[cfg_attr(test, mockall::automock)]
pub trait AdlApi: Send + Sync {
    fn adapters(&self) -> AdlResult<Vec<AdapterInfo>>;

    fn od8_pmlog(&self, adapter: i32) -> AdlResult<PmLogSensors>;

    fn odn_performance_status(&self, adapter: i32) -> AdlResult<OdnPerformanceStatus>;

    /// Millidegrees Celsius
    fn odn_temperature(&self, adapter: i32, sensor: OdnTemperature) -> AdlResult<i32>;

    fn odn_fan_rpm(&self, adapter: i32) -> AdlResult<i32>;

    /// Capability bitmask; one bit per supported feature
    fn od6_capabilities(&self, adapter: i32) -> AdlResult<u32>;

    fn od6_current_status(&self, adapter: i32) -> AdlResult<Od6Status>;

    /// Watts in 24.8 fixed point
    fn od6_current_power(&self, adapter: i32) -> AdlResult<i32>;

    /// Millidegrees Celsius
    fn od5_temperature(&self, adapter: i32) -> AdlResult<i32>;

    fn od5_fan_speed(&self, adapter: i32, unit: FanSpeedUnit) -> AdlResult<i32>;

    fn od5_activity(&self, adapter: i32) -> AdlResult<Od5Activity>;
}

/// Active AMD adapters, one per physical GPU
pub fn physical_adapters(adapters: Vec<AdapterInfo>) -> Vec<AdapterInfo> {
    let mut seen = HashSet::new();
    adapters
        .into_iter()
        .filter(|a| a.vendor_id == AMD_VENDOR_ID_NUMERIC && a.active)
        .filter(|a| seen.insert((a.bus, a.device)))
        .collect()
}

/// Enumerate adapters and construct one negotiated device per physical GPU
pub fn enumerate(api: Arc<dyn AdlApi>) -> Result<Vec<AmdGpu>> {
    let adapters = api
        .adapters()
        .map_err(|s| CoolwatchError::sdk("ADL_Adapter_AdapterInfo_Get", s.0))?;
    debug!("ADL reported {} adapter entries", adapters.len());

    let gpus: Vec<AmdGpu> = physical_adapters(adapters)
        .into_iter()
        .map(|adapter| AmdGpu::new(api.clone(), adapter))
        .collect();

    for gpu in &gpus {
        info!(
            gpu = %gpu.identity.name,
            capability = ?gpu.capability_kind(),
            "AMD GPU ready"
        );
    }
    Ok(gpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(index: i32, vendor_id: i32, bus: i32, active: bool) -> AdapterInfo {
        AdapterInfo {
            index,
            vendor_id,
            bus,
            device: 0,
            name: format!("Radeon {}", index),
            active,
        }
    }

    #[test]
    fn test_physical_adapters_dedupes_and_filters() {
        let adapters = vec![
            adapter(0, 0x1002, 3, true),
            adapter(1, 0x1002, 3, true),
            adapter(2, 0x10de, 5, true),
            adapter(3, 0x1002, 7, false),
            adapter(4, 0x1002, 9, true),
        ];
        let kept: Vec<i32> = physical_adapters(adapters).iter().map(|a| a.index).collect();
        assert_eq!(kept, vec![0, 4]);
    }

    #[test]
    fn test_pmlog_supported_slots() {
        let log = PmLogSensors::default().with(7, 55).with(13, 1200);
        assert_eq!(log.supported_count(), 2);
        assert_eq!(log.get(7), Some(55));
        assert_eq!(log.get(8), None);
        assert_eq!(log.get(PMLOG_MAX_SENSORS), None);
    }

    #[test]
    fn test_odn_nonzero_count() {
        let status = OdnPerformanceStatus {
            core_clock: 150_000,
            gpu_activity_percent: 4,
            ..Default::default()
        };
        assert_eq!(status.nonzero_count(), 2);
    }
}
