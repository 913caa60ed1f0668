//! GPU telemetry for Coolwatch
//!
//! Vendor management libraries are reached through narrow traits so that
//! negotiation and decoding can be exercised without hardware:
//! - NVIDIA via [`nvidia::NvApi`] (backed by `nvidia-smi` on Linux)
//! - AMD via [`amd::AdlApi`] (backed by the amdgpu sysfs interface)

pub mod amd;
pub mod nvidia;

pub mod constants;
mod types;

pub use types::*;

use cw_error::CoolwatchError;
use cw_sensor::Device;
use std::sync::Arc;
use tracing::{debug, info};

pub type Result<T> = std::result::Result<T, CoolwatchError>;

impl GpuBackends {
    /// The backends available on this host
    pub fn system() -> Self {
        Self::none()
            .with_nvidia(Arc::new(nvidia::SmiApi::new()))
            .with_amd(Arc::new(amd::SysfsAdl::new()))
    }
}

/// Enumerate all GPUs reachable through `backends` (NVIDIA first, then AMD)
///
/// A vendor whose library is missing or fails enumeration is skipped.
pub fn enumerate_gpus(backends: &GpuBackends) -> Vec<Box<dyn Device>> {
    let mut gpus: Vec<Box<dyn Device>> = Vec::new();

    if let Some(api) = &backends.nvidia {
        match nvidia::enumerate(api.clone()) {
            Ok(nvidia_gpus) => {
                info!("Found {} NVIDIA GPU(s)", nvidia_gpus.len());
                gpus.extend(nvidia_gpus.into_iter().map(|g| Box::new(g) as Box<dyn Device>));
            }
            Err(e) => {
                debug!("No NVIDIA GPUs detected: {}", e);
            }
        }
    }

    if let Some(api) = &backends.amd {
        match amd::enumerate(api.clone()) {
            Ok(amd_gpus) => {
                info!("Found {} AMD GPU(s)", amd_gpus.len());
                gpus.extend(amd_gpus.into_iter().map(|g| Box::new(g) as Box<dyn Device>));
            }
            Err(e) => {
                debug!("No AMD GPUs detected: {}", e);
            }
        }
    }

    gpus
}
