//! GPU data types

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::amd::AdlApi;
use crate::nvidia::NvApi;

/// GPU vendor type
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum GpuVendor {
    Nvidia,
    Amd,
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuVendor::Nvidia => write!(f, "NVIDIA"),
            GpuVendor::Amd => write!(f, "AMD"),
        }
    }
}

/// Vendor SDK entry points available to discovery
///
/// Either side may be missing (driver not installed); discovery then skips
/// that vendor.
#[derive(Clone, Default)]
pub struct GpuBackends {
    pub nvidia: Option<Arc<dyn NvApi>>,
    pub amd: Option<Arc<dyn AdlApi>>,
}

impl GpuBackends {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_nvidia(mut self, api: Arc<dyn NvApi>) -> Self {
        self.nvidia = Some(api);
        self
    }

    pub fn with_amd(mut self, api: Arc<dyn AdlApi>) -> Self {
        self.amd = Some(api);
        self
    }
}

impl std::fmt::Debug for GpuBackends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBackends")
            .field("nvidia", &self.nvidia.is_some())
            .field("amd", &self.amd.is_some())
            .finish()
    }
}
