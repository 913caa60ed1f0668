//! GPU-related constants

/// PCI vendor ID for AMD GPUs as reported by ADL adapter info
pub const AMD_VENDOR_ID_NUMERIC: i32 = 0x1002;

/// Path to DRM (Direct Rendering Manager) devices
pub const DRM_PATH: &str = "/sys/class/drm";

/// Microwatts per watt (for power conversion)
pub const MICROWATTS_PER_WATT: f32 = 1_000_000.0;

/// Milliwatts per watt
pub const MILLIWATTS_PER_WATT: f32 = 1_000.0;

/// Temperature readings are in millidegrees, divide by this to get Celsius
pub const MILLIDEGREE_DIVISOR: f32 = 1000.0;

/// Kilohertz per megahertz (NVAPI clocks are reported in kHz)
pub const KHZ_PER_MHZ: f32 = 1000.0;

/// Hertz per megahertz (sysfs clocks are reported in Hz)
pub const HZ_PER_MHZ: f32 = 1_000_000.0;

/// NVIDIA-specific constants
pub mod nvidia {
    /// Clock domain slots in a clock frequencies structure
    pub const MAX_CLOCK_DOMAINS: usize = 32;

    /// Clock domain indices into the clock frequencies structure
    pub mod domain {
        pub const GRAPHICS: usize = 0;
        pub const MEMORY: usize = 4;
        pub const PROCESSOR: usize = 7;
        pub const VIDEO: usize = 8;
    }

    /// Entries in the legacy all-clocks array
    pub const LEGACY_CLOCK_COUNT: usize = 32;

    /// Offsets into the legacy all-clocks array (values in kHz)
    pub mod legacy {
        pub const CORE: usize = 0;
        pub const MEMORY: usize = 8;
        pub const SHADER: usize = 14;
        /// When non-zero, holds the shader clock and core = shader / 2
        pub const SHADER_DOUBLED: usize = 30;
    }

    /// Lifetime of a cached `nvidia-smi` query
    pub const SMI_CACHE_MS: u64 = 250;
}

/// AMD-specific constants
pub mod amd {
    /// Slots in an Overdrive8 PM-log sensor array
    pub const PMLOG_MAX_SENSORS: usize = 256;

    /// Overdrive8 PM-log sensor indices
    pub mod pmlog {
        pub const CLK_GFXCLK: usize = 0;
        pub const CLK_MEMCLK: usize = 1;
        pub const TEMPERATURE_EDGE: usize = 7;
        pub const TEMPERATURE_MEM: usize = 8;
        pub const FAN_RPM: usize = 13;
        pub const FAN_PERCENTAGE: usize = 14;
        pub const SOC_VOLTAGE: usize = 15;
        pub const INFO_ACTIVITY_GFX: usize = 18;
        pub const GFX_VOLTAGE: usize = 20;
        pub const ASIC_POWER: usize = 22;
        pub const TEMPERATURE_HOTSPOT: usize = 27;
    }

    /// Overdrive5/6 engine and memory clocks are reported in 10 kHz units
    pub const OD_CLOCK_DIVISOR: f32 = 100.0;

    /// Overdrive6 power is reported as 24.8 fixed point watts
    pub const OD6_POWER_SHIFT: u32 = 8;
}

/// PWM constants
pub mod pwm {
    /// Convert PWM value (0-255) to percentage (0-100)
    #[inline]
    pub fn to_percent(value: u8) -> f32 {
        (value as f32 / 255.0) * 100.0
    }
}
