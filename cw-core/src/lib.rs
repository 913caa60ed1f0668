//! Coolwatch Core Library
//!
//! Discovery, validation and polling of cooling hardware: liquid coolers,
//! fan controllers and GPUs reached over serial ports, FTDI bridges, USB-HID
//! and vendor management libraries.
//!
//! # Module Structure
//!
//! - `transport/` - Raw byte sessions (serial, FTDI, HID) with bounded waits
//! - `devices/` - Per-family decoders, probes and [`Device`] implementations
//! - `validator` - Probe-and-verify of ambiguous candidates
//! - `poller` - Background reader for streaming devices
//! - `registry` - Discovery across all transport classes and device lifetime
//! - `config` - Persistent daemon configuration
//!
//! # Example
//!
//! ```no_run
//! use cw_core::{load_config, Backends, Registry};
//!
//! let config = load_config().unwrap_or_default();
//! let mut registry = Registry::new(config, Backends::system());
//! registry.discover();
//! registry.update_all();
//! for device in registry.devices() {
//!     println!("{}: {} readings", device.name(), device.snapshot().len());
//! }
//! registry.dispose_all();
//! ```

// Grouped modules
pub mod devices;
pub mod transport;

// Standalone modules
pub mod candidate;
pub mod config;
pub mod constants;
pub mod poller;
pub mod registry;
pub mod validator;

// Re-export error types
pub use cw_error::{CoolwatchError, Result};

// Re-export the shared device model
pub use cw_sensor::{
    Accuracy, Availability, CapabilityLevel, Device, DeviceFamily, DeviceIdentity, DeviceStatus,
    SensorKind, SensorReading, SensorSnapshot,
};

pub use candidate::DeviceCandidate;
pub use config::{
    get_config_path, load_config, load_config_from, save_config_to, CoolwatchConfig,
    DiscoveryConfig, LoggingConfig, PollingConfig, ProbeConfig,
};
pub use poller::{BackgroundPoller, FrameReader, PollerState, RawFrame};
pub use registry::{Backends, Registry};
pub use validator::{validate_candidates, ProbePolicy, Validated};

// Re-export GPU backends for callers assembling custom `Backends`
pub use cw_gpu::GpuBackends;
