//! Cooler and fan-hub families
//!
//! # Module Structure
//!
//! - `tbalancer` - T-Balancer bigNG over FTDI, polled binary frames
//! - `heatmaster` - Heatmaster over RS-232, polled ASCII line protocol
//! - `kraken` - Kraken X3/Z3 over USB-HID, streaming reports
//!
//! Each family module exposes a pure frame decoder, a probe used during
//! validation, a `discover` entry point, and a [`cw_sensor::Device`]
//! implementation.

pub mod heatmaster;
pub mod kraken;
pub mod tbalancer;

pub use heatmaster::Heatmaster;
pub use kraken::{Kraken, KrakenModel};
pub use tbalancer::{TBalancer, TBalancerRevision};

use cw_sensor::{DeviceStatus, SensorSnapshot};
use tracing::{debug, warn};

use crate::CoolwatchError;

/// Apply the steady-state error policy to a failed cycle.
///
/// Fatal errors retire the device; anything else only blanks this cycle.
pub(crate) fn fail_cycle(
    name: &str,
    snapshot: &mut SensorSnapshot,
    status: &mut DeviceStatus,
    err: &CoolwatchError,
) {
    snapshot.clear_values();
    if err.is_fatal() {
        if *status == DeviceStatus::Active {
            warn!(device = name, "Device lost: {}", err);
            *status = DeviceStatus::Disconnected;
        }
    } else {
        debug!(device = name, "Update failed: {}", err);
    }
}
