//! Shared device model for Coolwatch
//!
//! Every device family (coolers, fan controllers, GPUs) reports through the
//! same handful of types:
//!
//! - [`SensorSnapshot`] - the mutable set of typed, individually nullable readings
//! - [`CapabilityLevel`] - the protocol generation fixed at construction time
//! - [`Device`] - the trait the registry and callers talk to
//! - [`negotiate`] - generation probing shared by the GPU families

mod device;
pub mod negotiate;
mod snapshot;

pub use device::*;
pub use negotiate::{negotiate, Negotiated};
pub use snapshot::*;
