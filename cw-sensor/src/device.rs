//! Device trait and identity types

use serde::{Deserialize, Serialize};

use crate::SensorSnapshot;

/// Device family, one per supported wire protocol
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFamily {
    /// T-Balancer bigNG fan controller (FTDI bridge)
    TBalancer,
    /// Heatmaster fan controller (RS-232)
    Heatmaster,
    /// Kraken liquid cooler (USB-HID)
    Kraken,
    NvidiaGpu,
    AmdGpu,
}

impl std::fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceFamily::TBalancer => write!(f, "T-Balancer"),
            DeviceFamily::Heatmaster => write!(f, "Heatmaster"),
            DeviceFamily::Kraken => write!(f, "Kraken"),
            DeviceFamily::NvidiaGpu => write!(f, "NVIDIA"),
            DeviceFamily::AmdGpu => write!(f, "AMD"),
        }
    }
}

/// Stable identity of a confirmed device
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Display name (e.g., "Kraken Z3", "NVIDIA GeForce RTX 3080")
    pub name: String,
    pub family: DeviceFamily,
    /// Transport location: port name, HID path, or adapter index
    pub location: String,
    /// Firmware or protocol revision, when the device reports one
    pub firmware: Option<String>,
}

/// Protocol generation a device was confirmed to support
///
/// Ordered by `rank`; higher ranks expose more sensors. Assigned once when the
/// device is constructed and never renegotiated.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapabilityLevel {
    pub rank: u8,
    pub label: &'static str,
}

impl CapabilityLevel {
    pub const fn new(rank: u8, label: &'static str) -> Self {
        Self { rank, label }
    }
}

impl std::fmt::Display for CapabilityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label)
    }
}

/// Lifecycle state of a device
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Open and polling
    Active,
    /// The transport reported a disconnect; `close()` is still owed
    Disconnected,
    /// Closed; the transport handle has been released
    Closed,
}

/// A confirmed, opened hardware unit
///
/// `update()` never fails: transient errors leave affected readings at
/// "no value" and a disconnect moves the device to
/// [`DeviceStatus::Disconnected`]. `close()` must be safe to call repeatedly.
pub trait Device: Send {
    fn identity(&self) -> &DeviceIdentity;

    fn capability(&self) -> CapabilityLevel;

    fn snapshot(&self) -> &SensorSnapshot;

    /// Refresh the snapshot from the hardware
    fn update(&mut self);

    /// Stop any background reader and release the transport exactly once
    fn close(&mut self);

    fn status(&self) -> DeviceStatus;

    fn name(&self) -> &str {
        &self.identity().name
    }

    fn is_active(&self) -> bool {
        self.status() == DeviceStatus::Active
    }
}
