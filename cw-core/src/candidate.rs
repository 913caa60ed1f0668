//! Enumerated transport candidates
//!
//! A candidate lives only between enumeration and validation: it is either
//! promoted to a device or dropped.

use serde::{Deserialize, Serialize};

use crate::transport::{FtDeviceInfo, HidDeviceInfo, PortInfo};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum DeviceCandidate {
    Serial(PortInfo),
    Ftdi(FtDeviceInfo),
    Hid(HidDeviceInfo),
}

impl DeviceCandidate {
    /// Port name, driver location or HID path
    pub fn location(&self) -> String {
        match self {
            DeviceCandidate::Serial(port) => port.name.clone(),
            DeviceCandidate::Ftdi(info) if info.location.is_empty() => format!("ftdi:{}", info.index),
            DeviceCandidate::Ftdi(info) => info.location.clone(),
            DeviceCandidate::Hid(info) => info.path.clone(),
        }
    }

    /// USB vendor/product pair, when the transport reports one
    pub fn usb_id(&self) -> Option<(u16, u16)> {
        match self {
            DeviceCandidate::Serial(port) => port.vendor_id.zip(port.product_id),
            DeviceCandidate::Ftdi(_) => None,
            DeviceCandidate::Hid(info) => Some((info.vendor_id, info.product_id)),
        }
    }
}

impl std::fmt::Display for DeviceCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.usb_id() {
            Some((vid, pid)) => write!(f, "{} ({:04X}:{:04X})", self.location(), vid, pid),
            None => write!(f, "{}", self.location()),
        }
    }
}
