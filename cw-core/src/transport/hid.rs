//! USB-HID streams
//!
//! Enumeration goes through [`HidBus`]; the system implementation over
//! `hidapi` is only built with the `hid` feature.

use serde::{Deserialize, Serialize};

use super::Transport;
use crate::Result;

/// An enumerated HID interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HidDeviceInfo {
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// HID enumeration and opening
pub trait HidBus: Send + Sync {
    /// Interfaces with the given vendor ID
    fn devices(&self, vendor_id: u16) -> Result<Vec<HidDeviceInfo>>;

    fn open(&self, info: &HidDeviceInfo) -> Result<Box<dyn Transport>>;
}

#[cfg(feature = "hid")]
pub use system::{HidSession, SystemHidBus};

#[cfg(feature = "hid")]
mod system {
    use std::ffi::CString;
    use std::time::Duration;

    use hidapi::{HidApi, HidDevice, HidError};
    use parking_lot::Mutex;
    use tracing::{debug, trace};

    use super::{HidBus, HidDeviceInfo};
    use crate::transport::{closed_error, Transport};
    use crate::{CoolwatchError, Result};

    /// Reports drained per purge before giving up
    const MAX_PURGE_REPORTS: usize = 64;

    fn map_hid_error(target: &str, err: HidError) -> CoolwatchError {
        // hidapi reports a vanished device as a generic read/write failure
        CoolwatchError::Disconnected(format!("{}: {}", target, err))
    }

    /// `hidapi` context of the running system
    pub struct SystemHidBus {
        api: Mutex<HidApi>,
    }

    impl SystemHidBus {
        pub fn new() -> Result<Self> {
            let api = HidApi::new()
                .map_err(|e| CoolwatchError::TransportUnavailable(format!("hidapi: {}", e)))?;
            Ok(Self {
                api: Mutex::new(api),
            })
        }
    }

    impl HidBus for SystemHidBus {
        fn devices(&self, vendor_id: u16) -> Result<Vec<HidDeviceInfo>> {
            let mut api = self.api.lock();
            api.refresh_devices()
                .map_err(|e| CoolwatchError::TransportUnavailable(format!("hidapi: {}", e)))?;
            let devices: Vec<HidDeviceInfo> = api
                .device_list()
                .filter(|d| d.vendor_id() == vendor_id)
                .map(|d| HidDeviceInfo {
                    path: d.path().to_string_lossy().into_owned(),
                    vendor_id: d.vendor_id(),
                    product_id: d.product_id(),
                    product: d.product_string().map(str::to_string),
                    serial_number: d.serial_number().map(str::to_string),
                })
                .collect();
            debug!("Found {} HID interface(s) for VID {:04X}", devices.len(), vendor_id);
            Ok(devices)
        }

        fn open(&self, info: &HidDeviceInfo) -> Result<Box<dyn Transport>> {
            let path = CString::new(info.path.clone())
                .map_err(|e| CoolwatchError::open_failure(&info.path, e.to_string()))?;
            let device = self
                .api
                .lock()
                .open_path(&path)
                .map_err(|e| CoolwatchError::open_failure(&info.path, e.to_string()))?;
            trace!("Opened HID {}", info.path);
            Ok(Box::new(HidSession {
                name: info.path.clone(),
                device: Some(device),
            }))
        }
    }

    /// One open HID interface
    pub struct HidSession {
        name: String,
        device: Option<HidDevice>,
    }

    impl HidSession {
        fn device(&self) -> Result<&HidDevice> {
            self.device.as_ref().ok_or_else(|| closed_error(&self.name))
        }
    }

    impl Transport for HidSession {
        fn name(&self) -> &str {
            &self.name
        }

        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.device()?
                .write(data)
                .map(|_| ())
                .map_err(|e| map_hid_error(&self.name, e))
        }

        fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
            let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
            match self.device()?.read_timeout(buf, millis) {
                Ok(0) => Err(CoolwatchError::timeout(format!("{}: no report", self.name))),
                Ok(n) => Ok(n),
                Err(e) => Err(map_hid_error(&self.name, e)),
            }
        }

        fn bytes_to_read(&mut self) -> Result<usize> {
            // Reports are message-framed; there is no byte queue to inspect
            self.device()?;
            Ok(0)
        }

        fn purge(&mut self) -> Result<()> {
            let device = self.device()?;
            let mut scratch = [0u8; 64];
            for _ in 0..MAX_PURGE_REPORTS {
                match device.read_timeout(&mut scratch, 0) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) => return Err(map_hid_error(&self.name, e)),
                }
            }
            Ok(())
        }

        fn get_feature_report(&mut self, buf: &mut [u8]) -> Result<usize> {
            self.device()?
                .get_feature_report(buf)
                .map_err(|e| map_hid_error(&self.name, e))
        }

        fn send_feature_report(&mut self, data: &[u8]) -> Result<()> {
            self.device()?
                .send_feature_report(data)
                .map_err(|e| map_hid_error(&self.name, e))
        }

        fn close(&mut self) {
            if self.device.take().is_some() {
                trace!("Closed HID {}", self.name);
            }
        }

        fn is_closed(&self) -> bool {
            self.device.is_none()
        }
    }
}
