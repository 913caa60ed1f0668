//! Device registry
//!
//! Owns every confirmed device for the lifetime of one discovery. Transport
//! classes are scanned in a fixed order (FTDI, serial, HID, NVIDIA, AMD); a
//! class that fails, or panics inside a driver binding, is logged and skipped
//! without affecting the others.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use cw_gpu::{enumerate_gpus, GpuBackends};
use cw_sensor::{Device, DeviceStatus};
use tracing::{debug, info, warn};

use crate::config::CoolwatchConfig;
use crate::devices::{heatmaster, kraken, tbalancer};
use crate::transport::{FtdiDriver, HidBus, SerialBus, SystemSerialBus, VcpDriver};
use crate::Result;

/// Enumeration entry points, one per transport class
///
/// A missing entry means the class is unavailable on this host.
#[derive(Clone, Default)]
pub struct Backends {
    pub serial: Option<Arc<dyn SerialBus>>,
    pub ftdi: Option<Arc<dyn FtdiDriver>>,
    pub hid: Option<Arc<dyn HidBus>>,
    pub gpu: GpuBackends,
}

impl Backends {
    pub fn none() -> Self {
        Self::default()
    }

    /// Backends of the running system
    pub fn system() -> Self {
        Self {
            serial: Some(Arc::new(SystemSerialBus)),
            ftdi: Some(Arc::new(VcpDriver::new())),
            hid: system_hid(),
            gpu: GpuBackends::system(),
        }
    }
}

#[cfg(feature = "hid")]
fn system_hid() -> Option<Arc<dyn HidBus>> {
    match crate::transport::SystemHidBus::new() {
        Ok(bus) => Some(Arc::new(bus)),
        Err(e) => {
            warn!("HID unavailable: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "hid"))]
fn system_hid() -> Option<Arc<dyn HidBus>> {
    debug!("Built without HID support");
    None
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("serial", &self.serial.is_some())
            .field("ftdi", &self.ftdi.is_some())
            .field("hid", &self.hid.is_some())
            .field("gpu", &self.gpu)
            .finish()
    }
}

/// Run one transport class scan, containing errors and panics
fn scan_class<F>(class: &str, scan: F) -> Vec<Box<dyn Device>>
where
    F: FnOnce() -> Result<Vec<Box<dyn Device>>>,
{
    match catch_unwind(AssertUnwindSafe(scan)) {
        Ok(Ok(devices)) => {
            debug!("{} scan found {} device(s)", class, devices.len());
            devices
        }
        Ok(Err(e)) => {
            warn!("{} scan skipped: {}", class, e);
            Vec::new()
        }
        Err(_) => {
            warn!("{} scan panicked; skipping class", class);
            Vec::new()
        }
    }
}

fn boxed<D: Device + 'static>(devices: Vec<D>) -> Vec<Box<dyn Device>> {
    devices
        .into_iter()
        .map(|d| Box::new(d) as Box<dyn Device>)
        .collect()
}

/// The set of devices confirmed by the last discovery
pub struct Registry {
    config: CoolwatchConfig,
    backends: Backends,
    devices: Vec<Box<dyn Device>>,
}

impl Registry {
    pub fn new(config: CoolwatchConfig, backends: Backends) -> Self {
        Self {
            config,
            backends,
            devices: Vec::new(),
        }
    }

    pub fn config(&self) -> &CoolwatchConfig {
        &self.config
    }

    /// Replace the device set with a fresh scan of every enabled class
    pub fn discover(&mut self) -> &[Box<dyn Device>] {
        self.dispose_all();
        let found = self.scan();
        info!("Discovery complete: {} device(s)", found.len());
        self.devices = found;
        &self.devices
    }

    fn scan(&self) -> Vec<Box<dyn Device>> {
        let discovery = &self.config.discovery;
        let polling = &self.config.polling;
        let mut found: Vec<Box<dyn Device>> = Vec::new();

        match (&self.backends.ftdi, discovery.ftdi) {
            (Some(driver), true) => {
                let policy = discovery.tbalancer.policy();
                found.extend(scan_class("FTDI", || {
                    tbalancer::discover(Arc::clone(driver), policy).map(boxed)
                }));
            }
            (None, true) => debug!("No FTDI driver"),
            (_, false) => debug!("FTDI scan disabled"),
        }

        match (&self.backends.serial, discovery.serial) {
            (Some(bus), true) => {
                let policy = discovery.heatmaster.policy();
                // Ports already claimed by an FTDI device are not probed twice
                let mut ignore = discovery.ignore_ports.clone();
                ignore.extend(found.iter().map(|d| d.identity().location.clone()));
                found.extend(scan_class("Serial", || {
                    heatmaster::discover(bus.as_ref(), &ignore, policy).map(boxed)
                }));
            }
            (None, true) => debug!("No serial bus"),
            (_, false) => debug!("Serial scan disabled"),
        }

        match (&self.backends.hid, discovery.hid) {
            (Some(bus), true) => {
                let policy = discovery.kraken.policy();
                let timing = kraken::StreamTiming {
                    read_timeout: polling.stream_read_timeout(),
                    join_timeout: polling.poller_join_timeout(),
                    stale_cycles: polling.stream_stale_cycles,
                };
                found.extend(scan_class("HID", || {
                    kraken::discover(bus.as_ref(), policy, timing).map(boxed)
                }));
            }
            (None, true) => debug!("No HID bus"),
            (_, false) => debug!("HID scan disabled"),
        }

        let gpu = GpuBackends {
            nvidia: self.backends.gpu.nvidia.clone().filter(|_| discovery.nvidia),
            amd: self.backends.gpu.amd.clone().filter(|_| discovery.amd),
        };
        found.extend(scan_class("GPU", || Ok(enumerate_gpus(&gpu))));

        found
    }

    pub fn devices(&self) -> &[Box<dyn Device>] {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut [Box<dyn Device>] {
        &mut self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Refresh every active device
    pub fn update_all(&mut self) {
        for device in self.devices.iter_mut().filter(|d| d.is_active()) {
            device.update();
        }
    }

    /// Close and drop devices that reported a disconnect.
    ///
    /// Returns how many were removed.
    pub fn remove_disconnected(&mut self) -> usize {
        let before = self.devices.len();
        self.devices.retain_mut(|device| {
            if device.status() == DeviceStatus::Active {
                return true;
            }
            info!("Removing {} at {}", device.name(), device.identity().location);
            device.close();
            false
        });
        before - self.devices.len()
    }

    /// Close every device and clear the registry
    pub fn dispose_all(&mut self) {
        if self.devices.is_empty() {
            return;
        }
        debug!("Disposing {} device(s)", self.devices.len());
        for mut device in self.devices.drain(..) {
            device.close();
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.dispose_all();
    }
}
