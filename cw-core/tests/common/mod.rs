//! Scripted hardware for integration tests
//!
//! A [`Script`] is the device end of a link: bytes it will send, replies
//! queued per host write, and counters the tests inspect after the fact.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use cw_core::transport::{
    FtDeviceInfo, FtHandle, FtStatus, FtdiDriver, HidBus, HidDeviceInfo, PortInfo, SerialBus,
    SerialSettings, Transport,
};
use cw_core::{CoolwatchError, Result};

pub type FtResult<T> = std::result::Result<T, FtStatus>;

#[derive(Default)]
pub struct Script {
    /// Bytes waiting to be read by the host
    pub pending: VecDeque<u8>,
    /// Queued into `pending` one per host write
    pub replies: VecDeque<Vec<u8>>,
    /// Queued when `replies` is exhausted
    pub default_reply: Option<Vec<u8>>,
    /// Returned by every read once `pending` is empty (streaming devices)
    pub stream: Option<Vec<u8>>,
    /// Sequence number written into byte 2.. of each streamed report
    pub stream_counter: u8,
    pub written: Vec<Vec<u8>>,
    pub opens: usize,
    pub closes: usize,
    pub disconnected: bool,
}

impl Script {
    fn on_write(&mut self, data: &[u8]) {
        self.written.push(data.to_vec());
        if let Some(reply) = self.replies.pop_front().or_else(|| self.default_reply.clone()) {
            self.pending.extend(reply);
        }
    }

    fn drain(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.pending.pop_front().unwrap_or_default();
        }
        n
    }
}

pub type ScriptHandle = Arc<Mutex<Script>>;

pub fn script() -> ScriptHandle {
    Arc::new(Mutex::new(Script::default()))
}

/// Host end of a scripted link
pub struct ScriptedTransport {
    name: String,
    script: ScriptHandle,
    closed: bool,
}

impl ScriptedTransport {
    pub fn new(name: &str, script: ScriptHandle) -> Self {
        script.lock().opens += 1;
        Self {
            name: name.to_string(),
            script,
            closed: false,
        }
    }

    fn check(&self) -> Result<()> {
        if self.closed {
            return Err(CoolwatchError::DeviceClosed(self.name.clone()));
        }
        if self.script.lock().disconnected {
            return Err(CoolwatchError::Disconnected(self.name.clone()));
        }
        Ok(())
    }
}

impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.check()?;
        self.script.lock().on_write(data);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.check()?;
        {
            let mut script = self.script.lock();
            if !script.pending.is_empty() {
                return Ok(script.drain(buf));
            }
            if let Some(mut report) = script.stream.clone() {
                script.stream_counter = script.stream_counter.wrapping_add(1);
                let counter = script.stream_counter;
                for byte in report.iter_mut().skip(2) {
                    *byte = counter;
                }
                let n = buf.len().min(report.len());
                buf[..n].copy_from_slice(&report[..n]);
                return Ok(n);
            }
        }
        thread::sleep(timeout.min(Duration::from_millis(5)));
        Err(CoolwatchError::timeout(format!("{}: silent", self.name)))
    }

    fn bytes_to_read(&mut self) -> Result<usize> {
        self.check()?;
        Ok(self.script.lock().pending.len())
    }

    fn purge(&mut self) -> Result<()> {
        self.check()?;
        self.script.lock().pending.clear();
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.script.lock().closes += 1;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

// ============================================================================
// Serial
// ============================================================================

/// Serial ports; a port without a script fails to open
#[derive(Default)]
pub struct FakeSerialBus {
    pub ports: Vec<(String, Option<ScriptHandle>)>,
}

impl FakeSerialBus {
    pub fn with_port(mut self, name: &str, script: Option<ScriptHandle>) -> Self {
        self.ports.push((name.to_string(), script));
        self
    }
}

impl SerialBus for FakeSerialBus {
    fn ports(&self) -> Result<Vec<PortInfo>> {
        Ok(self.ports.iter().map(|(name, _)| PortInfo::named(name.as_str())).collect())
    }

    fn open(&self, port: &str, _settings: &SerialSettings) -> Result<Box<dyn Transport>> {
        match self.ports.iter().find(|(name, _)| name == port) {
            Some((name, Some(script))) => Ok(Box::new(ScriptedTransport::new(name, Arc::clone(script)))),
            _ => Err(CoolwatchError::open_failure(port, "busy")),
        }
    }
}

// ============================================================================
// FTDI
// ============================================================================

/// FTDI driver whose device `i` is `devices[i]`
#[derive(Default)]
pub struct FakeFtdiDriver {
    pub devices: Vec<ScriptHandle>,
    /// `device_count` fails, as when the driver is not installed
    pub missing: bool,
}

impl FakeFtdiDriver {
    fn script(&self, handle: FtHandle) -> FtResult<&ScriptHandle> {
        self.devices.get(handle.0 as usize).ok_or(FtStatus::INVALID_HANDLE)
    }

    fn live(&self, handle: FtHandle) -> FtResult<&ScriptHandle> {
        let script = self.script(handle)?;
        if script.lock().disconnected {
            return Err(FtStatus::IO_ERROR);
        }
        Ok(script)
    }
}

impl FtdiDriver for FakeFtdiDriver {
    fn device_count(&self) -> FtResult<u32> {
        if self.missing {
            return Err(FtStatus::OTHER_ERROR);
        }
        Ok(self.devices.len() as u32)
    }

    fn describe(&self, index: u32) -> FtResult<FtDeviceInfo> {
        self.devices.get(index as usize).ok_or(FtStatus::DEVICE_NOT_FOUND)?;
        Ok(FtDeviceInfo {
            index,
            description: "FT232R USB UART".to_string(),
            serial_number: format!("TB{:04}", index),
            location: format!("/dev/ttyUSB{}", index),
        })
    }

    fn open(&self, index: u32) -> FtResult<FtHandle> {
        let handle = FtHandle(index);
        self.script(handle)?.lock().opens += 1;
        Ok(handle)
    }

    fn set_baud_rate(&self, _handle: FtHandle, _baud_rate: u32) -> FtResult<()> {
        Ok(())
    }

    fn set_data_characteristics(&self, _h: FtHandle, _w: u8, _s: u8, _p: u8) -> FtResult<()> {
        Ok(())
    }

    fn purge(&self, handle: FtHandle, _mask: u32) -> FtResult<()> {
        self.live(handle)?.lock().pending.clear();
        Ok(())
    }

    fn queue_status(&self, handle: FtHandle) -> FtResult<u32> {
        Ok(self.live(handle)?.lock().pending.len() as u32)
    }

    fn read(&self, handle: FtHandle, buf: &mut [u8]) -> FtResult<usize> {
        Ok(self.live(handle)?.lock().drain(buf))
    }

    fn write(&self, handle: FtHandle, data: &[u8]) -> FtResult<usize> {
        self.live(handle)?.lock().on_write(data);
        Ok(data.len())
    }

    fn close(&self, handle: FtHandle) -> FtResult<()> {
        self.script(handle)?.lock().closes += 1;
        Ok(())
    }
}

// ============================================================================
// HID
// ============================================================================

#[derive(Default)]
pub struct FakeHidBus {
    pub devices: Vec<(HidDeviceInfo, ScriptHandle)>,
}

impl FakeHidBus {
    pub fn with_device(mut self, vendor_id: u16, product_id: u16, script: ScriptHandle) -> Self {
        let path = format!("/dev/hidraw{}", self.devices.len());
        self.devices.push((
            HidDeviceInfo {
                path,
                vendor_id,
                product_id,
                product: None,
                serial_number: None,
            },
            script,
        ));
        self
    }
}

impl HidBus for FakeHidBus {
    fn devices(&self, vendor_id: u16) -> Result<Vec<HidDeviceInfo>> {
        Ok(self
            .devices
            .iter()
            .filter(|(info, _)| info.vendor_id == vendor_id)
            .map(|(info, _)| info.clone())
            .collect())
    }

    fn open(&self, info: &HidDeviceInfo) -> Result<Box<dyn Transport>> {
        self.devices
            .iter()
            .find(|(candidate, _)| candidate.path == info.path)
            .map(|(_, script)| Box::new(ScriptedTransport::new(&info.path, Arc::clone(script))) as Box<dyn Transport>)
            .ok_or_else(|| CoolwatchError::open_failure(&info.path, "gone"))
    }
}

// ============================================================================
// Device scripts
// ============================================================================

/// A 285-byte T-Balancer status record
pub fn tbalancer_record(revision: u8) -> Vec<u8> {
    let mut frame = vec![0u8; 285];
    frame[0] = 100;
    frame[274] = revision;
    frame[238] = 80; // digital sensor 1: 40.0 C
    frame[136] = 0b0011;
    frame[150] = 0x03;
    frame[151] = 0xE8; // fan 1: 1000 rpm
    frame[152] = 0x05;
    frame[153] = 0xDC; // fan 2: 1500 rpm
    frame[88] = 40;
    frame
}

pub fn heatmaster_line(device: u8, field: char, value: &str) -> Vec<u8> {
    format!("-[0:{}]R{}:{}\r\n", device, field, value).into_bytes()
}

/// A Heatmaster with one fan and one temperature probe reporting `revision`
pub fn heatmaster_script(revision: &str) -> ScriptHandle {
    let handle = script();
    {
        let mut s = handle.lock();
        s.replies.extend([
            vec![0xAA],
            heatmaster_line(0, 'H', revision),
            heatmaster_line(0, 'V', "21"),
            heatmaster_line(0, 'C', "51966"),
            heatmaster_line(32, '?', "1"),
            heatmaster_line(33, 'N', "Radiator"),
            heatmaster_line(48, '?', "1"),
            heatmaster_line(64, '?', "0"),
            heatmaster_line(80, '?', "0"),
            heatmaster_line(33, 'R', "1100"),
            heatmaster_line(33, 'P', "50"),
            heatmaster_line(49, 'T', "2850"),
        ]);
    }
    handle
}

/// A streaming Kraken Z3 status report (bytes from 2 on are overwritten per read)
pub fn kraken_status() -> Vec<u8> {
    let mut frame = vec![0u8; 64];
    frame[0] = 0x75;
    frame[1] = 0x02;
    frame
}
