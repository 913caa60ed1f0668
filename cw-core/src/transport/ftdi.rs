//! FTDI USB-serial bridges
//!
//! [`FtdiDriver`] models the D2XX functional interface: devices are opened by
//! index, every call returns an [`FtStatus`], and reads are driven by polling
//! the receive queue. [`VcpDriver`] implements it over the virtual COM ports
//! the kernel `ftdi_sio` driver creates.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use tracing::{debug, trace};

use super::serial::{PortInfo, SerialSettings};
use super::{closed_error, Transport};
use crate::constants::timing;
use crate::{CoolwatchError, Result};

/// FTDI USB vendor ID
pub const FTDI_VENDOR_ID: u16 = 0x0403;

/// D2XX status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FtStatus(pub u32);

impl FtStatus {
    pub const OK: FtStatus = FtStatus(0);
    pub const INVALID_HANDLE: FtStatus = FtStatus(1);
    pub const DEVICE_NOT_FOUND: FtStatus = FtStatus(2);
    pub const DEVICE_NOT_OPENED: FtStatus = FtStatus(3);
    pub const IO_ERROR: FtStatus = FtStatus(4);
    pub const INSUFFICIENT_RESOURCES: FtStatus = FtStatus(5);
    pub const INVALID_PARAMETER: FtStatus = FtStatus(6);
    pub const INVALID_BAUD_RATE: FtStatus = FtStatus(7);
    pub const OTHER_ERROR: FtStatus = FtStatus(18);

    /// The device went away underneath an open handle
    pub fn is_disconnect(&self) -> bool {
        matches!(
            *self,
            Self::INVALID_HANDLE | Self::DEVICE_NOT_FOUND | Self::IO_ERROR
        )
    }

    fn into_error(self, call: &'static str, target: &str) -> CoolwatchError {
        if self.is_disconnect() {
            CoolwatchError::Disconnected(format!("{}: {} returned {}", target, call, self))
        } else {
            CoolwatchError::sdk(call, self.0)
        }
    }
}

impl std::fmt::Display for FtStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FT_STATUS({})", self.0)
    }
}

pub type FtResult<T> = std::result::Result<T, FtStatus>;

/// Opaque driver handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FtHandle(pub u32);

/// Device list entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtDeviceInfo {
    pub index: u32,
    pub description: String,
    pub serial_number: String,
    /// Port name or USB location
    pub location: String,
}

/// Purge masks
pub mod purge {
    pub const RX: u32 = 1;
    pub const TX: u32 = 2;
    pub const BOTH: u32 = RX | TX;
}

/// D2XX word length / stop bits / parity codes
pub mod line {
    pub const BITS_8: u8 = 8;
    pub const STOP_BITS_1: u8 = 0;
    pub const STOP_BITS_2: u8 = 2;
    pub const PARITY_NONE: u8 = 0;
    pub const PARITY_ODD: u8 = 1;
    pub const PARITY_EVEN: u8 = 2;
}

/// Functional interface of an FTDI driver
pub trait FtdiDriver: Send + Sync {
    fn device_count(&self) -> FtResult<u32>;

    fn describe(&self, index: u32) -> FtResult<FtDeviceInfo>;

    fn open(&self, index: u32) -> FtResult<FtHandle>;

    fn set_baud_rate(&self, handle: FtHandle, baud_rate: u32) -> FtResult<()>;

    fn set_data_characteristics(
        &self,
        handle: FtHandle,
        word_length: u8,
        stop_bits: u8,
        parity: u8,
    ) -> FtResult<()>;

    fn purge(&self, handle: FtHandle, mask: u32) -> FtResult<()>;

    /// Bytes waiting in the receive queue
    fn queue_status(&self, handle: FtHandle) -> FtResult<u32>;

    fn read(&self, handle: FtHandle, buf: &mut [u8]) -> FtResult<usize>;

    fn write(&self, handle: FtHandle, data: &[u8]) -> FtResult<usize>;

    fn close(&self, handle: FtHandle) -> FtResult<()>;
}

fn line_codes(settings: &SerialSettings) -> (u8, u8, u8) {
    let word_length = match settings.data_bits {
        DataBits::Five => 5,
        DataBits::Six => 6,
        DataBits::Seven => 7,
        DataBits::Eight => line::BITS_8,
    };
    let stop_bits = match settings.stop_bits {
        StopBits::One => line::STOP_BITS_1,
        StopBits::Two => line::STOP_BITS_2,
    };
    let parity = match settings.parity {
        Parity::None => line::PARITY_NONE,
        Parity::Odd => line::PARITY_ODD,
        Parity::Even => line::PARITY_EVEN,
    };
    (word_length, stop_bits, parity)
}

/// One open FTDI device
pub struct FtdiSession {
    driver: Arc<dyn FtdiDriver>,
    handle: Option<FtHandle>,
    name: String,
}

impl FtdiSession {
    /// Open device `index` and apply the family's line settings.
    ///
    /// A handle whose configuration fails is closed before returning.
    pub fn open(driver: Arc<dyn FtdiDriver>, info: &FtDeviceInfo, settings: &SerialSettings) -> Result<Self> {
        let name = if info.location.is_empty() {
            format!("ftdi:{}", info.index)
        } else {
            info.location.clone()
        };
        let handle = driver
            .open(info.index)
            .map_err(|s| CoolwatchError::open_failure(&name, s.to_string()))?;

        let (word_length, stop_bits, parity) = line_codes(settings);
        let configured = driver
            .set_baud_rate(handle, settings.baud_rate)
            .and_then(|_| driver.set_data_characteristics(handle, word_length, stop_bits, parity));
        if let Err(status) = configured {
            let _ = driver.close(handle);
            return Err(CoolwatchError::open_failure(
                &name,
                format!("line configuration failed: {}", status),
            ));
        }

        trace!("Opened FTDI device {} at {} baud", name, settings.baud_rate);
        Ok(Self {
            driver,
            handle: Some(handle),
            name,
        })
    }

    fn handle(&self) -> Result<FtHandle> {
        self.handle.ok_or_else(|| closed_error(&self.name))
    }
}

impl Transport for FtdiSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let handle = self.handle()?;
        let written = self
            .driver
            .write(handle, data)
            .map_err(|s| s.into_error("FT_Write", &self.name))?;
        if written != data.len() {
            return Err(CoolwatchError::timeout(format!(
                "{}: wrote {} of {} bytes",
                self.name,
                written,
                data.len()
            )));
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let handle = self.handle()?;
        let deadline = Instant::now() + timeout;
        loop {
            let queued = self
                .driver
                .queue_status(handle)
                .map_err(|s| s.into_error("FT_GetQueueStatus", &self.name))?;
            if queued > 0 {
                let want = buf.len().min(queued as usize);
                let n = self
                    .driver
                    .read(handle, &mut buf[..want])
                    .map_err(|s| s.into_error("FT_Read", &self.name))?;
                if n > 0 {
                    return Ok(n);
                }
            }
            if Instant::now() >= deadline {
                return Err(CoolwatchError::timeout(format!("{}: no data", self.name)));
            }
            thread::sleep(timing::FTDI_QUEUE_POLL);
        }
    }

    fn bytes_to_read(&mut self) -> Result<usize> {
        let handle = self.handle()?;
        self.driver
            .queue_status(handle)
            .map(|n| n as usize)
            .map_err(|s| s.into_error("FT_GetQueueStatus", &self.name))
    }

    fn purge(&mut self) -> Result<()> {
        let handle = self.handle()?;
        self.driver
            .purge(handle, purge::BOTH)
            .map_err(|s| s.into_error("FT_Purge", &self.name))
    }

    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(status) = self.driver.close(handle) {
                debug!("FT_Close on {} returned {}", self.name, status);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.handle.is_none()
    }
}

impl Drop for FtdiSession {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Virtual COM port backend
// ============================================================================

struct VcpState {
    next_handle: u32,
    open: HashMap<u32, (String, Box<dyn SerialPort>)>,
}

/// [`FtdiDriver`] over FTDI virtual COM ports (VID 0x0403)
pub struct VcpDriver {
    state: Mutex<VcpState>,
}

impl Default for VcpDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl VcpDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(VcpState {
                next_handle: 1,
                open: HashMap::new(),
            }),
        }
    }

    fn ports() -> FtResult<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(|e| {
            debug!("Serial enumeration failed: {}", e.description);
            FtStatus::OTHER_ERROR
        })?;
        Ok(ports
            .into_iter()
            .map(PortInfo::from)
            .filter(|p| p.vendor_id == Some(FTDI_VENDOR_ID))
            .collect())
    }
}

fn serial_status(err: serialport::Error) -> FtStatus {
    match err.kind {
        serialport::ErrorKind::NoDevice => FtStatus::DEVICE_NOT_FOUND,
        serialport::ErrorKind::InvalidInput => FtStatus::INVALID_PARAMETER,
        _ => FtStatus::IO_ERROR,
    }
}

impl FtdiDriver for VcpDriver {
    fn device_count(&self) -> FtResult<u32> {
        Ok(Self::ports()?.len() as u32)
    }

    fn describe(&self, index: u32) -> FtResult<FtDeviceInfo> {
        let port = Self::ports()?
            .into_iter()
            .nth(index as usize)
            .ok_or(FtStatus::DEVICE_NOT_FOUND)?;
        Ok(FtDeviceInfo {
            index,
            description: port.description.unwrap_or_default(),
            serial_number: port.serial_number.unwrap_or_default(),
            location: port.name,
        })
    }

    fn open(&self, index: u32) -> FtResult<FtHandle> {
        let info = self.describe(index)?;
        let port = serialport::new(&info.location, 9600)
            .timeout(Duration::from_millis(1))
            .open()
            .map_err(serial_status)?;

        let mut state = self.state.lock();
        let handle = state.next_handle;
        state.next_handle = state.next_handle.wrapping_add(1).max(1);
        state.open.insert(handle, (info.location, port));
        Ok(FtHandle(handle))
    }

    fn set_baud_rate(&self, handle: FtHandle, baud_rate: u32) -> FtResult<()> {
        let mut state = self.state.lock();
        let (_, port) = state.open.get_mut(&handle.0).ok_or(FtStatus::INVALID_HANDLE)?;
        port.set_baud_rate(baud_rate)
            .map_err(|_| FtStatus::INVALID_BAUD_RATE)
    }

    fn set_data_characteristics(
        &self,
        handle: FtHandle,
        word_length: u8,
        stop_bits: u8,
        parity: u8,
    ) -> FtResult<()> {
        let data_bits = match word_length {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            line::BITS_8 => DataBits::Eight,
            _ => return Err(FtStatus::INVALID_PARAMETER),
        };
        let stop_bits = match stop_bits {
            line::STOP_BITS_1 => StopBits::One,
            line::STOP_BITS_2 => StopBits::Two,
            _ => return Err(FtStatus::INVALID_PARAMETER),
        };
        let parity = match parity {
            line::PARITY_NONE => Parity::None,
            line::PARITY_ODD => Parity::Odd,
            line::PARITY_EVEN => Parity::Even,
            _ => return Err(FtStatus::INVALID_PARAMETER),
        };

        let mut state = self.state.lock();
        let (_, port) = state.open.get_mut(&handle.0).ok_or(FtStatus::INVALID_HANDLE)?;
        port.set_data_bits(data_bits)
            .and_then(|_| port.set_stop_bits(stop_bits))
            .and_then(|_| port.set_parity(parity))
            .map_err(serial_status)
    }

    fn purge(&self, handle: FtHandle, mask: u32) -> FtResult<()> {
        let buffer = match mask & purge::BOTH {
            purge::RX => ClearBuffer::Input,
            purge::TX => ClearBuffer::Output,
            _ => ClearBuffer::All,
        };
        let mut state = self.state.lock();
        let (_, port) = state.open.get_mut(&handle.0).ok_or(FtStatus::INVALID_HANDLE)?;
        port.clear(buffer).map_err(serial_status)
    }

    fn queue_status(&self, handle: FtHandle) -> FtResult<u32> {
        let mut state = self.state.lock();
        let (_, port) = state.open.get_mut(&handle.0).ok_or(FtStatus::INVALID_HANDLE)?;
        port.bytes_to_read().map_err(serial_status)
    }

    fn read(&self, handle: FtHandle, buf: &mut [u8]) -> FtResult<usize> {
        let mut state = self.state.lock();
        let (_, port) = state.open.get_mut(&handle.0).ok_or(FtStatus::INVALID_HANDLE)?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            // Timeouts surface as an empty read, like D2XX
            Err(e) if matches!(e.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock) => Ok(0),
            Err(_) => Err(FtStatus::IO_ERROR),
        }
    }

    fn write(&self, handle: FtHandle, data: &[u8]) -> FtResult<usize> {
        let mut state = self.state.lock();
        let (_, port) = state.open.get_mut(&handle.0).ok_or(FtStatus::INVALID_HANDLE)?;
        port.write_all(data)
            .and_then(|_| port.flush())
            .map(|_| data.len())
            .map_err(|_| FtStatus::IO_ERROR)
    }

    fn close(&self, handle: FtHandle) -> FtResult<()> {
        let removed = self.state.lock().open.remove(&handle.0);
        match removed {
            Some((location, _port)) => {
                trace!("Closed FTDI port {}", location);
                Ok(())
            }
            None => Err(FtStatus::INVALID_HANDLE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// One-device driver with a scripted receive queue
    #[derive(Default)]
    struct QueueDriver {
        rx: Mutex<VecDeque<u8>>,
        closes: AtomicUsize,
        fail_baud: bool,
    }

    impl FtdiDriver for QueueDriver {
        fn device_count(&self) -> FtResult<u32> {
            Ok(1)
        }
        fn describe(&self, index: u32) -> FtResult<FtDeviceInfo> {
            Ok(FtDeviceInfo {
                index,
                description: "FT232R".to_string(),
                serial_number: "A1".to_string(),
                location: String::new(),
            })
        }
        fn open(&self, _index: u32) -> FtResult<FtHandle> {
            Ok(FtHandle(7))
        }
        fn set_baud_rate(&self, _h: FtHandle, _baud: u32) -> FtResult<()> {
            if self.fail_baud {
                Err(FtStatus::INVALID_BAUD_RATE)
            } else {
                Ok(())
            }
        }
        fn set_data_characteristics(&self, _h: FtHandle, _w: u8, _s: u8, _p: u8) -> FtResult<()> {
            Ok(())
        }
        fn purge(&self, _h: FtHandle, _mask: u32) -> FtResult<()> {
            self.rx.lock().clear();
            Ok(())
        }
        fn queue_status(&self, _h: FtHandle) -> FtResult<u32> {
            Ok(self.rx.lock().len() as u32)
        }
        fn read(&self, _h: FtHandle, buf: &mut [u8]) -> FtResult<usize> {
            let mut rx = self.rx.lock();
            let n = buf.len().min(rx.len());
            for slot in buf.iter_mut().take(n) {
                *slot = rx.pop_front().unwrap_or_default();
            }
            Ok(n)
        }
        fn write(&self, _h: FtHandle, data: &[u8]) -> FtResult<usize> {
            Ok(data.len())
        }
        fn close(&self, _h: FtHandle) -> FtResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn info() -> FtDeviceInfo {
        FtDeviceInfo {
            index: 0,
            description: "FT232R".to_string(),
            serial_number: "A1".to_string(),
            location: String::new(),
        }
    }

    #[test]
    fn test_read_times_out_on_empty_queue() {
        let driver = Arc::new(QueueDriver::default());
        let mut session =
            FtdiSession::open(driver, &info(), &SerialSettings::eight_n_one(19200)).unwrap();
        let started = Instant::now();
        let mut buf = [0u8; 4];
        let err = session.read(&mut buf, Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, CoolwatchError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_read_returns_queued_bytes() {
        let driver = Arc::new(QueueDriver::default());
        driver.rx.lock().extend([1u8, 2, 3]);
        let mut session =
            FtdiSession::open(driver, &info(), &SerialSettings::eight_n_one(19200)).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(session.read(&mut buf, Duration::from_millis(30)).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(session.name(), "ftdi:0");
    }

    #[test]
    fn test_failed_configuration_closes_handle() {
        let driver = Arc::new(QueueDriver {
            fail_baud: true,
            ..Default::default()
        });
        let result = FtdiSession::open(driver.clone(), &info(), &SerialSettings::eight_n_one(19200));
        assert!(matches!(result, Err(CoolwatchError::OpenFailure { .. })));
        assert_eq!(driver.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let driver = Arc::new(QueueDriver::default());
        let mut session =
            FtdiSession::open(driver.clone(), &info(), &SerialSettings::eight_n_one(19200)).unwrap();
        session.close();
        session.close();
        drop(session);
        assert_eq!(driver.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disconnect_statuses() {
        assert!(FtStatus::IO_ERROR.is_disconnect());
        assert!(!FtStatus::INVALID_PARAMETER.is_disconnect());
        assert!(FtStatus::DEVICE_NOT_FOUND.into_error("FT_Read", "x").is_fatal());
    }
}
