//! RS-232 sessions over the `serialport` crate

use std::io::{Read, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, SerialPortType, StopBits};
use tracing::{debug, trace};

use super::{closed_error, Transport};
use crate::{CoolwatchError, Result};

/// Line settings of a serial family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl SerialSettings {
    /// 8 data bits, no parity, 1 stop bit
    pub const fn eight_n_one(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

/// An enumerated serial port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub name: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub serial_number: Option<String>,
    pub description: Option<String>,
}

impl PortInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vendor_id: None,
            product_id: None,
            serial_number: None,
            description: None,
        }
    }
}

impl From<serialport::SerialPortInfo> for PortInfo {
    fn from(info: serialport::SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                vendor_id: Some(usb.vid),
                product_id: Some(usb.pid),
                serial_number: usb.serial_number,
                description: usb.product,
            },
            _ => Self::named(info.port_name),
        }
    }
}

/// Serial port enumeration and opening
pub trait SerialBus: Send + Sync {
    fn ports(&self) -> Result<Vec<PortInfo>>;

    fn open(&self, port: &str, settings: &SerialSettings) -> Result<Box<dyn Transport>>;
}

/// Map a `serialport` error raised on `target` into the error taxonomy
pub(crate) fn map_serial_error(target: &str, err: serialport::Error) -> CoolwatchError {
    match err.kind {
        serialport::ErrorKind::NoDevice => {
            CoolwatchError::Disconnected(format!("{}: {}", target, err.description))
        }
        serialport::ErrorKind::Io(kind) => {
            CoolwatchError::from_io(target, std::io::Error::new(kind, err.description))
        }
        _ => {
            CoolwatchError::generic(format!("{}: {}", target, err.description))
        }
    }
}

/// Ports of the running system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSerialBus;

impl SerialBus for SystemSerialBus {
    fn ports(&self) -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(|e| {
            CoolwatchError::TransportUnavailable(format!("serial enumeration: {}", e.description))
        })?;
        debug!("Found {} serial port(s)", ports.len());
        Ok(ports.into_iter().map(PortInfo::from).collect())
    }

    fn open(&self, port: &str, settings: &SerialSettings) -> Result<Box<dyn Transport>> {
        Ok(Box::new(SerialSession::open(port, settings)?))
    }
}

/// One open serial port
pub struct SerialSession {
    name: String,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialSession {
    pub fn open(port: &str, settings: &SerialSettings) -> Result<Self> {
        let handle = serialport::new(port, settings.baud_rate)
            .data_bits(settings.data_bits)
            .parity(settings.parity)
            .stop_bits(settings.stop_bits)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| CoolwatchError::open_failure(port, e.description))?;
        trace!("Opened {} at {} baud", port, settings.baud_rate);
        Ok(Self {
            name: port.to_string(),
            port: Some(handle),
        })
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        match self.port.as_mut() {
            Some(port) => Ok(port),
            None => Err(closed_error(&self.name)),
        }
    }
}

impl Transport for SerialSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let name = self.name.clone();
        let port = self.port()?;
        port.write_all(data)
            .and_then(|_| port.flush())
            .map_err(|e| CoolwatchError::from_io(&name, e))
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let name = self.name.clone();
        let port = self.port()?;
        port.set_timeout(timeout.max(Duration::from_millis(1)))
            .map_err(|e| map_serial_error(&name, e))?;
        match port.read(buf) {
            Ok(0) => Err(CoolwatchError::timeout(format!("{}: no data", name))),
            Ok(n) => Ok(n),
            Err(e) => Err(CoolwatchError::from_io(&name, e)),
        }
    }

    fn bytes_to_read(&mut self) -> Result<usize> {
        let name = self.name.clone();
        let port = self.port()?;
        port.bytes_to_read()
            .map(|n| n as usize)
            .map_err(|e| map_serial_error(&name, e))
    }

    fn purge(&mut self) -> Result<()> {
        let name = self.name.clone();
        let port = self.port()?;
        port.clear(ClearBuffer::All)
            .map_err(|e| map_serial_error(&name, e))
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            trace!("Closed {}", self.name);
        }
    }

    fn is_closed(&self) -> bool {
        self.port.is_none()
    }
}

impl Drop for SerialSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_port_info_conversion() {
        let info = serialport::SerialPortInfo {
            port_name: "/dev/ttyUSB0".to_string(),
            port_type: SerialPortType::UsbPort(serialport::UsbPortInfo {
                vid: 0x0403,
                pid: 0x6001,
                serial_number: Some("TB123".to_string()),
                manufacturer: Some("FTDI".to_string()),
                product: Some("bigNG".to_string()),
            }),
        };
        let port = PortInfo::from(info);
        assert_eq!(port.vendor_id, Some(0x0403));
        assert_eq!(port.serial_number.as_deref(), Some("TB123"));
    }

    #[test]
    fn test_disconnect_kinds_are_fatal() {
        let err = map_serial_error(
            "/dev/ttyS3",
            serialport::Error::new(serialport::ErrorKind::NoDevice, "gone"),
        );
        assert!(err.is_fatal());
        let err = map_serial_error(
            "/dev/ttyS3",
            serialport::Error::new(serialport::ErrorKind::Io(std::io::ErrorKind::TimedOut), "slow"),
        );
        assert!(err.is_transient());
    }

    #[test]
    fn test_open_missing_port_is_open_failure() {
        let err = SerialSession::open("/dev/coolwatch-missing", &SerialSettings::eight_n_one(38400))
            .err()
            .expect("open should fail");
        assert!(matches!(err, CoolwatchError::OpenFailure { .. }));
    }
}
