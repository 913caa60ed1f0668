//! Transport sessions
//!
//! A [`Transport`] owns one open handle (serial port, FTDI device or HID
//! stream) and exposes raw byte exchange with bounded waits. Every session is
//! exclusively owned by one device and released exactly once through
//! [`Transport::close`].
//!
//! # Module Structure
//!
//! - `serial` - RS-232 ports via the `serialport` crate
//! - `ftdi` - D2XX-style driver interface and a virtual-COM-port backend
//! - `hid` - USB-HID streams via `hidapi` (feature `hid`)

pub mod ftdi;
pub mod hid;
pub mod serial;

pub use ftdi::{FtDeviceInfo, FtHandle, FtStatus, FtdiDriver, FtdiSession, VcpDriver};
pub use hid::{HidBus, HidDeviceInfo};
pub use serial::{PortInfo, SerialBus, SerialSession, SerialSettings, SystemSerialBus};

#[cfg(feature = "hid")]
pub use hid::{HidSession, SystemHidBus};

use std::time::{Duration, Instant};

use crate::{CoolwatchError, Result};

/// Raw byte exchange over one open handle
pub trait Transport: Send {
    /// Port name, HID path or driver location
    fn name(&self) -> &str;

    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever is available, waiting at most `timeout` for the first byte.
    ///
    /// Returns at least one byte or [`CoolwatchError::Timeout`].
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Bytes queued for reading without blocking
    fn bytes_to_read(&mut self) -> Result<usize>;

    /// Discard pending input and output
    fn purge(&mut self) -> Result<()>;

    fn get_feature_report(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(CoolwatchError::NotSupported(format!(
            "{}: feature reports",
            self.name()
        )))
    }

    fn send_feature_report(&mut self, _data: &[u8]) -> Result<()> {
        Err(CoolwatchError::NotSupported(format!(
            "{}: feature reports",
            self.name()
        )))
    }

    /// Release the handle; later calls are no-ops
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

impl std::fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub(crate) fn closed_error(name: &str) -> CoolwatchError {
    CoolwatchError::DeviceClosed(name.to_string())
}

/// Fill `buf` completely before `timeout` elapses.
///
/// Nothing received is a [`CoolwatchError::Timeout`]; a partial record is a
/// [`CoolwatchError::ShortRead`].
pub fn read_exact_within(transport: &mut dyn Transport, buf: &mut [u8], timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut filled = 0;

    while filled < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match transport.read(&mut buf[filled..], remaining) {
            Ok(n) => filled += n,
            Err(CoolwatchError::Timeout(_)) => break,
            Err(e) => return Err(e),
        }
    }

    match filled {
        n if n == buf.len() => Ok(()),
        0 => Err(CoolwatchError::timeout(format!(
            "{}: no data within {:?}",
            transport.name(),
            timeout
        ))),
        actual => Err(CoolwatchError::ShortRead {
            expected: buf.len(),
            actual,
        }),
    }
}

/// Purge, send `request`, and read a fixed-length response
pub fn exchange(
    transport: &mut dyn Transport,
    request: &[u8],
    response_len: usize,
    timeout: Duration,
) -> Result<Vec<u8>> {
    transport.purge()?;
    transport.write(request)?;
    let mut response = vec![0u8; response_len];
    read_exact_within(transport, &mut response, timeout)?;
    Ok(response)
}

/// Longest line accepted from a line-oriented device
const MAX_LINE_LEN: usize = 256;

/// Read one CR/LF-terminated ASCII line, terminator stripped.
///
/// Leading blank lines are skipped.
pub fn read_line(transport: &mut dyn Transport, timeout: Duration) -> Result<String> {
    let deadline = Instant::now() + timeout;
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CoolwatchError::timeout(format!(
                "{}: incomplete line after {:?}",
                transport.name(),
                timeout
            )));
        }
        transport.read(&mut byte, remaining)?;
        match byte[0] {
            b'\r' | b'\n' if line.is_empty() => continue,
            b'\r' | b'\n' => break,
            b => line.push(b),
        }
        if line.len() > MAX_LINE_LEN {
            return Err(CoolwatchError::MalformedFrame(format!(
                "{}: line exceeds {} bytes",
                transport.name(),
                MAX_LINE_LEN
            )));
        }
    }

    Ok(String::from_utf8_lossy(&line).into_owned())
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transport for unit tests

    use super::*;
    use std::collections::VecDeque;

    /// Replies queued per write; reads drain `pending`
    #[derive(Default)]
    pub struct MemoryTransport {
        pub pending: VecDeque<u8>,
        pub replies: VecDeque<Vec<u8>>,
        pub written: Vec<Vec<u8>>,
        pub closed: bool,
        pub close_count: usize,
    }

    impl MemoryTransport {
        pub fn with_input(bytes: &[u8]) -> Self {
            Self {
                pending: bytes.iter().copied().collect(),
                ..Default::default()
            }
        }

        pub fn reply(mut self, bytes: &[u8]) -> Self {
            self.replies.push_back(bytes.to_vec());
            self
        }
    }

    impl Transport for MemoryTransport {
        fn name(&self) -> &str {
            "memory"
        }

        fn write(&mut self, data: &[u8]) -> Result<()> {
            if self.closed {
                return Err(closed_error("memory"));
            }
            self.written.push(data.to_vec());
            if let Some(reply) = self.replies.pop_front() {
                self.pending.extend(reply);
            }
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            if self.closed {
                return Err(closed_error("memory"));
            }
            if self.pending.is_empty() {
                return Err(CoolwatchError::timeout("memory: empty"));
            }
            let n = buf.len().min(self.pending.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.pending.pop_front().unwrap_or_default();
            }
            Ok(n)
        }

        fn bytes_to_read(&mut self) -> Result<usize> {
            Ok(self.pending.len())
        }

        fn purge(&mut self) -> Result<()> {
            self.pending.clear();
            Ok(())
        }

        fn close(&mut self) {
            if !self.closed {
                self.close_count += 1;
            }
            self.closed = true;
        }

        fn is_closed(&self) -> bool {
            self.closed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryTransport;
    use super::*;

    #[test]
    fn test_read_exact_reports_short_read() {
        let mut t = MemoryTransport::with_input(&[1, 2, 3]);
        let mut buf = [0u8; 5];
        match read_exact_within(&mut t, &mut buf, Duration::from_millis(20)) {
            Err(CoolwatchError::ShortRead { expected, actual }) => {
                assert_eq!((expected, actual), (5, 3));
            }
            other => panic!("expected ShortRead, got {:?}", other),
        }
    }

    #[test]
    fn test_read_exact_empty_is_timeout() {
        let mut t = MemoryTransport::default();
        let mut buf = [0u8; 4];
        let err = read_exact_within(&mut t, &mut buf, Duration::from_millis(20)).unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, CoolwatchError::Timeout(_)));
    }

    #[test]
    fn test_exchange_purges_stale_input() {
        let mut t = MemoryTransport::with_input(&[0xEE, 0xEE]).reply(&[7, 8]);
        let response = exchange(&mut t, &[0x38], 2, Duration::from_millis(20)).unwrap();
        assert_eq!(response, vec![7, 8]);
        assert_eq!(t.written, vec![vec![0x38]]);
    }

    #[test]
    fn test_read_line_skips_blank_lines() {
        let mut t = MemoryTransport::with_input(b"\r\n-[0:0]RH:770\r\nnext");
        assert_eq!(read_line(&mut t, Duration::from_millis(50)).unwrap(), "-[0:0]RH:770");
    }

    #[test]
    fn test_default_feature_reports_unsupported() {
        let mut t = MemoryTransport::default();
        assert!(matches!(
            t.send_feature_report(&[0]),
            Err(CoolwatchError::NotSupported(_))
        ));
    }
}
