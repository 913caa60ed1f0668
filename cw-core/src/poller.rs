//! Background reader for streaming transports
//!
//! Devices that push unsolicited reports (HID coolers) get one dedicated
//! thread that owns the transport, reads with a bounded wait, and publishes
//! the most recent accepted frame. The shared slot is locked only for the
//! frame copy; decoding happens on the caller's thread.
//!
//! State machine per read: `Idle -> Reading -> Idle | TimedOut`, ending in
//! `Disposed` once the thread has released the transport.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::transport::Transport;
use crate::{CoolwatchError, Result};

/// Largest report a streaming device sends
pub const MAX_FRAME_LEN: usize = 64;

/// Pause after a non-timeout read error before the next attempt
const ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// One fixed-size raw report, copied by value
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    bytes: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl RawFrame {
    /// Copy `data`, truncated to [`MAX_FRAME_LEN`]
    pub fn from_slice(data: &[u8]) -> Self {
        let len = data.len().min(MAX_FRAME_LEN);
        let mut bytes = [0u8; MAX_FRAME_LEN];
        bytes[..len].copy_from_slice(&data[..len]);
        Self { bytes, len }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RawFrame({:02X?})", self.as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PollerState {
    Idle = 0,
    Reading = 1,
    TimedOut = 2,
    Disposed = 3,
}

impl PollerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => PollerState::Idle,
            1 => PollerState::Reading,
            2 => PollerState::TimedOut,
            _ => PollerState::Disposed,
        }
    }
}

/// Predicate selecting which reports are kept
pub type FrameFilter = fn(&[u8]) -> bool;

/// State shared between the reader thread and the foreground
struct Shared {
    latest: Mutex<Option<RawFrame>>,
    stop: AtomicBool,
    disconnected: AtomicBool,
    frames: AtomicU64,
    state: AtomicU8,
}

impl Shared {
    fn set_state(&self, state: PollerState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Foreground view of a poller's latest frame
#[derive(Clone)]
pub struct FrameReader {
    shared: Arc<Shared>,
}

impl FrameReader {
    /// Most recent accepted frame, copied out under the lock
    pub fn latest(&self) -> Option<RawFrame> {
        *self.shared.latest.lock()
    }

    /// The reader thread hit a disconnect and exited
    pub fn is_disconnected(&self) -> bool {
        self.shared.disconnected.load(Ordering::Acquire)
    }

    pub fn frames_received(&self) -> u64 {
        self.shared.frames.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PollerState {
        PollerState::from_u8(self.shared.state.load(Ordering::Acquire))
    }
}

/// A running reader thread that owns its transport
pub struct BackgroundPoller {
    name: String,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
    done: Option<mpsc::Receiver<()>>,
    join_timeout: Duration,
}

impl BackgroundPoller {
    /// Move `transport` onto a new reader thread.
    ///
    /// The thread closes the transport itself when it exits, so no read can
    /// race a released handle.
    pub fn spawn(
        name: &str,
        transport: Box<dyn Transport>,
        read_timeout: Duration,
        join_timeout: Duration,
        accept: FrameFilter,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            latest: Mutex::new(None),
            stop: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            frames: AtomicU64::new(0),
            state: AtomicU8::new(PollerState::Idle as u8),
        });
        let (done_tx, done_rx) = mpsc::channel();

        let thread_shared = Arc::clone(&shared);
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("poll {}", name))
            .spawn(move || {
                read_loop(&thread_name, transport, read_timeout, accept, &thread_shared);
                let _ = done_tx.send(());
            })
            .map_err(CoolwatchError::Io)?;

        debug!(device = name, "Background poller started");
        Ok(Self {
            name: name.to_string(),
            shared,
            handle: Some(handle),
            done: Some(done_rx),
            join_timeout,
        })
    }

    pub fn reader(&self) -> FrameReader {
        FrameReader {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn latest(&self) -> Option<RawFrame> {
        *self.shared.latest.lock()
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.disconnected.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Signal the thread and wait up to the join timeout.
    ///
    /// A thread stuck in a driver call past the timeout is detached; it still
    /// owns the transport and releases it when the call returns.
    pub fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::Release);

        let exited = match self.done.take() {
            Some(done) => match done.recv_timeout(self.join_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
                Err(RecvTimeoutError::Timeout) => false,
            },
            None => true,
        };

        if exited {
            if handle.join().is_err() {
                warn!(device = %self.name, "Poller thread panicked");
            }
            debug!(device = %self.name, "Background poller stopped");
        } else {
            warn!(
                device = %self.name,
                "Poller did not exit within {:?}; detaching",
                self.join_timeout
            );
        }
    }
}

impl Drop for BackgroundPoller {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop(
    name: &str,
    mut transport: Box<dyn Transport>,
    read_timeout: Duration,
    accept: FrameFilter,
    shared: &Shared,
) {
    let mut buf = [0u8; MAX_FRAME_LEN];

    while !shared.stop.load(Ordering::Acquire) {
        shared.set_state(PollerState::Reading);
        match transport.read(&mut buf, read_timeout) {
            Ok(n) => {
                let report = &buf[..n];
                if accept(report) {
                    let frame = RawFrame::from_slice(report);
                    *shared.latest.lock() = Some(frame);
                    shared.frames.fetch_add(1, Ordering::Release);
                } else {
                    trace!(device = name, "Skipping report {:02X?}", report.first());
                }
                shared.set_state(PollerState::Idle);
            }
            Err(CoolwatchError::Timeout(_)) => {
                shared.set_state(PollerState::TimedOut);
            }
            Err(e) if e.is_fatal() => {
                warn!(device = name, "Stream lost: {}", e);
                shared.disconnected.store(true, Ordering::Release);
                break;
            }
            Err(e) => {
                debug!(device = name, "Read failed: {}", e);
                shared.set_state(PollerState::Idle);
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    transport.close();
    shared.set_state(PollerState::Disposed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Emits 64-byte reports whose bytes all equal a rolling counter
    struct Counter {
        next: u8,
        fail_after: Option<usize>,
        reads: usize,
        closed: Arc<AtomicUsize>,
    }

    impl Transport for Counter {
        fn name(&self) -> &str {
            "counter"
        }
        fn write(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            self.reads += 1;
            if self.fail_after.is_some_and(|n| self.reads > n) {
                return Err(CoolwatchError::Disconnected("counter".into()));
            }
            self.next = self.next.wrapping_add(1);
            buf.fill(self.next);
            Ok(buf.len())
        }
        fn bytes_to_read(&mut self) -> Result<usize> {
            Ok(0)
        }
        fn purge(&mut self) -> Result<()> {
            Ok(())
        }
        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst) > 0
        }
    }

    fn counter(fail_after: Option<usize>) -> (Box<dyn Transport>, Arc<AtomicUsize>) {
        let closed = Arc::new(AtomicUsize::new(0));
        let t = Counter {
            next: 0,
            fail_after,
            reads: 0,
            closed: Arc::clone(&closed),
        };
        (Box::new(t), closed)
    }

    fn accept_all(_: &[u8]) -> bool {
        true
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_frames_are_never_torn() {
        let (t, _) = counter(None);
        let mut poller = BackgroundPoller::spawn(
            "torn",
            t,
            Duration::from_millis(10),
            Duration::from_secs(1),
            accept_all,
        )
        .unwrap();
        let reader = poller.reader();
        wait_for(|| reader.latest().is_some());

        for _ in 0..1000 {
            let frame = reader.latest().unwrap();
            let first = frame.as_bytes()[0];
            assert_eq!(frame.len(), MAX_FRAME_LEN);
            assert!(frame.as_bytes().iter().all(|&b| b == first));
        }
        poller.close();
    }

    #[test]
    fn test_close_is_idempotent_and_releases_transport_once() {
        let (t, closed) = counter(None);
        let mut poller = BackgroundPoller::spawn(
            "idem",
            t,
            Duration::from_millis(10),
            Duration::from_secs(1),
            accept_all,
        )
        .unwrap();
        let reader = poller.reader();
        poller.close();
        poller.close();
        drop(poller);

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(reader.state(), PollerState::Disposed);
    }

    #[test]
    fn test_disconnect_ends_thread() {
        let (t, closed) = counter(Some(3));
        let poller = BackgroundPoller::spawn(
            "lost",
            t,
            Duration::from_millis(10),
            Duration::from_secs(1),
            accept_all,
        )
        .unwrap();
        let reader = poller.reader();
        wait_for(|| reader.state() == PollerState::Disposed);

        assert!(reader.is_disconnected());
        assert_eq!(reader.frames_received(), 3);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_filter_drops_unwanted_reports() {
        fn never(_: &[u8]) -> bool {
            false
        }
        let (t, _) = counter(Some(10));
        let mut poller = BackgroundPoller::spawn(
            "filtered",
            t,
            Duration::from_millis(10),
            Duration::from_secs(1),
            never,
        )
        .unwrap();
        let reader = poller.reader();
        wait_for(|| reader.is_disconnected());
        assert!(poller.latest().is_none());
        poller.close();
    }

    #[test]
    fn test_raw_frame_truncates() {
        let frame = RawFrame::from_slice(&[7u8; 80]);
        assert_eq!(frame.len(), MAX_FRAME_LEN);
        assert!(RawFrame::from_slice(&[]).is_empty());
    }
}
