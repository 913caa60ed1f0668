//! Handshake and validation of ambiguous candidates
//!
//! Serial ports and FTDI bridges carry no protocol identity, so each
//! candidate is opened, probed with the family's fixed byte sequence, and only
//! promoted when the reply carries the expected structural marker. Every wait
//! is bounded by the family's [`ProbePolicy`].

use std::fmt::Display;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use crate::transport::Transport;
use crate::{CoolwatchError, Result};

/// Probe bound: `retries` waits of `step` each
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub step: Duration,
    pub retries: u32,
}

impl ProbePolicy {
    pub const fn new(step: Duration, retries: u32) -> Self {
        Self { step, retries }
    }

    /// Longest time a probe under this policy may wait
    pub fn budget(&self) -> Duration {
        self.step * self.retries
    }
}

/// Wait until at least `min` bytes are queued.
///
/// Returns the queued count, or [`CoolwatchError::Timeout`] once the policy is
/// exhausted.
pub fn wait_for_bytes(transport: &mut dyn Transport, min: usize, policy: ProbePolicy) -> Result<usize> {
    let mut queued = 0;
    // One check per step boundary; `retries` sleeps add up to `budget()`
    for attempt in 0..=policy.retries {
        queued = transport.bytes_to_read()?;
        if queued >= min {
            return Ok(queued);
        }
        if attempt < policy.retries {
            thread::sleep(policy.step);
        }
    }
    Err(CoolwatchError::timeout(format!(
        "{}: {} of {} bytes after {:?}",
        transport.name(),
        queued,
        min,
        policy.budget()
    )))
}

/// Consume input until `marker` is read or the policy budget runs out
pub fn scan_for_marker(transport: &mut dyn Transport, marker: u8, policy: ProbePolicy) -> Result<()> {
    let deadline = Instant::now() + policy.budget();
    let mut byte = [0u8; 1];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CoolwatchError::timeout(format!(
                "{}: marker {:#04X} not seen",
                transport.name(),
                marker
            )));
        }
        match transport.read(&mut byte, remaining.min(policy.step)) {
            Ok(_) if byte[0] == marker => return Ok(()),
            Ok(_) => trace!("{}: skipping {:#04X}", transport.name(), byte[0]),
            Err(CoolwatchError::Timeout(_)) => {}
            Err(e) => return Err(e),
        }
    }
}

/// A candidate that passed its probe, with the still-open transport
pub struct Validated<C, P> {
    pub candidate: C,
    pub transport: Box<dyn Transport>,
    /// What the probe learned (protocol revision, firmware, ...)
    pub probe: P,
}

/// Open and probe every candidate.
///
/// Failures are contained per candidate: the transport is closed, the reason
/// logged, and the scan moves on. Several candidates may validate; each is
/// returned independently.
pub fn validate_candidates<C, P, O, V>(
    family: &str,
    candidates: impl IntoIterator<Item = C>,
    mut open: O,
    mut probe: V,
) -> Vec<Validated<C, P>>
where
    C: Display,
    O: FnMut(&C) -> Result<Box<dyn Transport>>,
    V: FnMut(&C, &mut dyn Transport) -> Result<P>,
{
    let mut accepted = Vec::new();

    for candidate in candidates {
        let mut transport = match open(&candidate) {
            Ok(transport) => transport,
            Err(e) => {
                debug!(family, candidate = %candidate, "Open failed: {}", e);
                continue;
            }
        };

        let started = Instant::now();
        match probe(&candidate, transport.as_mut()) {
            Ok(result) => {
                info!(
                    family,
                    candidate = %candidate,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Candidate validated"
                );
                accepted.push(Validated {
                    candidate,
                    transport,
                    probe: result,
                });
            }
            Err(e) => {
                transport.close();
                debug!(family, candidate = %candidate, "Rejected: {}", e);
            }
        }
    }

    accepted
}
