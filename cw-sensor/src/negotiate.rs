//! Capability negotiation
//!
//! Vendor SDKs often expose several structurally incompatible versions of the
//! same query. The negotiator walks the candidate generations in the order the
//! family supplies, calls the generation's probe, and keeps the first one that
//! both succeeds and reports at least one present channel. When every
//! generation is rejected the family's legacy path is chosen explicitly.

use std::fmt::Debug;

use cw_error::{CoolwatchError, Result};
use tracing::{debug, info, warn};

/// Outcome of a negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiated<G> {
    Generation(G),
    /// No generation was accepted; use the most conservative path
    Legacy,
}

impl<G: Copy> Negotiated<G> {
    pub fn generation(&self) -> Option<G> {
        match self {
            Negotiated::Generation(g) => Some(*g),
            Negotiated::Legacy => None,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Negotiated::Legacy)
    }
}

/// Probe `order` front to back and freeze the first plausible generation.
///
/// `probe` returns the number of channels the generation reported as present.
/// An error status or a zero count rejects the generation.
pub fn negotiate<G, P>(subject: &str, order: &[G], mut probe: P) -> Negotiated<G>
where
    G: Copy + Debug,
    P: FnMut(G) -> Result<usize>,
{
    for &generation in order {
        match probe(generation) {
            Ok(present) if present > 0 => {
                info!(
                    device = %subject,
                    generation = ?generation,
                    present,
                    "Capability generation accepted"
                );
                return Negotiated::Generation(generation);
            }
            Ok(_) => {
                debug!(
                    device = %subject,
                    generation = ?generation,
                    "Generation answered but reported no channels"
                );
            }
            Err(e) => {
                debug!(device = %subject, generation = ?generation, "Generation rejected: {}", e);
            }
        }
    }

    let exhausted = CoolwatchError::NegotiationExhausted(subject.to_string());
    warn!("{}, falling back to legacy path", exhausted);
    Negotiated::Legacy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Gen {
        Three,
        Two,
        One,
    }

    #[test]
    fn test_first_plausible_generation_wins() {
        let mut probed = Vec::new();
        let outcome = negotiate("gpu0", &[Gen::Three, Gen::Two, Gen::One], |g| {
            probed.push(g);
            match g {
                Gen::Three => Err(CoolwatchError::sdk("probe", -104)),
                Gen::Two => Err(CoolwatchError::sdk("probe", -9)),
                Gen::One => Ok(3),
            }
        });
        assert_eq!(outcome, Negotiated::Generation(Gen::One));
        assert_eq!(probed, vec![Gen::Three, Gen::Two, Gen::One]);
    }

    #[test]
    fn test_zero_present_channels_is_rejected() {
        let outcome = negotiate("gpu0", &[Gen::Three, Gen::Two], |g| match g {
            Gen::Three => Ok(0),
            _ => Ok(2),
        });
        assert_eq!(outcome.generation(), Some(Gen::Two));
    }

    #[test]
    fn test_exhaustion_falls_back_to_legacy() {
        let outcome: Negotiated<Gen> =
            negotiate("gpu0", &[Gen::Three, Gen::Two, Gen::One], |_| Ok(0));
        assert!(outcome.is_legacy());
        assert_eq!(outcome.generation(), None);
    }

    #[test]
    fn test_probe_stops_after_acceptance() {
        let mut calls = 0;
        let _ = negotiate("gpu0", &[Gen::Three, Gen::Two, Gen::One], |_| {
            calls += 1;
            Ok(1)
        });
        assert_eq!(calls, 1);
    }
}
