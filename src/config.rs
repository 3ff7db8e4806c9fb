//! Machine configuration.

use crate::media::MediaConstraints;
use std::time::Duration;

/// Tunables for one [`CallMachine`](crate::call::CallMachine).
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Reconciliation poll interval for inbound ringing records. The
    /// change stream is best-effort, so a dropped notification is
    /// recovered within one tick.
    pub poll_interval: Duration,
    /// Upper bound on ringing rows fetched per reconciliation tick.
    pub poll_limit: usize,
    /// How long the `Ended` phase lingers before the machine returns to
    /// `Idle`.
    pub ended_linger: Duration,
    /// Eviction window for the termination and inbound seen-sets.
    pub seen_ttl: Duration,
    /// Tracks requested from the media source for a video call; an
    /// audio-only start strips the video constraint.
    pub constraints: MediaConstraints,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(20),
            poll_limit: 8,
            ended_linger: Duration::from_secs(3),
            seen_ttl: Duration::from_secs(300),
            constraints: MediaConstraints::default(),
        }
    }
}
