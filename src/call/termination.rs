//! Race-safe, idempotent detection of a call reaching its terminal state.

use super::record::CallId;
use super::store::RecordChange;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::{Duration, Instant};

/// Remembers which call ids already fired, with time-based eviction so the
/// set stays small across many attempts.
#[derive(Debug)]
pub struct SeenSet {
    seen: DashMap<CallId, Instant>,
    ttl: Duration,
}

impl SeenSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
        }
    }

    /// Insert `id`. Returns `false` when it is already present and not yet
    /// expired.
    pub fn insert(&self, id: &CallId) -> bool {
        self.evict_expired();
        match self.seen.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                true
            }
        }
    }

    pub fn contains(&self, id: &CallId) -> bool {
        self.seen
            .get(id)
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    fn evict_expired(&self) {
        self.seen.retain(|_, at| at.elapsed() < self.ttl);
    }
}

/// Decides whether a `(previous, current)` snapshot pair is the genuine
/// moment a call ended.
///
/// The change stream is at-least-once: the first delivery after
/// subscribing echoes the current row as if it were a change. Requiring a
/// known, non-terminal previous snapshot keeps that echo from triggering
/// cleanup on a call that was already over when we subscribed. Any
/// reimplementation of this component must preserve that guard rather
/// than assume the stream delivers exact deltas.
pub struct TerminationDetector {
    fired: SeenSet,
}

impl TerminationDetector {
    pub fn new(ttl: Duration) -> Self {
        Self {
            fired: SeenSet::new(ttl),
        }
    }

    /// Returns `true` exactly once per call id, at the delivery where the
    /// record crosses into its ended state.
    pub fn observe(&self, change: &RecordChange) -> bool {
        if !change.current.is_ended() {
            return false;
        }
        // The initial subscribe delivery carries no previous row; it must
        // not be treated as a change.
        let Some(previous) = &change.previous else {
            return false;
        };
        if previous.is_ended() {
            return false;
        }
        self.fired.insert(&change.current.id)
    }
}
