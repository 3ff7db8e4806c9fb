//! Signaling protocol driver.
//!
//! Translates call actions into reads and writes on the shared record and
//! watches for inbound ringing records. All candidate appends go through
//! read-modify-write with duplicate detection, never a blind overwrite,
//! because local emission and remote draining can touch the same row
//! concurrently.

use super::candidates::merge_candidate;
use super::record::{
    CallId, CallRecord, CallStatus, IceCandidate, ParticipantId, RecordPatch, Role,
    SessionDescription,
};
use super::store::{RecordChange, RecordFilter, RecordOrder, RecordStore, StoreError};
use super::termination::SeenSet;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::MissedTickBehavior;

pub struct SignalingDriver {
    store: Arc<dyn RecordStore>,
    role: Role,
    local: ParticipantId,
}

impl SignalingDriver {
    pub fn new(store: Arc<dyn RecordStore>, role: Role, local: ParticipantId) -> Self {
        Self { store, role, local }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Build the record for a new outgoing call. A fresh id every time;
    /// an id is never reused for a new offer.
    pub fn new_offer_record(
        &self,
        remote: &ParticipantId,
        offer: SessionDescription,
    ) -> CallRecord {
        CallRecord::new_outgoing(self.role, self.local.clone(), remote.clone(), offer)
    }

    /// Persist a brand-new offer record.
    pub async fn publish_offer(&self, record: &CallRecord) -> Result<(), StoreError> {
        self.store.create(record).await?;
        debug!(target: "Call/Signaling", "published offer record {}", record.id);
        Ok(())
    }

    /// Persist the answer on the existing record. Never creates a new row;
    /// the record also moves to `in_call` in the same write.
    pub async fn publish_answer(
        &self,
        id: &CallId,
        answer: SessionDescription,
    ) -> Result<(), StoreError> {
        self.store.update(id, RecordPatch::answer(answer)).await
    }

    /// Upgrade a live row to `active` once media is confirmed flowing.
    /// Idempotent and monotonic; harmless if both sides do it.
    pub async fn mark_active(&self, id: &CallId) -> Result<(), StoreError> {
        self.store
            .update(id, RecordPatch::status(CallStatus::Active))
            .await
    }

    pub async fn publish_reject(&self, id: &CallId) -> Result<(), StoreError> {
        self.store
            .update(id, RecordPatch::status(CallStatus::Rejected))
            .await
    }

    /// The terminal write issued by hangup and the transport-failure
    /// handler. Always issued before resource release.
    pub async fn publish_hangup(&self, id: &CallId) -> Result<(), StoreError> {
        self.store
            .update(id, RecordPatch::terminal(self.role, chrono::Utc::now()))
            .await
    }

    /// Append one locally generated candidate to this role's list.
    ///
    /// Read-modify-write with duplicate detection: a redelivered candidate
    /// (same candidate string, mline index and mid) is a silent no-op.
    /// Returns whether anything was stored.
    pub async fn emit_candidate(
        &self,
        id: &CallId,
        candidate: IceCandidate,
    ) -> Result<bool, StoreError> {
        let record = self.fetch(id).await?;
        let mut list = record.candidates_of(self.role).to_vec();
        if !merge_candidate(&mut list, candidate) {
            debug!(target: "Call/Signaling", "duplicate candidate for call {id}, skipping");
            return Ok(false);
        }
        self.store
            .update(id, RecordPatch::candidates(self.role, list))
            .await?;
        Ok(true)
    }

    pub async fn fetch(&self, id: &CallId) -> Result<CallRecord, StoreError> {
        let mut rows = self
            .store
            .query(RecordFilter::ById(id.clone()), 1, RecordOrder::CreatedDesc)
            .await?;
        rows.pop().ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    pub async fn subscribe_call(
        &self,
        id: &CallId,
    ) -> Result<mpsc::Receiver<RecordChange>, StoreError> {
        self.store.subscribe(RecordFilter::ById(id.clone())).await
    }
}

/// Watches for inbound ringing records addressed to the local identity.
///
/// Two paths feed the same sink: a realtime subscription and a
/// low-frequency reconciliation poll that recovers silently dropped
/// notifications within one tick. Surfaced call ids are deduplicated so
/// the two paths never double-fire, and everything is suppressed while
/// the local endpoint is itself on a call-related view.
pub struct InboundWatcher {
    store: Arc<dyn RecordStore>,
    filter: RecordFilter,
    surfaced: SeenSet,
    suppressed: Arc<AtomicBool>,
    poll_interval: Duration,
    poll_limit: usize,
    shutdown: Arc<Notify>,
}

impl InboundWatcher {
    pub fn new(
        store: Arc<dyn RecordStore>,
        role: Role,
        local: ParticipantId,
        poll_interval: Duration,
        poll_limit: usize,
        seen_ttl: Duration,
        suppressed: Arc<AtomicBool>,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            filter: RecordFilter::RingingFor {
                callee: local,
                callee_role: role,
            },
            surfaced: SeenSet::new(seen_ttl),
            suppressed,
            poll_interval,
            poll_limit,
            shutdown,
        }
    }

    /// Spawn the watch loop. Inbound ringing records are delivered on the
    /// returned channel until shutdown.
    pub fn spawn(self) -> mpsc::Receiver<CallRecord> {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(self.run(tx));
        rx
    }

    async fn run(self, tx: mpsc::Sender<CallRecord>) {
        let mut changes = match self.store.subscribe(self.filter.clone()).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!(target: "Call/Inbound", "realtime subscription failed, poll only: {e}");
                None
            }
        };

        // The first tick fires immediately, doubling as catch-up for rows
        // created before this endpoint came up.
        let mut tick = tokio::time::interval(self.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = self.shutdown.notified();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => return,
                change = next_change(&mut changes) => match change {
                    Some(change) => self.consider(&change.current, &tx).await,
                    None => {
                        debug!(target: "Call/Inbound", "realtime stream closed, poll only");
                        changes = None;
                    }
                },
                _ = tick.tick() => self.poll(&tx).await,
            }
        }
    }

    async fn poll(&self, tx: &mpsc::Sender<CallRecord>) {
        if self.suppressed.load(Ordering::Relaxed) {
            return;
        }
        match self
            .store
            .query(self.filter.clone(), self.poll_limit, RecordOrder::CreatedDesc)
            .await
        {
            Ok(rows) => {
                for row in rows {
                    self.consider(&row, tx).await;
                }
            }
            Err(e) => {
                // Skipped until the next tick.
                warn!(target: "Call/Inbound", "reconciliation query failed: {e}");
            }
        }
    }

    async fn consider(&self, record: &CallRecord, tx: &mpsc::Sender<CallRecord>) {
        if self.suppressed.load(Ordering::Relaxed) {
            return;
        }
        // Update events can carry rows that already left ringing.
        if !self.filter.matches(record) {
            return;
        }
        if !self.surfaced.insert(&record.id) {
            debug!(target: "Call/Inbound", "call {} already surfaced", record.id);
            return;
        }
        let _ = tx.send(record.clone()).await;
    }
}

async fn next_change(
    rx: &mut Option<mpsc::Receiver<RecordChange>>,
) -> Option<RecordChange> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
