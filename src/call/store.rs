//! Shared record-store collaborator interface.
//!
//! The embedding application supplies the durable store (a hosted realtime
//! database, in practice). This crate only assumes the four operations
//! below and the delivery semantics documented on [`RecordChange`].

use super::record::{CallId, CallRecord, CallStatus, ParticipantId, RecordPatch, Role};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// One delivery from the change stream: the row before and after a write.
///
/// The stream is at-least-once and best-effort: the first delivery after
/// subscribing may echo the current row with `previous = None`, deliveries
/// may repeat, and the stream may silently stop producing. Consumers must
/// treat `previous = None` as "no known prior state", never as "the row is
/// new".
#[derive(Debug, Clone)]
pub struct RecordChange {
    pub previous: Option<CallRecord>,
    pub current: CallRecord,
}

/// Server-side filter for subscriptions and queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordFilter {
    /// A single call row.
    ById(CallId),
    /// Ringing rows addressed to `callee` that were authored by the
    /// opposite role.
    RingingFor {
        callee: ParticipantId,
        callee_role: Role,
    },
}

impl RecordFilter {
    pub fn matches(&self, record: &CallRecord) -> bool {
        match self {
            RecordFilter::ById(id) => record.id == *id,
            RecordFilter::RingingFor {
                callee,
                callee_role,
            } => {
                record.status == CallStatus::Ringing
                    && record.caller_role == callee_role.opposite()
                    && record.participant_id(*callee_role) == callee
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOrder {
    CreatedAsc,
    CreatedDesc,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record write failed: {0}")]
    Write(String),

    #[error("record read failed: {0}")]
    Read(String),

    #[error("record not found: {0}")]
    NotFound(CallId),

    #[error("subscription failed: {0}")]
    Subscribe(String),
}

/// The durable record store holding [`CallRecord`] rows.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new record. Caller-only; the id inside `record` is used
    /// verbatim.
    async fn create(&self, record: &CallRecord) -> Result<CallId, StoreError>;

    /// Partially update an existing record. Fields absent from the patch
    /// are untouched.
    async fn update(&self, id: &CallId, patch: RecordPatch) -> Result<(), StoreError>;

    /// Open an at-least-once change stream for rows matching `filter`.
    /// Deliveries may silently drop; callers are expected to reconcile by
    /// polling [`query`](Self::query).
    async fn subscribe(
        &self,
        filter: RecordFilter,
    ) -> Result<mpsc::Receiver<RecordChange>, StoreError>;

    /// Point-in-time read of rows matching `filter`, used for catch-up and
    /// reconciliation polling.
    async fn query(
        &self,
        filter: RecordFilter,
        limit: usize,
        order: RecordOrder,
    ) -> Result<Vec<CallRecord>, StoreError>;
}
