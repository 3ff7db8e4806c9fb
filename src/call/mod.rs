//! Call-lifecycle coordination over a shared record store.
//!
//! There is no dedicated signaling server: negotiation artifacts (offer,
//! answer, ICE candidates) travel through one durable [`CallRecord`] row
//! plus a best-effort change-notification stream. This module is the
//! coordinator that makes that workable: it tolerates at-least-once and
//! lossy delivery, concurrent writers and ambiguous identity signals
//! while guaranteeing no double-cleanup, no lost candidates and no
//! resurrection of an ended call.
//!
//! # Architecture
//!
//! - [`CallRecord`] & friends: the durable row and its writer-disjoint
//!   fields
//! - [`RecordStore`]: the store collaborator (create/update/subscribe/query)
//! - [`resolve`] / [`RoleContext`]: synchronous role resolution
//! - [`CallSession`] & [`CallPhase`]: the pure phase machine
//! - [`SignalingDriver`] & [`InboundWatcher`]: reads/writes on the record,
//!   inbound detection and reconciliation polling
//! - [`TerminationDetector`]: race-safe terminal-state detection
//! - [`CallMachine`]: the orchestrator wiring it all to the transport and
//!   media collaborators
//! - [`NotificationSynchronizer`]: advisory ringing/connect cues

mod candidates;
mod driver;
mod error;
mod machine;
mod notify;
mod record;
mod role;
mod state;
mod store;
mod termination;


pub use candidates::{IceCandidateQueue, RemoteCursor, merge_candidate, same_candidate};
pub use driver::{InboundWatcher, SignalingDriver};
pub use error::CallError;
pub use machine::{CallMachine, CallOptions, CallSnapshot};
pub use notify::{CallCueSink, NotificationSynchronizer};
pub use record::{
    CallId, CallRecord, CallStatus, IceCandidate, ParticipantId, RecordPatch, Role, SdpType,
    SessionDescription,
};
pub use role::{RoleBinding, RoleContext, RoleError, RouteHint, resolve};
pub use state::{CallEndReason, CallPhase, CallSession, CallTransition, InvalidTransition};
pub use store::{RecordChange, RecordFilter, RecordOrder, RecordStore, StoreError};
pub use termination::{SeenSet, TerminationDetector};
