//! nestcall mediates a live audio/video call between exactly two
//! asymmetric participants, a parent endpoint and a child endpoint, with
//! no dedicated signaling server: offers, answers and ICE candidates are
//! exchanged through a shared durable record plus a best-effort
//! change-notification stream.
//!
//! The crate is the call-lifecycle core only. The record store, the
//! WebRTC transport, media capture and the notification cues are
//! collaborators supplied by the embedding application through the traits
//! in [`call::RecordStore`], [`transport`], [`media`] and
//! [`call::CallCueSink`].

pub mod call;
pub mod config;
pub mod media;
pub mod test_utils;
pub mod transport;

pub use call::{
    CallError, CallId, CallMachine, CallOptions, CallPhase, CallRecord, CallSnapshot, CallStatus,
    ParticipantId, RecordStore, Role, RoleContext, RouteHint,
};
pub use config::CallConfig;
