//! Call phase machine.

use super::record::{CallId, Role};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Why a call left the live phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    LocalHangup,
    RemoteHangup,
    Rejected,
    Missed,
    TransportFailed,
}

/// Current phase of the local endpoint.
#[derive(Debug, Clone, Serialize, Default)]
pub enum CallPhase {
    #[default]
    Idle,
    /// Outgoing: offer published, waiting for the callee.
    Calling { call_id: CallId },
    /// Inbound ringing record surfaced, waiting for accept/reject.
    Incoming { call_id: CallId, caller_role: Role },
    /// Answer exchanged; waiting for the transport to report connected and
    /// remote media to arrive.
    Connecting { call_id: CallId },
    /// Media flowing both ways.
    InCall {
        call_id: CallId,
        connected_at: DateTime<Utc>,
    },
    /// Terminal until reset back to `Idle`.
    Ended {
        call_id: Option<CallId>,
        reason: CallEndReason,
        ended_at: DateTime<Utc>,
    },
}

impl CallPhase {
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            CallPhase::Idle => None,
            CallPhase::Calling { call_id }
            | CallPhase::Incoming { call_id, .. }
            | CallPhase::Connecting { call_id }
            | CallPhase::InCall { call_id, .. } => Some(call_id),
            CallPhase::Ended { call_id, .. } => call_id.as_ref(),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    /// Phases during which the ringing cue plays (until remote media
    /// arrives).
    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Calling { .. } | Self::Incoming { .. })
    }

    /// The local endpoint is on a call-related view; inbound surfacing
    /// stays suppressed so it never self-notifies on records it just
    /// created.
    pub fn on_call_view(&self) -> bool {
        !self.is_idle()
    }
}

/// Phase transitions.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Offer published for an outgoing call.
    StartRequested { call_id: CallId },
    /// Outgoing or inbound setup failed before the call got anywhere.
    SetupFailed,
    /// An inbound ringing record addressed to us was surfaced.
    InboundObserved { call_id: CallId, caller_role: Role },
    /// Local accept: answer persisted, negotiation under way.
    AcceptRequested,
    /// Local reject of an inbound call.
    LocalRejected,
    /// The caller observed the stored answer.
    AnswerObserved,
    /// Transport connected and remote media present.
    MediaLive,
    /// The record was observed at `rejected` or `missed`.
    RemoteDeclined { reason: CallEndReason },
    /// The termination detector fired for this call.
    TerminationObserved,
    /// The transport gave up mid-call.
    TransportFailed,
    /// Local hangup, authoritative from any live phase.
    LocalHangup,
    /// Linger elapsed; back to idle. The only way out of `Ended`.
    Reset,
}

/// In-memory state of the local endpoint. Mutated only by the call
/// machine and the signaling driver; destroyed on shutdown.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallSession {
    pub phase: CallPhase,
    pub audio_muted: bool,
    pub video_off: bool,
}

impl CallSession {
    /// Apply a phase transition. Returns an error if the transition is not
    /// legal from the current phase.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let new_phase = match (&self.phase, transition) {
            (CallPhase::Idle, CallTransition::StartRequested { call_id }) => {
                CallPhase::Calling { call_id }
            }
            (
                CallPhase::Idle,
                CallTransition::InboundObserved {
                    call_id,
                    caller_role,
                },
            ) => CallPhase::Incoming {
                call_id,
                caller_role,
            },
            (CallPhase::Calling { .. }, CallTransition::SetupFailed)
            | (CallPhase::Incoming { .. }, CallTransition::SetupFailed) => CallPhase::Idle,
            (CallPhase::Calling { call_id }, CallTransition::AnswerObserved) => {
                CallPhase::Connecting {
                    call_id: call_id.clone(),
                }
            }
            (CallPhase::Incoming { call_id, .. }, CallTransition::AcceptRequested) => {
                CallPhase::Connecting {
                    call_id: call_id.clone(),
                }
            }
            (CallPhase::Incoming { call_id, .. }, CallTransition::LocalRejected) => {
                CallPhase::Ended {
                    call_id: Some(call_id.clone()),
                    reason: CallEndReason::Rejected,
                    ended_at: Utc::now(),
                }
            }
            (
                CallPhase::Calling { call_id }
                | CallPhase::Incoming { call_id, .. }
                | CallPhase::Connecting { call_id },
                CallTransition::RemoteDeclined { reason },
            ) => CallPhase::Ended {
                call_id: Some(call_id.clone()),
                reason,
                ended_at: Utc::now(),
            },
            (CallPhase::Connecting { call_id }, CallTransition::MediaLive) => CallPhase::InCall {
                call_id: call_id.clone(),
                connected_at: Utc::now(),
            },
            (
                CallPhase::Calling { call_id }
                | CallPhase::Incoming { call_id, .. }
                | CallPhase::Connecting { call_id }
                | CallPhase::InCall { call_id, .. },
                CallTransition::TerminationObserved,
            ) => CallPhase::Ended {
                call_id: Some(call_id.clone()),
                reason: CallEndReason::RemoteHangup,
                ended_at: Utc::now(),
            },
            (
                CallPhase::Calling { call_id }
                | CallPhase::Connecting { call_id }
                | CallPhase::InCall { call_id, .. },
                CallTransition::TransportFailed,
            ) => CallPhase::Ended {
                call_id: Some(call_id.clone()),
                reason: CallEndReason::TransportFailed,
                ended_at: Utc::now(),
            },
            (
                CallPhase::Calling { call_id }
                | CallPhase::Incoming { call_id, .. }
                | CallPhase::Connecting { call_id }
                | CallPhase::InCall { call_id, .. },
                CallTransition::LocalHangup,
            ) => CallPhase::Ended {
                call_id: Some(call_id.clone()),
                reason: CallEndReason::LocalHangup,
                ended_at: Utc::now(),
            },
            (CallPhase::Ended { .. }, CallTransition::Reset) => CallPhase::Idle,
            (current, transition) => {
                return Err(InvalidTransition {
                    current_phase: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.phase = new_phase;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_phase: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in phase {}",
            self.attempted, self.current_phase
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_id() -> CallId {
        CallId::new("AC90CFD09DF712D981142B172706F9F2")
    }

    fn session() -> CallSession {
        CallSession::default()
    }

    /// Caller-side flow: Idle → Calling → Connecting → InCall → Ended.
    #[test]
    fn test_outgoing_flow() {
        let mut s = session();
        s.apply_transition(CallTransition::StartRequested {
            call_id: call_id(),
        })
        .unwrap();
        assert!(matches!(s.phase, CallPhase::Calling { .. }));

        s.apply_transition(CallTransition::AnswerObserved).unwrap();
        assert!(matches!(s.phase, CallPhase::Connecting { .. }));

        s.apply_transition(CallTransition::MediaLive).unwrap();
        assert!(matches!(s.phase, CallPhase::InCall { .. }));

        s.apply_transition(CallTransition::LocalHangup).unwrap();
        assert!(s.phase.is_ended());
        assert!(matches!(
            s.phase,
            CallPhase::Ended {
                reason: CallEndReason::LocalHangup,
                ..
            }
        ));
    }

    /// Callee-side flow: Idle → Incoming → Connecting → InCall.
    #[test]
    fn test_incoming_flow() {
        let mut s = session();
        s.apply_transition(CallTransition::InboundObserved {
            call_id: call_id(),
            caller_role: Role::Parent,
        })
        .unwrap();
        assert!(matches!(s.phase, CallPhase::Incoming { .. }));
        assert!(s.phase.is_ringing());

        s.apply_transition(CallTransition::AcceptRequested).unwrap();
        s.apply_transition(CallTransition::MediaLive).unwrap();
        assert!(matches!(s.phase, CallPhase::InCall { .. }));
    }

    #[test]
    fn test_reject_ends_incoming() {
        let mut s = session();
        s.apply_transition(CallTransition::InboundObserved {
            call_id: call_id(),
            caller_role: Role::Parent,
        })
        .unwrap();
        s.apply_transition(CallTransition::LocalRejected).unwrap();
        assert!(matches!(
            s.phase,
            CallPhase::Ended {
                reason: CallEndReason::Rejected,
                ..
            }
        ));
    }

    #[test]
    fn test_remote_decline_ends_calling() {
        let mut s = session();
        s.apply_transition(CallTransition::StartRequested {
            call_id: call_id(),
        })
        .unwrap();
        s.apply_transition(CallTransition::RemoteDeclined {
            reason: CallEndReason::Missed,
        })
        .unwrap();
        assert!(matches!(
            s.phase,
            CallPhase::Ended {
                reason: CallEndReason::Missed,
                ..
            }
        ));
    }

    #[test]
    fn test_termination_fires_from_any_live_phase() {
        let builders: [fn(&mut CallSession); 3] = [
            |s| {
                s.apply_transition(CallTransition::StartRequested {
                    call_id: call_id(),
                })
                .unwrap();
            },
            |s| {
                s.apply_transition(CallTransition::StartRequested {
                    call_id: call_id(),
                })
                .unwrap();
                s.apply_transition(CallTransition::AnswerObserved).unwrap();
            },
            |s| {
                s.apply_transition(CallTransition::StartRequested {
                    call_id: call_id(),
                })
                .unwrap();
                s.apply_transition(CallTransition::AnswerObserved).unwrap();
                s.apply_transition(CallTransition::MediaLive).unwrap();
            },
        ];
        for build in builders {
            let mut s = session();
            build(&mut s);
            s.apply_transition(CallTransition::TerminationObserved)
                .unwrap();
            assert!(s.phase.is_ended());
        }
    }

    /// A caller hangup while the callee is still ringing dismisses the
    /// incoming view.
    #[test]
    fn test_termination_dismisses_incoming() {
        let mut s = session();
        s.apply_transition(CallTransition::InboundObserved {
            call_id: call_id(),
            caller_role: Role::Parent,
        })
        .unwrap();
        s.apply_transition(CallTransition::TerminationObserved)
            .unwrap();
        assert!(matches!(
            s.phase,
            CallPhase::Ended {
                reason: CallEndReason::RemoteHangup,
                ..
            }
        ));
    }

    #[test]
    fn test_setup_failure_reverts_to_idle() {
        let mut s = session();
        s.apply_transition(CallTransition::StartRequested {
            call_id: call_id(),
        })
        .unwrap();
        s.apply_transition(CallTransition::SetupFailed).unwrap();
        assert!(s.phase.is_idle());
    }

    /// `Ended` only ever leads back to `Idle`; a live phase needs a fresh
    /// start.
    #[test]
    fn test_ended_rejects_everything_but_reset() {
        let mut s = session();
        s.apply_transition(CallTransition::StartRequested {
            call_id: call_id(),
        })
        .unwrap();
        s.apply_transition(CallTransition::LocalHangup).unwrap();

        for transition in [
            CallTransition::StartRequested {
                call_id: call_id(),
            },
            CallTransition::InboundObserved {
                call_id: call_id(),
                caller_role: Role::Parent,
            },
            CallTransition::AcceptRequested,
            CallTransition::AnswerObserved,
            CallTransition::MediaLive,
            CallTransition::LocalHangup,
            CallTransition::TerminationObserved,
            CallTransition::TransportFailed,
        ] {
            assert!(s.clone().apply_transition(transition).is_err());
        }

        s.apply_transition(CallTransition::Reset).unwrap();
        assert!(s.phase.is_idle());

        // Fresh start is legal again after the reset.
        s.apply_transition(CallTransition::StartRequested {
            call_id: call_id(),
        })
        .unwrap();
        assert!(matches!(s.phase, CallPhase::Calling { .. }));
    }

    #[test]
    fn test_idle_rejects_call_progress_transitions() {
        for transition in [
            CallTransition::AcceptRequested,
            CallTransition::AnswerObserved,
            CallTransition::MediaLive,
            CallTransition::LocalHangup,
            CallTransition::TerminationObserved,
            CallTransition::Reset,
        ] {
            let mut s = session();
            assert!(s.apply_transition(transition).is_err());
        }
    }

    #[test]
    fn test_on_call_view_suppression_window() {
        let mut s = session();
        assert!(!s.phase.on_call_view());
        s.apply_transition(CallTransition::StartRequested {
            call_id: call_id(),
        })
        .unwrap();
        assert!(s.phase.on_call_view());
        s.apply_transition(CallTransition::LocalHangup).unwrap();
        // Still on the call view while the ended screen lingers.
        assert!(s.phase.on_call_view());
        s.apply_transition(CallTransition::Reset).unwrap();
        assert!(!s.phase.on_call_view());
    }
}
