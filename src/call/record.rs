//! Durable call-record data model.
//!
//! One [`CallRecord`] row represents a single call attempt between a parent
//! endpoint and a child endpoint. The row doubles as the signaling channel:
//! the caller writes the offer at creation, the callee writes the answer,
//! and each role appends ICE candidates to its own list. The two writers
//! never touch the same field, which is why no cross-peer locking exists
//! anywhere in this crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id (32 uppercase hex chars).
    ///
    /// A new offer always gets a new id; ids are never reused.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a participant endpoint (one parent or child device).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two fixed, asymmetric participant types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Parent,
    Child,
}

impl Role {
    pub fn opposite(self) -> Self {
        match self {
            Role::Parent => Role::Child,
            Role::Child => Role::Parent,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Parent => f.write_str("parent"),
            Role::Child => f.write_str("child"),
        }
    }
}

/// Status column of a call record.
///
/// Transitions are monotonic: `Ringing` → {`InCall` | `Rejected` | `Missed`}
/// → `Ended`, with `Active` a refinement of `InCall` once media is confirmed
/// flowing. Repeat writes of the same value are idempotent, so
/// last-write-wins storage is acceptable for this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    InCall,
    Active,
    Rejected,
    Missed,
    Ended,
}

impl CallStatus {
    /// A status value from which no further negotiation proceeds.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Missed | Self::Ended)
    }

    pub fn is_live(self) -> bool {
        matches!(self, Self::InCall | Self::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpType {
    Offer,
    Answer,
}

/// SDP payload stored in the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A network-path descriptor exchanged to establish direct connectivity.
///
/// Identity for deduplication purposes is the full triple of candidate
/// string, mline index and mid; redelivery of an identical triple is a
/// no-op everywhere in this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_mline_index(mut self, index: u16) -> Self {
        self.sdp_mline_index = Some(index);
        self
    }
}

/// One call attempt and its negotiation artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: CallId,
    pub parent_id: ParticipantId,
    pub child_id: ParticipantId,
    pub caller_role: Role,
    pub status: CallStatus,
    /// Written exactly once, by the caller, at creation.
    pub offer: Option<SessionDescription>,
    /// Written exactly once, by the callee, on accept.
    pub answer: Option<SessionDescription>,
    /// Append-only, owned by the parent endpoint.
    #[serde(default)]
    pub parent_ice_candidates: Vec<IceCandidate>,
    /// Append-only, owned by the child endpoint.
    #[serde(default)]
    pub child_ice_candidates: Vec<IceCandidate>,
    pub created_at: DateTime<Utc>,
    /// Immutable once set.
    pub ended_at: Option<DateTime<Utc>>,
    pub ended_by: Option<Role>,
}

impl CallRecord {
    /// Build the record a caller persists when starting a call.
    pub fn new_outgoing(
        caller_role: Role,
        local: ParticipantId,
        remote: ParticipantId,
        offer: SessionDescription,
    ) -> Self {
        let (parent_id, child_id) = match caller_role {
            Role::Parent => (local, remote),
            Role::Child => (remote, local),
        };
        Self {
            id: CallId::generate(),
            parent_id,
            child_id,
            caller_role,
            status: CallStatus::Ringing,
            offer: Some(offer),
            answer: None,
            parent_ice_candidates: Vec::new(),
            child_ice_candidates: Vec::new(),
            created_at: Utc::now(),
            ended_at: None,
            ended_by: None,
        }
    }

    pub fn callee_role(&self) -> Role {
        self.caller_role.opposite()
    }

    pub fn participant_id(&self, role: Role) -> &ParticipantId {
        match role {
            Role::Parent => &self.parent_id,
            Role::Child => &self.child_id,
        }
    }

    pub fn candidates_of(&self, role: Role) -> &[IceCandidate] {
        match role {
            Role::Parent => &self.parent_ice_candidates,
            Role::Child => &self.child_ice_candidates,
        }
    }

    /// The terminal condition the termination detector keys on.
    ///
    /// `Rejected`/`Missed` are terminal statuses too, but they are observed
    /// through their own transition path; only a full hangup sets
    /// `ended_at`.
    pub fn is_ended(&self) -> bool {
        self.status == CallStatus::Ended || self.ended_at.is_some()
    }
}

/// Partial update for [`RecordStore::update`](super::store::RecordStore::update).
///
/// `None` fields are left untouched by the store.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CallStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_ice_candidates: Option<Vec<IceCandidate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_ice_candidates: Option<Vec<IceCandidate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_by: Option<Role>,
}

impl RecordPatch {
    pub fn status(status: CallStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn answer(answer: SessionDescription) -> Self {
        Self {
            answer: Some(answer),
            status: Some(CallStatus::InCall),
            ..Default::default()
        }
    }

    /// Replace the candidate list owned by `role`. The caller is expected
    /// to have produced `list` by read-modify-write with dedup, never by
    /// blind construction.
    pub fn candidates(role: Role, list: Vec<IceCandidate>) -> Self {
        match role {
            Role::Parent => Self {
                parent_ice_candidates: Some(list),
                ..Default::default()
            },
            Role::Child => Self {
                child_ice_candidates: Some(list),
                ..Default::default()
            },
        }
    }

    /// The terminal write issued by hangup and the transport-failure
    /// handler.
    pub fn terminal(ended_by: Role, ended_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(CallStatus::Ended),
            ended_at: Some(ended_at),
            ended_by: Some(ended_by),
            ..Default::default()
        }
    }

    /// Apply this patch to an in-memory row, honoring the record
    /// invariants: `ended_at`, once set, never changes, and a stale
    /// non-terminal status write never resurrects a settled row.
    pub fn apply_to(&self, record: &mut CallRecord) {
        if let Some(status) = self.status
            && !(record.status.is_terminal() && !status.is_terminal())
        {
            record.status = status;
        }
        if let Some(answer) = &self.answer {
            record.answer = Some(answer.clone());
        }
        if let Some(list) = &self.parent_ice_candidates {
            record.parent_ice_candidates = list.clone();
        }
        if let Some(list) = &self.child_ice_candidates {
            record.child_ice_candidates = list.clone();
        }
        if record.ended_at.is_none() {
            record.ended_at = self.ended_at;
        }
        if let Some(ended_by) = self.ended_by
            && record.ended_by.is_none()
        {
            record.ended_by = Some(ended_by);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record() -> CallRecord {
        CallRecord::new_outgoing(
            Role::Parent,
            ParticipantId::new("parent-1"),
            ParticipantId::new("child-1"),
            SessionDescription::offer("v=0 test-offer"),
        )
    }

    #[test]
    fn test_generated_ids_are_unique_hex() {
        let a = CallId::generate();
        let b = CallId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_outgoing_record_assigns_ids_by_role() {
        let record = make_record();
        assert_eq!(record.parent_id.as_str(), "parent-1");
        assert_eq!(record.child_id.as_str(), "child-1");
        assert_eq!(record.caller_role, Role::Parent);
        assert_eq!(record.callee_role(), Role::Child);
        assert_eq!(record.status, CallStatus::Ringing);
        assert!(record.offer.is_some());
        assert!(record.answer.is_none());

        let from_child = CallRecord::new_outgoing(
            Role::Child,
            ParticipantId::new("child-9"),
            ParticipantId::new("parent-9"),
            SessionDescription::offer("v=0"),
        );
        assert_eq!(from_child.parent_id.as_str(), "parent-9");
        assert_eq!(from_child.child_id.as_str(), "child-9");
    }

    #[test]
    fn test_record_serializes_with_store_column_names() {
        let record = make_record();
        let row = serde_json::to_value(&record).unwrap();
        assert!(row.get("parentId").is_some());
        assert!(row.get("childId").is_some());
        assert!(row.get("callerRole").is_some());
        assert!(row.get("parentIceCandidates").is_some());
        assert_eq!(row["status"], "ringing");
        assert_eq!(row["offer"]["type"], "offer");
    }

    #[test]
    fn test_patch_never_clears_ended_at() {
        let mut record = make_record();
        let first_end = Utc::now();
        RecordPatch::terminal(Role::Parent, first_end).apply_to(&mut record);
        assert_eq!(record.ended_at, Some(first_end));
        assert_eq!(record.ended_by, Some(Role::Parent));

        // A racing second terminal write must not move the timestamps.
        let later = first_end + chrono::Duration::seconds(5);
        RecordPatch::terminal(Role::Child, later).apply_to(&mut record);
        assert_eq!(record.ended_at, Some(first_end));
        assert_eq!(record.ended_by, Some(Role::Parent));
    }

    #[test]
    fn test_stale_status_never_resurrects_a_settled_row() {
        let mut record = make_record();
        RecordPatch::terminal(Role::Child, Utc::now()).apply_to(&mut record);
        assert_eq!(record.status, CallStatus::Ended);

        // A late accept races the hangup; the row stays ended.
        RecordPatch::status(CallStatus::InCall).apply_to(&mut record);
        assert_eq!(record.status, CallStatus::Ended);
    }

    #[test]
    fn test_candidate_patch_touches_only_owning_role() {
        let mut record = make_record();
        let cand = IceCandidate::new("candidate:1 1 UDP 1 10.0.0.1 50000 typ host")
            .with_sdp_mid("0")
            .with_sdp_mline_index(0);
        RecordPatch::candidates(Role::Parent, vec![cand.clone()]).apply_to(&mut record);
        assert_eq!(record.candidates_of(Role::Parent), [cand]);
        assert!(record.candidates_of(Role::Child).is_empty());
    }

    #[test]
    fn test_is_ended_on_status_or_timestamp() {
        let mut record = make_record();
        assert!(!record.is_ended());
        record.status = CallStatus::Ended;
        assert!(record.is_ended());

        let mut by_timestamp = make_record();
        by_timestamp.ended_at = Some(Utc::now());
        assert!(by_timestamp.is_ended());

        // Rejected is terminal for the status machine but is not the
        // detector's condition.
        let mut rejected = make_record();
        rejected.status = CallStatus::Rejected;
        assert!(rejected.status.is_terminal());
        assert!(!rejected.is_ended());
    }
}
