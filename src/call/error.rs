//! Call-related error types.

use super::record::CallId;
use super::role::RoleError;
use super::state::InvalidTransition;
use super::store::StoreError;
use crate::media::MediaError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call not found: {0}")]
    NotFound(CallId),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("a call attempt is already in progress")]
    Busy,

    #[error("media permission denied")]
    PermissionDenied,

    #[error("capture device unavailable")]
    DeviceUnavailable,

    #[error("media capture not supported on this platform")]
    MediaUnsupported,

    #[error("transport setup failed: {0}")]
    TransportInit(String),

    #[error("record write failed: {0}")]
    RecordWrite(#[from] StoreError),

    #[error("record {0} carries no offer")]
    MissingOffer(CallId),

    #[error(transparent)]
    Role(#[from] RoleError),
}

impl From<MediaError> for CallError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::PermissionDenied => CallError::PermissionDenied,
            MediaError::DeviceUnavailable => CallError::DeviceUnavailable,
            MediaError::NotSupported => CallError::MediaUnsupported,
        }
    }
}
