//! Local media capture capability interface.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Handle to the tracks captured on this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalMedia {
    pub tracks: Vec<MediaTrack>,
}

impl LocalMedia {
    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// Handle to the tracks arriving from the remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteMedia {
    pub tracks: Vec<MediaTrack>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum MediaError {
    #[error("media permission denied")]
    PermissionDenied,

    #[error("capture device unavailable")]
    DeviceUnavailable,

    #[error("media capture not supported on this platform")]
    NotSupported,
}

/// Device capture supplied by the embedding application.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError>;

    /// Flip a captured track on or off (mute / camera-off).
    async fn set_track_enabled(&self, media: &LocalMedia, kind: TrackKind, enabled: bool);

    /// Best-effort release. Failures are reported so callers can log
    /// them, but they never block teardown.
    async fn release(&self, media: LocalMedia) -> Result<(), anyhow::Error>;
}
