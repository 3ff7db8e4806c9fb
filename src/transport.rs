//! Real-time transport capability interface.
//!
//! The embedding application supplies the actual peer-connection
//! implementation; this crate drives negotiation through the seam below
//! and never constructs media primitives itself. One transport lives for
//! exactly one call attempt.

use crate::call::{IceCandidate, SessionDescription};
use crate::media::{LocalMedia, RemoteMedia};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connection state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

/// ICE negotiation state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local ICE candidate is ready to be published.
    CandidateGenerated(IceCandidate),
    /// Remote media arrived.
    TrackReceived(RemoteMedia),
    ConnectionStateChanged(ConnectionState),
    IceStateChanged(IceConnectionState),
}

/// One peer connection for one call attempt.
#[async_trait]
pub trait CallTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, anyhow::Error>;

    async fn create_answer(&self) -> Result<SessionDescription, anyhow::Error>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), anyhow::Error>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), anyhow::Error>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), anyhow::Error>;

    fn connection_state(&self) -> ConnectionState;

    fn ice_state(&self) -> IceConnectionState;

    /// Best-effort teardown; must not fail.
    async fn close(&self);
}

/// A factory responsible for creating one transport per call attempt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Creates a new transport with the local tracks attached and returns
    /// it along with its event stream.
    async fn create_transport(
        &self,
        local_media: &LocalMedia,
    ) -> Result<(Arc<dyn CallTransport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}
