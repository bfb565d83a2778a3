//! Transport provider capability.
//!
//! The endpoint state machine drives sessions only through these traits.
//! Each session hands back an event stream instead of mutable callback
//! slots; events for one session arrive in the order the provider issued them.

pub mod memory;
pub mod webrtc_peer;

use crate::config::ServerConfig;
use crate::error::TransportError;
use crate::media::MediaHandle;
use crate::peer::types::{Candidate, ConnectionState, EndpointId, SessionDescriptor};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use self::memory::MemoryTransport;
pub use self::webrtc_peer::WebRtcTransport;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Receiving half of a session's event feed
pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;

/// Parameters for a new session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: EndpointId,
    pub session_id: String,
    pub ice_servers: Vec<ServerConfig>,
}

/// Asynchronous notifications emitted by a session
pub enum TransportEvent {
    CandidateDiscovered(Candidate),
    /// No more local candidates will be emitted
    GatheringComplete,
    ConnectionStateChanged(ConnectionState),
    RemoteStreamAvailable(MediaHandle),
    DataChannelOpenedByPeer(Arc<dyn TransportChannel>),
    ChannelOpen { label: String },
    ChannelMessage { label: String, data: String },
    ChannelClosed { label: String },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::CandidateDiscovered(c) => {
                f.debug_tuple("CandidateDiscovered").field(c).finish()
            }
            TransportEvent::GatheringComplete => f.write_str("GatheringComplete"),
            TransportEvent::ConnectionStateChanged(s) => {
                f.debug_tuple("ConnectionStateChanged").field(s).finish()
            }
            TransportEvent::RemoteStreamAvailable(m) => {
                f.debug_tuple("RemoteStreamAvailable").field(m).finish()
            }
            TransportEvent::DataChannelOpenedByPeer(ch) => f
                .debug_tuple("DataChannelOpenedByPeer")
                .field(&ch.label())
                .finish(),
            TransportEvent::ChannelOpen { label } => {
                f.debug_struct("ChannelOpen").field("label", label).finish()
            }
            TransportEvent::ChannelMessage { label, data } => f
                .debug_struct("ChannelMessage")
                .field("label", label)
                .field("len", &data.len())
                .finish(),
            TransportEvent::ChannelClosed { label } => {
                f.debug_struct("ChannelClosed").field("label", label).finish()
            }
        }
    }
}

/// Factory for sessions
#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn create_session(
        &self,
        config: SessionConfig,
    ) -> TransportResult<(Arc<dyn TransportSession>, EventStream)>;
}

/// One peer connection
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn create_offer(&self) -> TransportResult<SessionDescriptor>;

    async fn create_answer(&self) -> TransportResult<SessionDescriptor>;

    async fn set_local_description(&self, desc: &SessionDescriptor) -> TransportResult<()>;

    async fn set_remote_description(&self, desc: &SessionDescriptor) -> TransportResult<()>;

    async fn add_candidate(&self, candidate: &Candidate) -> TransportResult<()>;

    /// Whether candidates may be added before the remote description is set
    fn supports_early_candidates(&self) -> bool {
        false
    }

    async fn attach_media(&self, media: &MediaHandle) -> TransportResult<()>;

    async fn create_data_channel(&self, label: &str) -> TransportResult<Arc<dyn TransportChannel>>;

    async fn close(&self) -> TransportResult<()>;
}

/// Provider side of a data channel
#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send_text(&self, text: &str) -> TransportResult<()>;

    async fn close(&self) -> TransportResult<()>;
}
