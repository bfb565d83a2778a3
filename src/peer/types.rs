use serde::{Deserialize, Serialize};
use std::fmt;

/// One logical side of the loopback call
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EndpointId {
    Local,
    Remote,
}

impl EndpointId {
    /// The endpoint on the other side of the loopback
    pub fn counterpart(self) -> Self {
        match self {
            EndpointId::Local => EndpointId::Remote,
            EndpointId::Remote => EndpointId::Local,
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::Local => f.write_str("local"),
            EndpointId::Remote => f.write_str("remote"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => f.write_str("offer"),
            SdpKind::Answer => f.write_str("answer"),
        }
    }
}

/// Offer or answer produced by a session; the payload is passed through untouched
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub kind: SdpKind,
    pub sdp: String,
    pub session_id: String,
    pub ts: i64,
}

impl SessionDescriptor {
    pub fn new(kind: SdpKind, sdp: String, session_id: String) -> Self {
        Self {
            kind,
            sdp,
            session_id,
            ts: chrono::Utc::now().timestamp(),
        }
    }

    pub fn offer(sdp: String, session_id: String) -> Self {
        Self::new(SdpKind::Offer, sdp, session_id)
    }

    pub fn answer(sdp: String, session_id: String) -> Self {
        Self::new(SdpKind::Answer, sdp, session_id)
    }
}

/// Network reachability candidate as emitted by the transport
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub owner: EndpointId,
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl Candidate {
    pub fn new(owner: EndpointId, candidate: impl Into<String>) -> Self {
        Self {
            owner,
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Position of an endpoint in the offer/answer lifecycle
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    New,
    Offering,
    Offered,
    Answering,
    Connected,
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::New => "new",
            SessionPhase::Offering => "offering",
            SessionPhase::Offered => "offered",
            SessionPhase::Answering => "answering",
            SessionPhase::Connected => "connected",
            SessionPhase::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Data channel readiness
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadyState::Connecting => "connecting",
            ReadyState::Open => "open",
            ReadyState::Closing => "closing",
            ReadyState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Transport-level connectivity as reported by the provider.
///
/// Independent of [`SessionPhase`]: the phase tracks description exchange,
/// this tracks ICE/DTLS progress underneath it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Operation attempted on an endpoint, used to tag negotiation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CreateSession,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AttachMedia,
    OpenDataChannel,
    Transport,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transition::CreateSession => "createSession",
            Transition::CreateOffer => "createOffer",
            Transition::CreateAnswer => "createAnswer",
            Transition::SetLocalDescription => "setLocalDescription",
            Transition::SetRemoteDescription => "setRemoteDescription",
            Transition::AttachMedia => "attachMedia",
            Transition::OpenDataChannel => "openDataChannel",
            Transition::Transport => "transport",
        };
        f.write_str(s)
    }
}
