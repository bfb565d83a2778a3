//! Error types for loopback negotiation

use crate::peer::types::{EndpointId, ReadyState, SessionPhase, Transition};

/// Result type alias using the crate [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the orchestrator and its callers.
///
/// Raw provider failures never appear here; endpoints translate
/// [`TransportError`] into one of these before returning.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Camera/microphone could not be acquired; retry with `start()`
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// Protocol-level failure; both endpoints are closed together
    #[error("Negotiation failed on {endpoint} during {transition}: {reason}")]
    Negotiation {
        endpoint: EndpointId,
        transition: Transition,
        reason: String,
    },

    /// Description applied out of order (a caller bug)
    #[error("Protocol sequence violation on {endpoint}: {attempted} is not valid in phase {phase}")]
    ProtocolSequence {
        endpoint: EndpointId,
        phase: SessionPhase,
        attempted: String,
    },

    /// Candidate arrived after the target session closed
    #[error("Stale candidate for closed endpoint {endpoint}")]
    StaleCandidate { endpoint: EndpointId },

    /// Send attempted on a channel that is not open
    #[error("Data channel '{label}' is not open (state: {state})")]
    ChannelNotOpen { label: String, state: ReadyState },

    /// Transport refused a message on an open channel
    #[error("Data channel '{label}' send failed: {reason}")]
    ChannelSend { label: String, reason: String },

    #[error("Session already started")]
    AlreadyStarted,

    /// An in-flight operation completed after its endpoint was closed
    #[error("Endpoint {endpoint} is closed")]
    SessionClosed { endpoint: EndpointId },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

impl Error {
    /// Whether calling `start()` again (after `hangup()` where needed) may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::MediaAcquisition(_) | Error::Timeout(_))
    }

    /// Whether the error ends the current session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Negotiation { .. } | Error::ProtocolSequence { .. }
        )
    }

    /// Errors that only mean "this session is gone" and need no reporting
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Error::StaleCandidate { .. } | Error::SessionClosed { .. }
        )
    }
}

/// Failure reported by a transport provider
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("session closed")]
    Closed,

    #[error("webrtc: {0}")]
    WebRtc(String),
}

impl From<webrtc::Error> for TransportError {
    fn from(e: webrtc::Error) -> Self {
        TransportError::WebRtc(e.to_string())
    }
}

/// Failure reported by a media capture provider
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct MediaError(pub String);

impl From<MediaError> for Error {
    fn from(e: MediaError) -> Self {
        Error::MediaAcquisition(e.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(Error::MediaAcquisition("no camera".into()).is_retryable());
        let neg = Error::Negotiation {
            endpoint: EndpointId::Local,
            transition: Transition::CreateOffer,
            reason: "boom".into(),
        };
        assert!(neg.is_fatal());
        assert!(!neg.is_retryable());
        assert!(Error::StaleCandidate {
            endpoint: EndpointId::Remote
        }
        .is_benign());
    }

    #[test]
    fn negotiation_message_names_endpoint_and_transition() {
        let e = Error::Negotiation {
            endpoint: EndpointId::Remote,
            transition: Transition::CreateAnswer,
            reason: "no codecs".into(),
        };
        assert_eq!(
            e.to_string(),
            "Negotiation failed on remote during createAnswer: no codecs"
        );
    }
}
