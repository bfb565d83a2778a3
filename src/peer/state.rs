use crate::peer::types::{Candidate, SessionDescriptor, SessionPhase};
use std::collections::VecDeque;

/// Negotiation state of one endpoint.
///
/// Owned by exactly one [`Endpoint`](crate::peer::connection::Endpoint); the
/// orchestrator only reads snapshots of it.
#[derive(Debug, Clone)]
pub struct EndpointState {
    pub phase: SessionPhase,
    pub local_description: Option<SessionDescriptor>,
    pub remote_description: Option<SessionDescriptor>,
    /// Candidates received before the remote description was set
    pub pending_candidates: VecDeque<Candidate>,
}

impl Default for EndpointState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::New,
            local_description: None,
            remote_description: None,
            pending_candidates: VecDeque::new(),
        }
    }
}

impl EndpointState {
    pub fn is_closed(&self) -> bool {
        self.phase == SessionPhase::Closed
    }

    /// Ready to hand candidates straight to the transport
    pub fn accepts_candidates(&self) -> bool {
        self.remote_description.is_some() && !self.is_closed()
    }

    /// Moves to `closed`; returns false if it already was
    pub fn close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.phase = SessionPhase::Closed;
        self.pending_candidates.clear();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::EndpointId;

    #[test]
    fn close_is_idempotent_and_drops_pending() {
        let mut s = EndpointState::default();
        s.pending_candidates
            .push_back(Candidate::new(EndpointId::Local, "candidate:1"));

        assert!(s.close());
        assert!(s.pending_candidates.is_empty());
        assert!(!s.close());
        assert_eq!(s.phase, SessionPhase::Closed);
    }

    #[test]
    fn candidates_wait_for_remote_description() {
        let mut s = EndpointState::default();
        assert!(!s.accepts_candidates());
        s.remote_description = Some(SessionDescriptor::offer("v=0".into(), "x".into()));
        assert!(s.accepts_candidates());
    }
}
