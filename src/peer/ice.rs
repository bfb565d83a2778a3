use crate::error::Error;
use crate::logger::dump_candidate;
use crate::peer::connection::{Endpoint, Ingest};
use crate::peer::types::Candidate;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Per-session counters kept by the relay
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Handed to the counterpart and submitted to its transport
    pub applied: usize,
    /// Handed to the counterpart and held for replay
    pub queued: usize,
    /// Refused by the counterpart's transport
    pub rejected: usize,
    /// Counterpart already closed
    pub stale: usize,
    /// Discovered after the owning endpoint closed; never forwarded
    pub dropped: usize,
}

impl RelayStats {
    pub fn forwarded(&self) -> usize {
        self.applied + self.queued + self.rejected
    }
}

/// Ferries trickle candidates from the endpoint that discovered them to
/// its counterpart
#[derive(Default)]
pub struct CandidateRelay {
    stats: Mutex<RelayStats>,
}

impl CandidateRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn on_candidate_discovered(&self, from: &Endpoint, candidate: Candidate) {
        if from.is_closed() {
            debug!(endpoint = %from.id(), "Dropping candidate discovered after close");
            self.stats.lock().dropped += 1;
            return;
        }
        let Some(peer) = from.counterpart() else {
            warn!(endpoint = %from.id(), "No counterpart to relay candidate to");
            self.stats.lock().dropped += 1;
            return;
        };

        dump_candidate(&from.id().to_string().to_uppercase(), &candidate);

        match peer.ingest_candidate(candidate).await {
            Ok(Ingest::Applied) => self.stats.lock().applied += 1,
            Ok(Ingest::Queued) => self.stats.lock().queued += 1,
            Ok(Ingest::Rejected) => self.stats.lock().rejected += 1,
            Err(e @ Error::StaleCandidate { .. }) => {
                warn!("{}", e);
                self.stats.lock().stale += 1;
            }
            Err(e) => warn!(endpoint = %peer.id(), "Candidate relay failed: {}", e),
        }
    }

    pub fn stats(&self) -> RelayStats {
        *self.stats.lock()
    }
}
