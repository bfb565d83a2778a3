use crate::config::LogConfig;
use crate::peer::types::{Candidate, EndpointId, SessionDescriptor};
use tracing::debug;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

/// Timestamp layout for every diagnostic line
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Installs the global subscriber. Safe to call more than once.
pub fn init(config: &LogConfig) {
    if !config.enabled {
        return;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let _ = tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Trickle candidate as it passes through the relay
pub fn dump_candidate(label: &str, cand: &Candidate) {
    debug!(
        "Trickle {label}: owner={} candidate={} sdp_mid={:?} sdp_mline_index={:?}",
        cand.owner, cand.candidate, cand.sdp_mid, cand.sdp_mline_index
    );
}

pub fn dump_descriptor(endpoint: EndpointId, desc: &SessionDescriptor) {
    debug!(
        "{} from {endpoint} (session {}):\n{}",
        desc.kind, desc.session_id, desc.sdp
    );
}
