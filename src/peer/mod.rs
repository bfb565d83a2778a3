pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod sdx;
pub mod state;
pub mod types;

pub use connection::{Endpoint, Ingest};
pub use data_channel::{ChannelMessage, DataChannel, DataChannelManager};
pub use ice::{CandidateRelay, RelayStats};
pub use state::EndpointState;
pub use types::{
    Candidate, ConnectionState, EndpointId, ReadyState, SdpKind, SessionDescriptor, SessionPhase,
    Transition,
};
