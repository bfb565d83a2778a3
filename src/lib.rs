//! Loopback WebRTC call between two in-process endpoints.
//!
//! [`Orchestrator`] plays both the caller and the signaling server: it
//! creates a Local and a Remote endpoint, hands the offer and answer across
//! directly, and relays trickle candidates between them. Transports, media
//! capture and display are pluggable ([`transport`], [`media`]); the crate
//! ships a `webrtc`-backed transport and a deterministic in-memory one.

pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod orchestrator;
pub mod peer;
pub mod transport;
pub mod utils;

pub use config::LoopbackConfig;
pub use error::{Error, Result};
pub use orchestrator::{Controls, Orchestrator};
