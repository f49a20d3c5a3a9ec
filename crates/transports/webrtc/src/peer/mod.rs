//! Peer connection sessions

pub mod session;

pub use session::{NegotiationState, OutboundSignal, PeerSession};
