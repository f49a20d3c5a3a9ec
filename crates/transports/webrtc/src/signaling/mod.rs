//! Relay signaling: wire protocol and persistent hub channel

pub mod channel;
pub mod protocol;

pub use channel::{ChannelState, RelaySignalChannel, TokenProvider};
pub use protocol::{SdpSignal, SignalEnvelope, SignalEvent, TransferInfo};
