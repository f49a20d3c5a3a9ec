//! WebRTC session control for remote devices
//!
//! This crate implements the controller side of a device remote-control
//! transport: negotiation metadata travels over a persistent relay hub
//! channel, and the peer connection itself is answered from offers the
//! device sends. The device owns channel and track creation; this side
//! answers, trickles candidates, and consumes what arrives.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  SessionController                                   │
//! │  ├─ RelaySignalChannel (hub records over WebSocket)  │
//! │  │   └─ auto-reconnect, group re-join per connect    │
//! │  ├─ PeerSession (answers the device's offers)        │
//! │  │   └─ ChannelRegistry (controlChanel, fileChannel) │
//! │  └─ SessionObservers (geometry, presence, tracks)    │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use devicecast_webrtc::{RelayConfig, SessionController, SessionObservers, TokenProvider};
//! use std::sync::Arc;
//!
//! # async fn example() -> devicecast_webrtc::Result<()> {
//! let token: TokenProvider = Arc::new(|| "bearer-token".to_string());
//! let observers = SessionObservers::new()
//!     .with_transfer_info(Arc::new(|width, height| {
//!         println!("device display: {}x{}", width, height);
//!     }));
//!
//! let controller = SessionController::new(
//!     RelayConfig::new("wss://relay.example.com/deviceRHub?type=client"),
//!     token,
//!     observers,
//! );
//! controller.connect("device-1").await?;
//! // ... the device's offer arrives and is answered automatically ...
//! controller.cleanup().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod channels;
pub mod config;
pub mod controller;
pub mod error;
pub mod ice;
pub mod peer;
pub mod signaling;

// Re-exports for public API
pub use channels::{
    ChannelRegistry, DeviceChannel, DeviceChannelState, CONTROL_CHANNEL_LABEL, FILE_CHANNEL_LABEL,
};
pub use config::RelayConfig;
pub use controller::{
    ActionLog, PresenceEvent, SessionController, SessionObservers, TracingActionLog,
};
pub use error::{Error, Result};
pub use ice::{parse_ice_servers, IceServerDescriptor};
pub use peer::{NegotiationState, OutboundSignal, PeerSession};
pub use signaling::{
    ChannelState, RelaySignalChannel, SdpSignal, SignalEnvelope, SignalEvent, TokenProvider,
    TransferInfo,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
    }
}
