//! Error types for the DeviceCast WebRTC transport

/// Result type alias using the transport Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating or running a device session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed ICE descriptor entry or signaling payload
    #[error("Parse error: {0}")]
    Parse(String),

    /// Relay hub failed to start
    #[error("Signaling connect failed: {0}")]
    SignalingConnect(String),

    /// Relay channel fault after startup (send while disconnected, framing)
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// SDP create/set failure; the session is terminal after this
    #[error("SDP negotiation error: {0}")]
    Sdp(String),

    /// Remote candidate could not be applied; the session stays alive
    #[error("ICE candidate error: {0}")]
    IceCandidate(String),

    /// Negotiation ordering violation (candidate before offer, offer racing)
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannel(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if the session survives this error (recovered by dropping the
    /// offending item; negotiation continues)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Parse(_) | Error::IceCandidate(_) | Error::Negotiation(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error leaves the session in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Sdp(_) | Error::WebRtc(_))
    }
}
