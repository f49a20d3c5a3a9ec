//! Configuration types for the relay channel

use serde::{Deserialize, Serialize};

/// Configuration for the relay signal channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay hub URL (ws:// or wss://), including any fixed query parameters
    pub hub_url: String,

    /// Initial reconnection backoff in milliseconds (default: 1000)
    pub reconnect_backoff_initial_ms: u64,

    /// Maximum reconnection backoff in milliseconds (default: 30000)
    pub reconnect_backoff_max_ms: u64,

    /// Reconnection backoff multiplier (default: 2.0)
    pub reconnect_backoff_multiplier: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            hub_url: "ws://localhost:8080/deviceRHub?type=client".to_string(),
            reconnect_backoff_initial_ms: 1000,
            reconnect_backoff_max_ms: 30000,
            reconnect_backoff_multiplier: 2.0,
        }
    }
}

impl RelayConfig {
    /// Create a configuration for the given hub URL with default backoff
    pub fn new(hub_url: &str) -> Self {
        Self {
            hub_url: hub_url.to_string(),
            ..Default::default()
        }
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `hub_url` is not a ws:// or wss:// URL
    /// - backoff values are zero, inverted, or the multiplier is below 1.0
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.hub_url.starts_with("ws://") && !self.hub_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "hub_url must start with ws:// or wss://, got {}",
                self.hub_url
            )));
        }

        if self.reconnect_backoff_initial_ms == 0 {
            return Err(Error::InvalidConfig(
                "reconnect_backoff_initial_ms must be non-zero".to_string(),
            ));
        }

        if self.reconnect_backoff_max_ms < self.reconnect_backoff_initial_ms {
            return Err(Error::InvalidConfig(format!(
                "reconnect_backoff_max_ms ({}) must be >= reconnect_backoff_initial_ms ({})",
                self.reconnect_backoff_max_ms, self.reconnect_backoff_initial_ms
            )));
        }

        if self.reconnect_backoff_multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "reconnect_backoff_multiplier must be >= 1.0, got {}",
                self.reconnect_backoff_multiplier
            )));
        }

        Ok(())
    }
}
