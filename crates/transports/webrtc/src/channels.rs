//! Device data channels
//!
//! Data channels are created by the device, never locally: the controller
//! answers offers and waits for the device's channels to arrive. Labels are
//! fixed by the device firmware, including its spelling of
//! [`CONTROL_CHANNEL_LABEL`].

use crate::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};
use webrtc::data_channel::RTCDataChannel;

/// Label of the device's command channel (device-side spelling)
pub const CONTROL_CHANNEL_LABEL: &str = "controlChanel";

/// Label of the device's file transfer channel
pub const FILE_CHANNEL_LABEL: &str = "fileChannel";

/// Data channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChannelState {
    /// Channel announced but not yet open
    Connecting,
    /// Channel is open and ready for messages
    Open,
    /// Channel is closed
    Closed,
}

/// Wrapper around a device-created data channel
///
/// Tracks open/closed state and byte counters, and exposes typed send
/// and receive on top of the raw channel.
pub struct DeviceChannel {
    label: String,
    rtc_channel: Arc<RTCDataChannel>,
    state: Arc<RwLock<DeviceChannelState>>,
    bytes_sent: Arc<RwLock<u64>>,
    bytes_received: Arc<RwLock<u64>>,
}

impl DeviceChannel {
    /// Wrap a channel announced by the remote device
    pub fn from_rtc_channel(rtc_channel: Arc<RTCDataChannel>) -> Self {
        let channel = Self {
            label: rtc_channel.label().to_string(),
            rtc_channel,
            state: Arc::new(RwLock::new(DeviceChannelState::Connecting)),
            bytes_sent: Arc::new(RwLock::new(0u64)),
            bytes_received: Arc::new(RwLock::new(0u64)),
        };
        channel.setup_state_handlers();
        channel.install_default_observer();
        channel
    }

    /// Default inbound observer: count and log every message so traffic
    /// is visible even before a consumer installs its own handler
    fn install_default_observer(&self) {
        let bytes_received = Arc::clone(&self.bytes_received);
        let label = self.label.clone();
        self.rtc_channel.on_message(Box::new(move |msg| {
            let bytes_received = Arc::clone(&bytes_received);
            let label = label.clone();
            let len = msg.data.len();
            Box::pin(async move {
                *bytes_received.write().await += len as u64;
                debug!("Received {} bytes on data channel '{}'", len, label);
            })
        }));
    }

    fn setup_state_handlers(&self) {
        let state = Arc::clone(&self.state);
        let label = self.label.clone();
        self.rtc_channel.on_open(Box::new(move || {
            let state = Arc::clone(&state);
            let label = label.clone();
            Box::pin(async move {
                debug!("Data channel '{}' opened", label);
                *state.write().await = DeviceChannelState::Open;
            })
        }));

        let state = Arc::clone(&self.state);
        let label = self.label.clone();
        self.rtc_channel.on_close(Box::new(move || {
            let state = Arc::clone(&state);
            let label = label.clone();
            Box::pin(async move {
                debug!("Data channel '{}' closed", label);
                *state.write().await = DeviceChannelState::Closed;
            })
        }));

        let label = self.label.clone();
        self.rtc_channel.on_error(Box::new(move |err| {
            let label = label.clone();
            Box::pin(async move {
                error!("Data channel '{}' error: {}", label, err);
            })
        }));
    }

    /// Channel label as announced by the device
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current channel state
    pub async fn state(&self) -> DeviceChannelState {
        *self.state.read().await
    }

    /// Whether the channel is open for sending
    pub async fn is_open(&self) -> bool {
        self.state().await == DeviceChannelState::Open
    }

    /// Send a UTF-8 text payload
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.ensure_open().await?;
        self.rtc_channel
            .send_text(text.to_string())
            .await
            .map_err(|e| Error::DataChannel(format!("Failed to send text: {}", e)))?;
        *self.bytes_sent.write().await += text.len() as u64;
        Ok(())
    }

    /// Send raw binary data
    pub async fn send_binary(&self, data: &[u8]) -> Result<()> {
        self.ensure_open().await?;
        self.rtc_channel
            .send(&Bytes::copy_from_slice(data))
            .await
            .map_err(|e| Error::DataChannel(format!("Failed to send binary: {}", e)))?;
        *self.bytes_sent.write().await += data.len() as u64;
        Ok(())
    }

    async fn ensure_open(&self) -> Result<()> {
        let state = self.state().await;
        if state != DeviceChannelState::Open {
            return Err(Error::DataChannel(format!(
                "Data channel '{}' is not open (state: {:?})",
                self.label, state
            )));
        }
        Ok(())
    }

    /// Set the inbound message handler, replacing the default observer
    pub fn on_message<F, Fut>(&self, handler: F)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let bytes_received = Arc::clone(&self.bytes_received);
        let handler = Arc::new(handler);

        self.rtc_channel.on_message(Box::new(move |msg| {
            let bytes_received = Arc::clone(&bytes_received);
            let handler = Arc::clone(&handler);
            let data = msg.data.to_vec();
            let data_len = data.len();

            Box::pin(async move {
                *bytes_received.write().await += data_len as u64;
                handler(data).await;
            })
        }));
    }

    /// Total bytes sent on this channel
    pub async fn bytes_sent(&self) -> u64 {
        *self.bytes_sent.read().await
    }

    /// Total bytes received on this channel
    pub async fn bytes_received(&self) -> u64 {
        *self.bytes_received.read().await
    }

    /// Close the underlying channel
    pub async fn close(&self) {
        if let Err(e) = self.rtc_channel.close().await {
            warn!("Error closing data channel '{}': {}", self.label, e);
        }
        *self.state.write().await = DeviceChannelState::Closed;
    }
}

/// Registry of the device's channels, keyed by label
///
/// Cloning the registry clones a handle to the same underlying map.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: Arc<RwLock<HashMap<String, Arc<DeviceChannel>>>>,
}

impl ChannelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel; replaces any previous channel with that label
    pub async fn register(&self, channel: Arc<DeviceChannel>) {
        let label = channel.label().to_string();
        if let Some(previous) = self.channels.write().await.insert(label.clone(), channel) {
            warn!("Replacing data channel '{}'", previous.label());
        }
        debug!("Registered data channel '{}'", label);
    }

    /// Look up a channel by label
    pub async fn get(&self, label: &str) -> Option<Arc<DeviceChannel>> {
        self.channels.read().await.get(label).cloned()
    }

    /// The device's command channel, if announced
    pub async fn control(&self) -> Option<Arc<DeviceChannel>> {
        self.get(CONTROL_CHANNEL_LABEL).await
    }

    /// The device's file transfer channel, if announced
    pub async fn file(&self) -> Option<Arc<DeviceChannel>> {
        self.get(FILE_CHANNEL_LABEL).await
    }

    /// Labels of all registered channels
    pub async fn labels(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }

    /// Close and drop every registered channel
    pub async fn clear(&self) {
        let drained: Vec<_> = self.channels.write().await.drain().collect();
        for (_, channel) in drained {
            channel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_starts_empty() {
        tokio_test::block_on(async {
            let registry = ChannelRegistry::new();
            assert!(registry.labels().await.is_empty());
            assert!(registry.control().await.is_none());
            assert!(registry.file().await.is_none());
        });
    }

    #[test]
    fn test_fixed_labels() {
        // The control label's spelling is fixed by the device firmware.
        assert_eq!(CONTROL_CHANNEL_LABEL, "controlChanel");
        assert_eq!(FILE_CHANNEL_LABEL, "fileChannel");
    }
}
