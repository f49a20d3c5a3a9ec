//! Persistent relay channel to the signaling hub
//!
//! One [`RelaySignalChannel`] owns one underlying hub connection. The
//! transport is WebSocket-only with the negotiation round skipped; the
//! access token is attached per connection attempt through a provider
//! closure so rotated tokens are picked up on reconnect.
//!
//! Group membership is not assumed to survive a transport drop: the
//! group-join invocation is re-issued on every transition into
//! `Connected`, including after automatic reconnection.

use crate::config::RelayConfig;
use crate::signaling::protocol::{
    decode_message_argument, drain_records, handshake_record, HubRecord, SignalEvent,
    RECORD_INVOCATION, RECORD_PING, RECORD_SEPARATOR, TARGET_JOIN_GROUP, TARGET_MESSAGE,
    TARGET_SEND_TO_DEVICE,
};
use crate::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Provider invoked for the bearer token on every connection attempt
pub type TokenProvider = Arc<dyn Fn() -> String + Send + Sync>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Relay channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not yet started, or initial start failed
    Disconnected,
    /// Initial connection attempt in flight
    Connecting,
    /// Hub connection up, group membership registered
    Connected,
    /// Transport dropped, automatic reconnection in progress
    Reconnecting,
    /// Closed by the owner; terminal
    Closed,
}

enum PumpExit {
    Closed,
    Dropped,
}

/// Persistent, auto-reconnecting logical channel to the signaling hub
pub struct RelaySignalChannel {
    config: RelayConfig,
    device_id: String,
    token_provider: TokenProvider,
    outbound: Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>>,
    state_tx: watch::Sender<ChannelState>,
    state_rx: watch::Receiver<ChannelState>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RelaySignalChannel {
    /// Create a channel for the given device
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: RelayConfig,
        device_id: &str,
        token_provider: TokenProvider,
    ) -> Result<Self> {
        config.validate()?;

        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        let (closed_tx, closed_rx) = watch::channel(false);

        Ok(Self {
            config,
            device_id: device_id.to_string(),
            token_provider,
            outbound: Arc::new(RwLock::new(None)),
            state_tx,
            state_rx,
            closed_tx,
            closed_rx,
            supervisor: Mutex::new(None),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    /// Subscribe to lifecycle state transitions
    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    /// Connect to the hub and register for this device's message group
    ///
    /// Decoded inbound events are delivered in arrival order over `events`.
    /// A failure of the initial attempt is surfaced to the caller and the
    /// channel stays `Disconnected`; there is no retry of the initial
    /// attempt. After the first success, reconnection is automatic and
    /// indefinite until [`close`](Self::close).
    pub async fn connect(&self, events: mpsc::UnboundedSender<SignalEvent>) -> Result<()> {
        if self.state() != ChannelState::Disconnected {
            return Err(Error::Signaling(format!(
                "Channel already started (state: {:?})",
                self.state()
            )));
        }

        let _ = self.state_tx.send(ChannelState::Connecting);
        info!(hub_url = %self.config.hub_url, device_id = %self.device_id, "Connecting to relay hub");

        let (ws, residual) =
            match Self::open_and_join(&self.config, &self.device_id, &self.token_provider).await {
                Ok(opened) => opened,
                Err(e) => {
                    let _ = self.state_tx.send(ChannelState::Disconnected);
                    return Err(e);
                }
            };

        let _ = self.state_tx.send(ChannelState::Connected);
        info!(device_id = %self.device_id, "Relay channel connected");

        let handle = tokio::spawn(Self::supervise(
            ws,
            residual,
            self.config.clone(),
            self.device_id.clone(),
            Arc::clone(&self.token_provider),
            Arc::clone(&self.outbound),
            self.state_tx.clone(),
            self.closed_rx.clone(),
            events,
        ));
        *self.supervisor.lock().await = Some(handle);

        Ok(())
    }

    /// Relay a payload to a device through the hub
    pub async fn send_to_device(&self, device_id: &str, kind: &str, data: String) -> Result<()> {
        let record = HubRecord::invocation(
            TARGET_SEND_TO_DEVICE,
            vec![json!(device_id), json!(kind), json!(data)],
        )
        .encode()?;

        let guard = self.outbound.read().await;
        match guard.as_ref() {
            Some(tx) => tx
                .send(Message::Text(record))
                .map_err(|_| Error::Signaling("Relay connection is down".to_string())),
            None => Err(Error::Signaling(
                "Channel is not connected".to_string(),
            )),
        }
    }

    /// Stop the underlying connection
    ///
    /// Idempotent; safe to call on a never-started or already-closed channel.
    pub async fn close(&self) {
        let _ = self.closed_tx.send(true);
        let _ = self.state_tx.send(ChannelState::Closed);
        *self.outbound.write().await = None;

        if let Some(handle) = self.supervisor.lock().await.take() {
            let _ = handle.await;
        }
        debug!(device_id = %self.device_id, "Relay channel closed");
    }

    /// Open a hub connection: token, WebSocket, handshake, group-join
    ///
    /// Returns the stream plus any bytes that arrived in the same frame
    /// as the handshake response; those seed the pump's record buffer.
    async fn open_and_join(
        config: &RelayConfig,
        device_id: &str,
        token_provider: &TokenProvider,
    ) -> Result<(WsStream, String)> {
        let mut url = url::Url::parse(&config.hub_url)
            .map_err(|e| Error::SignalingConnect(format!("Invalid hub URL: {}", e)))?;

        // Token may rotate between attempts; re-invoke the provider each time.
        let token = token_provider();
        if !token.is_empty() {
            url.query_pairs_mut().append_pair("access_token", &token);
        }

        let (mut ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::SignalingConnect(format!("Failed to connect: {}", e)))?;

        ws.send(Message::Text(handshake_record()))
            .await
            .map_err(|e| Error::SignalingConnect(format!("Handshake send failed: {}", e)))?;

        let residual = tokio::time::timeout(HANDSHAKE_TIMEOUT, Self::await_handshake(&mut ws))
            .await
            .map_err(|_| Error::SignalingConnect("Handshake timed out".to_string()))??;

        let join = HubRecord::invocation(TARGET_JOIN_GROUP, vec![json!([device_id])]).encode()?;
        ws.send(Message::Text(join))
            .await
            .map_err(|e| Error::SignalingConnect(format!("Group join failed: {}", e)))?;
        debug!(device_id, "Joined device message group");

        Ok((ws, residual))
    }

    /// Read the hub's handshake response record
    ///
    /// Anything following the response in the same frame is returned so
    /// the caller does not lose records coalesced with the ack.
    async fn await_handshake(ws: &mut WsStream) -> Result<String> {
        let mut buf = String::new();
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    buf.push_str(&text);
                    if let Some(idx) = buf.find(RECORD_SEPARATOR) {
                        let rest = buf.split_off(idx + RECORD_SEPARATOR.len_utf8());
                        buf.pop();
                        let ack: Value = serde_json::from_str(&buf).map_err(|e| {
                            Error::SignalingConnect(format!("Malformed handshake response: {}", e))
                        })?;
                        if let Some(reason) = ack.get("error").and_then(Value::as_str) {
                            return Err(Error::SignalingConnect(format!(
                                "Hub rejected handshake: {}",
                                reason
                            )));
                        }
                        return Ok(rest);
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(Error::SignalingConnect(format!(
                        "Handshake read failed: {}",
                        e
                    )))
                }
                None => {
                    return Err(Error::SignalingConnect(
                        "Connection closed during handshake".to_string(),
                    ))
                }
            }
        }
    }

    /// Own the connection across drops: pump, then reconnect with backoff
    #[allow(clippy::too_many_arguments)]
    async fn supervise(
        mut ws: WsStream,
        mut residual: String,
        config: RelayConfig,
        device_id: String,
        token_provider: TokenProvider,
        outbound: Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>>,
        state_tx: watch::Sender<ChannelState>,
        mut closed_rx: watch::Receiver<bool>,
        events: mpsc::UnboundedSender<SignalEvent>,
    ) {
        loop {
            let exit = Self::pump(ws, residual, &outbound, &events, &mut closed_rx).await;
            *outbound.write().await = None;

            if matches!(exit, PumpExit::Closed) || *closed_rx.borrow() {
                break;
            }

            let _ = state_tx.send(ChannelState::Reconnecting);
            warn!(device_id = %device_id, "Relay transport dropped, reconnecting");

            let mut backoff_ms = config.reconnect_backoff_initial_ms;
            (ws, residual) = loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                    _ = closed_rx.changed() => {}
                }
                if *closed_rx.borrow() {
                    return;
                }

                match Self::open_and_join(&config, &device_id, &token_provider).await {
                    Ok(opened) => break opened,
                    Err(e) => {
                        warn!(error = %e, backoff_ms, "Relay reconnect attempt failed");
                        backoff_ms = ((backoff_ms as f64 * config.reconnect_backoff_multiplier)
                            as u64)
                            .min(config.reconnect_backoff_max_ms);
                    }
                }
            };

            let _ = state_tx.send(ChannelState::Connected);
            info!(device_id = %device_id, "Relay channel resumed");
        }
    }

    /// Drive one live connection until it drops or the channel closes
    async fn pump(
        ws: WsStream,
        residual: String,
        outbound: &Arc<RwLock<Option<mpsc::UnboundedSender<Message>>>>,
        events: &mpsc::UnboundedSender<SignalEvent>,
        closed_rx: &mut watch::Receiver<bool>,
    ) -> PumpExit {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *outbound.write().await = Some(tx);

        // Records that rode in with the handshake response.
        let mut buf = residual;
        for record in drain_records(&mut buf) {
            if let Some(reply) = Self::handle_record(&record, events) {
                if sink.send(reply).await.is_err() {
                    return PumpExit::Dropped;
                }
            }
        }

        loop {
            tokio::select! {
                queued = rx.recv() => {
                    let Some(msg) = queued else { return PumpExit::Dropped };
                    if let Err(e) = sink.send(msg).await {
                        error!(error = %e, "Failed to send hub record");
                        return PumpExit::Dropped;
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            buf.push_str(&text);
                            for record in drain_records(&mut buf) {
                                if let Some(reply) = Self::handle_record(&record, events) {
                                    if sink.send(reply).await.is_err() {
                                        return PumpExit::Dropped;
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Hub connection closed");
                            return PumpExit::Dropped;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "Hub connection error");
                            return PumpExit::Dropped;
                        }
                    }
                }
                _ = closed_rx.changed() => {
                    if *closed_rx.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        return PumpExit::Closed;
                    }
                }
            }
        }
    }

    /// Decode one hub record; a malformed record is logged and dropped,
    /// it never tears the channel down
    fn handle_record(
        record: &str,
        events: &mpsc::UnboundedSender<SignalEvent>,
    ) -> Option<Message> {
        let value: Value = match serde_json::from_str(record) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Dropping malformed hub record");
                return None;
            }
        };

        match value.get("type").and_then(Value::as_u64) {
            Some(kind) if kind == u64::from(RECORD_PING) => {
                HubRecord::ping().encode().ok().map(Message::Text)
            }
            Some(kind) if kind == u64::from(RECORD_INVOCATION) => {
                let target = value.get("target").and_then(Value::as_str).unwrap_or("");
                if target != TARGET_MESSAGE {
                    debug!(target, "Ignoring hub invocation");
                    return None;
                }
                let Some(argument) = value
                    .get("arguments")
                    .and_then(Value::as_array)
                    .and_then(|args| args.first())
                else {
                    warn!("MESSAGE invocation without arguments");
                    return None;
                };
                match decode_message_argument(argument).and_then(SignalEvent::decode) {
                    Ok(event) => {
                        let _ = events.send(event);
                    }
                    Err(e) => warn!(error = %e, "Dropping undecodable envelope"),
                }
                None
            }
            _ => {
                trace!("Ignoring hub record: {}", record);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_channel(url: &str) -> RelaySignalChannel {
        let provider: TokenProvider = Arc::new(|| "token".to_string());
        RelaySignalChannel::new(RelayConfig::new(url), "device-1", provider).unwrap()
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let channel = test_channel("ws://localhost:9");
        let result = channel
            .send_to_device("device-1", "TRANSFER_SDP", "{}".to_string())
            .await;
        assert!(matches!(result, Err(Error::Signaling(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_before_connect() {
        let channel = test_channel("ws://localhost:9");
        channel.close().await;
        assert_eq!(channel.state(), ChannelState::Closed);
        channel.close().await;
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_initial_connect_failure_leaves_disconnected() {
        // Port 9 (discard) is not listening; the initial attempt must fail
        // without engaging the reconnect loop.
        let channel = test_channel("ws://127.0.0.1:9/deviceRHub");
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = channel.connect(tx).await;
        assert!(matches!(result, Err(Error::SignalingConnect(_))));
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[test]
    fn test_ping_record_gets_ping_reply() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reply = RelaySignalChannel::handle_record("{\"type\":6}", &tx);
        assert!(reply.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_malformed_record_is_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(RelaySignalChannel::handle_record("{broken", &tx).is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_message_record_dispatches_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let record = serde_json::json!({
            "type": 1,
            "target": "MESSAGE",
            "arguments": [{"type": "DEVICE_CONNECTED", "deviceId": "d1"}]
        })
        .to_string();
        assert!(RelaySignalChannel::handle_record(&record, &tx).is_none());
        assert_eq!(
            rx.try_recv().unwrap(),
            SignalEvent::DeviceConnected {
                device_id: "d1".to_string()
            }
        );
    }
}
