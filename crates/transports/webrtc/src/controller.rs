//! Session orchestration
//!
//! [`SessionController`] owns at most one relay channel and one peer
//! session per target device. It routes every inbound signaling event by
//! type: geometry metadata and presence notifications go to external
//! observers, negotiation traffic goes to the peer session, and the
//! session's outbound answers and candidates are relayed back to the
//! device. Connecting to a device supersedes any prior session.

use crate::channels::ChannelRegistry;
use crate::config::RelayConfig;
use crate::ice::parse_ice_servers;
use crate::peer::{OutboundSignal, PeerSession};
use crate::signaling::protocol::{envelope_kind, SdpSignal, SignalEvent};
use crate::signaling::{RelaySignalChannel, TokenProvider};
use crate::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use webrtc::track::track_remote::TrackRemote;

/// Sink for human-readable session activity lines
pub trait ActionLog: Send + Sync {
    /// Append one activity line
    fn add_action(&self, text: &str);
    /// Reset the activity display
    fn clear_actions(&self);
}

/// Action log that writes through `tracing`
#[derive(Debug, Default)]
pub struct TracingActionLog;

impl ActionLog for TracingActionLog {
    fn add_action(&self, text: &str) {
        info!(target: "devicecast::actions", "{}", text);
    }

    fn clear_actions(&self) {}
}

/// Device presence notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEvent {
    /// Device came online
    Connected,
    /// Device went offline
    Disconnected,
}

/// Observer for display-geometry metadata
pub type TransferInfoHandler = Arc<dyn Fn(u32, u32) + Send + Sync>;

/// Observer for presence notifications, with the originating device id
pub type PresenceHandler = Arc<dyn Fn(&str, PresenceEvent) + Send + Sync>;

/// Observer for device media tracks
pub type TrackObserver =
    Arc<dyn Fn(Arc<TrackRemote>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// External observers wired into each session the controller starts
#[derive(Default, Clone)]
pub struct SessionObservers {
    /// Called with `(width, height)` for each geometry envelope
    pub on_transfer_info: Option<TransferInfoHandler>,
    /// Called on presence notifications
    pub on_presence: Option<PresenceHandler>,
    /// Called when the device starts a media track
    pub on_track: Option<TrackObserver>,
}

impl SessionObservers {
    /// No observers
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the geometry observer
    pub fn with_transfer_info(mut self, handler: TransferInfoHandler) -> Self {
        self.on_transfer_info = Some(handler);
        self
    }

    /// Set the presence observer
    pub fn with_presence(mut self, handler: PresenceHandler) -> Self {
        self.on_presence = Some(handler);
        self
    }

    /// Set the media track observer
    pub fn with_track(mut self, handler: TrackObserver) -> Self {
        self.on_track = Some(handler);
        self
    }
}

/// Routes decoded signaling events to the session and observers
pub(crate) struct Router {
    session: Arc<PeerSession>,
    observers: SessionObservers,
    actions: Arc<dyn ActionLog>,
}

impl Router {
    pub(crate) fn new(
        session: Arc<PeerSession>,
        observers: SessionObservers,
        actions: Arc<dyn ActionLog>,
    ) -> Self {
        Self {
            session,
            observers,
            actions,
        }
    }

    pub(crate) async fn route(&self, event: SignalEvent) {
        match event {
            SignalEvent::TransferInfo { device_id, info } => {
                debug!(device_id = %device_id, ?info, "Display geometry received");
                self.actions.add_action(&format!(
                    "Device reported display {}x{}",
                    info.width, info.height
                ));
                if let Some(handler) = &self.observers.on_transfer_info {
                    handler(info.width, info.height);
                }
            }
            SignalEvent::Sdp { device_id, signal } => self.route_sdp(&device_id, signal).await,
            SignalEvent::DeviceConnected { device_id } => {
                self.actions
                    .add_action(&format!("Device {} connected", device_id));
                if let Some(handler) = &self.observers.on_presence {
                    handler(&device_id, PresenceEvent::Connected);
                }
            }
            SignalEvent::DeviceDisconnected { device_id } => {
                self.actions
                    .add_action(&format!("Device {} disconnected", device_id));
                if let Some(handler) = &self.observers.on_presence {
                    handler(&device_id, PresenceEvent::Disconnected);
                }
            }
            SignalEvent::Unhandled { kind, device_id } => {
                warn!(kind = %kind, device_id = %device_id, "Ignoring unhandled envelope");
            }
        }
    }

    async fn route_sdp(&self, device_id: &str, signal: SdpSignal) {
        match signal {
            SdpSignal::Offer { sdp, ice } => {
                let servers = parse_ice_servers(&ice);
                self.actions.add_action(&format!(
                    "Offer received from {} ({} ICE servers)",
                    device_id,
                    servers.len()
                ));
                if let Err(e) = self.session.handle_remote_offer(&sdp, &servers).await {
                    error!(device_id = %device_id, "Failed to answer offer: {}", e);
                    self.actions
                        .add_action(&format!("Negotiation failed: {}", e));
                }
            }
            SdpSignal::Candidate {
                sdp_mid,
                sdp_mline_index,
                candidate,
            } => {
                // One bad candidate must not abort a negotiation others
                // may still complete.
                if let Err(e) = self
                    .session
                    .add_remote_candidate(&candidate, Some(sdp_mid), sdp_mline_index)
                    .await
                {
                    warn!(device_id = %device_id, "Dropping remote candidate: {}", e);
                }
            }
            SdpSignal::Answer { .. } => {
                warn!(device_id = %device_id, "Ignoring answer: this side is the answerer");
            }
        }
    }
}

struct ActiveSession {
    device_id: String,
    channel: Arc<RelaySignalChannel>,
    session: Arc<PeerSession>,
    router_task: tokio::task::JoinHandle<()>,
    relay_task: tokio::task::JoinHandle<()>,
}

/// Top-level orchestrator for controlling one device at a time
pub struct SessionController {
    config: RelayConfig,
    token_provider: TokenProvider,
    observers: SessionObservers,
    actions: Arc<dyn ActionLog>,
    active: RwLock<Option<ActiveSession>>,
}

impl SessionController {
    /// Create a controller with the default tracing action log
    pub fn new(
        config: RelayConfig,
        token_provider: TokenProvider,
        observers: SessionObservers,
    ) -> Self {
        Self::with_action_log(config, token_provider, observers, Arc::new(TracingActionLog))
    }

    /// Create a controller with a custom action log sink
    pub fn with_action_log(
        config: RelayConfig,
        token_provider: TokenProvider,
        observers: SessionObservers,
        actions: Arc<dyn ActionLog>,
    ) -> Self {
        Self {
            config,
            token_provider,
            observers,
            actions,
            active: RwLock::new(None),
        }
    }

    /// Connect to a device
    ///
    /// Tears down any prior session first, then starts the relay channel
    /// and registers for the device's message group. The peer connection
    /// itself is established later, when the device's offer arrives.
    pub async fn connect(&self, device_id: &str) -> Result<()> {
        self.cleanup().await;

        self.actions.clear_actions();
        self.actions
            .add_action(&format!("Connecting to {}", device_id));

        let channel = Arc::new(RelaySignalChannel::new(
            self.config.clone(),
            device_id,
            Arc::clone(&self.token_provider),
        )?);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundSignal>();
        let session = Arc::new(PeerSession::new(device_id, outbound_tx));

        channel.connect(events_tx).await?;
        session.expect_offer();

        if let Some(handler) = self.observers.on_track.clone() {
            session.on_track(move |track| handler(track)).await;
        }

        let router = Router::new(
            Arc::clone(&session),
            self.observers.clone(),
            Arc::clone(&self.actions),
        );
        let router_task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                router.route(event).await;
            }
        });

        let relay_channel = Arc::clone(&channel);
        let relay_task = tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                let json = match outbound.signal.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to encode outbound signal: {}", e);
                        continue;
                    }
                };
                if let Err(e) = relay_channel
                    .send_to_device(&outbound.device_id, envelope_kind::TRANSFER_SDP, json)
                    .await
                {
                    warn!(device_id = %outbound.device_id, "Failed to relay signal: {}", e);
                }
            }
        });

        *self.active.write().await = Some(ActiveSession {
            device_id: device_id.to_string(),
            channel,
            session,
            router_task,
            relay_task,
        });
        info!(device_id = %device_id, "Controller connected");

        Ok(())
    }

    /// Device of the active session, if any
    pub async fn device_id(&self) -> Option<String> {
        self.active.read().await.as_ref().map(|a| a.device_id.clone())
    }

    /// The active peer session, if any
    pub async fn session(&self) -> Option<Arc<PeerSession>> {
        self.active.read().await.as_ref().map(|a| Arc::clone(&a.session))
    }

    /// Data channels of the active session, if any
    pub async fn channels(&self) -> Option<ChannelRegistry> {
        self.active.read().await.as_ref().map(|a| a.session.channels())
    }

    /// Tear down the active session
    ///
    /// Safe to call multiple times and from any negotiation state; late
    /// callbacks firing against the closed session are no-ops.
    pub async fn cleanup(&self) {
        let Some(active) = self.active.write().await.take() else {
            return;
        };

        active.channel.close().await;
        active.session.close().await;
        active.router_task.abort();
        active.relay_task.abort();

        self.actions
            .add_action(&format!("Session with {} closed", active.device_id));
        info!(device_id = %active.device_id, "Controller cleaned up");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::protocol::TransferInfo;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingActionLog {
        lines: Mutex<Vec<String>>,
        clears: Mutex<u32>,
    }

    impl ActionLog for RecordingActionLog {
        fn add_action(&self, text: &str) {
            self.lines.lock().unwrap().push(text.to_string());
        }

        fn clear_actions(&self) {
            *self.clears.lock().unwrap() += 1;
        }
    }

    fn test_router(
        observers: SessionObservers,
    ) -> (
        Router,
        mpsc::UnboundedReceiver<OutboundSignal>,
        Arc<RecordingActionLog>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let session = Arc::new(PeerSession::new("d1", outbound_tx));
        let actions = Arc::new(RecordingActionLog::default());
        let router = Router::new(session, observers, actions.clone());
        (router, outbound_rx, actions)
    }

    async fn device_offer_sdp() -> String {
        use webrtc::api::interceptor_registry::register_default_interceptors;
        use webrtc::api::media_engine::MediaEngine;
        use webrtc::api::APIBuilder;
        use webrtc::interceptor::registry::Registry;
        use webrtc::peer_connection::configuration::RTCConfiguration;

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let registry =
            register_default_interceptors(Registry::new(), &mut media_engine).unwrap();
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        pc.create_data_channel("controlChanel", None).await.unwrap();
        pc.create_offer(None).await.unwrap().sdp
    }

    #[tokio::test]
    async fn test_transfer_info_reaches_observer_once() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        let observers = SessionObservers::new()
            .with_transfer_info(Arc::new(move |w, h| seen.lock().unwrap().push((w, h))));
        let (router, _outbound, actions) = test_router(observers);

        router
            .route(SignalEvent::TransferInfo {
                device_id: "d1".to_string(),
                info: TransferInfo {
                    width: 1080,
                    height: 1920,
                },
            })
            .await;

        assert_eq!(*calls.lock().unwrap(), vec![(1080, 1920)]);
        assert_eq!(actions.lines.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_offer_yields_exactly_one_answer() {
        let sdp = device_offer_sdp().await;
        let (router, mut outbound, _actions) = test_router(SessionObservers::new());

        router
            .route(SignalEvent::Sdp {
                device_id: "d1".to_string(),
                signal: SdpSignal::Offer {
                    sdp,
                    ice: vec!["s1|111|u|c".to_string()],
                },
            })
            .await;

        // Candidates may interleave ahead of the answer once gathering
        // starts; the answer itself must still arrive.
        loop {
            let sent = outbound.recv().await.unwrap();
            assert_eq!(sent.device_id, "d1");
            match sent.signal {
                SdpSignal::Answer { .. } => break,
                SdpSignal::Candidate { .. } => continue,
                other => panic!("expected answer or candidate, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_early_candidate_is_dropped_not_fatal() {
        let (router, _outbound, _actions) = test_router(SessionObservers::new());
        router
            .route(SignalEvent::Sdp {
                device_id: "d1".to_string(),
                signal: SdpSignal::Candidate {
                    sdp_mid: "0".to_string(),
                    sdp_mline_index: Some(0),
                    candidate: "candidate:1 1 udp 1 192.0.2.1 1 typ host".to_string(),
                },
            })
            .await;
        // Routing continues to work afterwards.
        router
            .route(SignalEvent::Unhandled {
                kind: "X".to_string(),
                device_id: "d1".to_string(),
            })
            .await;
    }

    #[tokio::test]
    async fn test_presence_events_reach_observer() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        let observers = SessionObservers::new().with_presence(Arc::new(move |id: &str, event| {
            seen.lock().unwrap().push((id.to_string(), event));
        }));
        let (router, _outbound, _actions) = test_router(observers);

        router
            .route(SignalEvent::DeviceConnected {
                device_id: "d1".to_string(),
            })
            .await;
        router
            .route(SignalEvent::DeviceDisconnected {
                device_id: "d1".to_string(),
            })
            .await;

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                ("d1".to_string(), PresenceEvent::Connected),
                ("d1".to_string(), PresenceEvent::Disconnected),
            ]
        );
    }

    #[tokio::test]
    async fn test_cleanup_without_connect_is_noop() {
        let provider: TokenProvider = Arc::new(String::new);
        let controller = SessionController::new(
            RelayConfig::default(),
            provider,
            SessionObservers::new(),
        );
        controller.cleanup().await;
        controller.cleanup().await;
        assert!(controller.session().await.is_none());
        assert!(controller.device_id().await.is_none());
    }
}
