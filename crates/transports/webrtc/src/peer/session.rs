//! Per-device peer connection session
//!
//! The controller side is the answerer: the device sends the offer
//! (carrying the ICE servers to use for that negotiation), this session
//! answers it and trickles local candidates back as they surface. Media
//! tracks and data channels are created device-side only.

use crate::channels::{ChannelRegistry, DeviceChannel};
use crate::ice::IceServerDescriptor;
use crate::signaling::protocol::SdpSignal;
use crate::{Error, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

/// Negotiation payload bound for the remote device
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSignal {
    /// Target device
    pub device_id: String,
    /// Answer or local candidate
    pub signal: SdpSignal,
}

/// Negotiation lifecycle of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Session created, relay not yet ready
    New,
    /// Relay ready, waiting for the device's offer
    AwaitingRemoteOffer,
    /// Offer received, answer in flight
    Answering,
    /// Peer connection established
    Connected,
    /// Peer connection failed
    Failed,
    /// Closed by the owner; terminal
    Closed,
}

/// Callback invoked when the device starts a media track
pub type TrackHandler =
    Box<dyn Fn(Arc<TrackRemote>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// One peer connection to one device
pub struct PeerSession {
    session_id: String,
    device_id: String,
    outbound: mpsc::UnboundedSender<OutboundSignal>,
    pc: RwLock<Option<Arc<RTCPeerConnection>>>,
    channels: ChannelRegistry,
    track_handler: Arc<RwLock<Option<TrackHandler>>>,
    state_tx: watch::Sender<NegotiationState>,
    state_rx: watch::Receiver<NegotiationState>,
}

impl PeerSession {
    /// Create a session for the given device
    ///
    /// Outbound answers and candidates are queued on `outbound`; the
    /// owner relays them to the device.
    pub fn new(device_id: &str, outbound: mpsc::UnboundedSender<OutboundSignal>) -> Self {
        let (state_tx, state_rx) = watch::channel(NegotiationState::New);
        Self {
            session_id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            outbound,
            pc: RwLock::new(None),
            channels: ChannelRegistry::new(),
            track_handler: Arc::new(RwLock::new(None)),
            state_tx,
            state_rx,
        }
    }

    /// Unique session identifier
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Device this session negotiates with
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Current negotiation state
    pub fn state(&self) -> NegotiationState {
        *self.state_rx.borrow()
    }

    /// Subscribe to negotiation state transitions
    pub fn state_changes(&self) -> watch::Receiver<NegotiationState> {
        self.state_rx.clone()
    }

    /// The device's data channels
    pub fn channels(&self) -> ChannelRegistry {
        self.channels.clone()
    }

    /// Mark the relay as ready so an offer is expected
    pub fn expect_offer(&self) {
        if self.state() == NegotiationState::New {
            let _ = self.state_tx.send(NegotiationState::AwaitingRemoteOffer);
        }
    }

    /// Register a handler for device media tracks
    pub async fn on_track<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<TrackRemote>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.track_handler.write().await =
            Some(Box::new(move |track| Box::pin(handler(track))));
    }

    /// Answer a remote offer
    ///
    /// Builds a fresh peer connection configured with the ICE servers the
    /// offer carried, applies the offer, and queues the answer on the
    /// outbound channel. Local candidates are relayed as they surface.
    ///
    /// An offer arriving while a previous one is still being answered is
    /// rejected; an offer on an established session tears the old peer
    /// down and renegotiates.
    pub async fn handle_remote_offer(
        &self,
        offer_sdp: &str,
        ice_servers: &[IceServerDescriptor],
    ) -> Result<()> {
        match self.state() {
            NegotiationState::Answering => {
                return Err(Error::Negotiation(
                    "An offer is already being answered".to_string(),
                ));
            }
            NegotiationState::Closed => {
                return Err(Error::Negotiation("Session is closed".to_string()));
            }
            state => {
                debug!(session_id = %self.session_id, ?state, "Handling remote offer");
            }
        }
        let _ = self.state_tx.send(NegotiationState::Answering);

        // A renegotiation offer replaces the previous peer wholesale.
        if let Some(old) = self.pc.write().await.take() {
            info!(session_id = %self.session_id, "Replacing peer connection for renegotiation");
            self.channels.clear().await;
            let _ = old.close().await;
        }

        match self.negotiate(offer_sdp, ice_servers).await {
            Ok(pc) => {
                *self.pc.write().await = Some(pc);
                Ok(())
            }
            Err(e) => {
                let _ = self.state_tx.send(NegotiationState::Failed);
                Err(e)
            }
        }
    }

    async fn negotiate(
        &self,
        offer_sdp: &str,
        ice_servers: &[IceServerDescriptor],
    ) -> Result<Arc<RTCPeerConnection>> {
        let pc = self.build_peer(ice_servers).await?;

        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| Error::Sdp(format!("Malformed remote offer: {}", e)))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to apply remote offer: {}", e)))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to create answer: {}", e)))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| Error::Sdp(format!("Failed to apply local answer: {}", e)))?;

        self.outbound
            .send(OutboundSignal {
                device_id: self.device_id.clone(),
                signal: SdpSignal::Answer { sdp: answer.sdp },
            })
            .map_err(|_| Error::Signaling("Outbound signal queue is closed".to_string()))?;
        info!(session_id = %self.session_id, device_id = %self.device_id, "Answer queued");

        Ok(pc)
    }

    async fn build_peer(
        &self,
        ice_servers: &[IceServerDescriptor],
    ) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::WebRtc(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(IceServerDescriptor::to_rtc_ice_server)
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| Error::WebRtc(format!("Failed to create peer connection: {}", e)))?,
        );

        // Candidates are relayed eagerly; the device buffers any that
        // arrive before its answer round-trip completes.
        let outbound = self.outbound.clone();
        let device_id = self.device_id.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let outbound = outbound.clone();
            let device_id = device_id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!(device_id = %device_id, "End of local candidates");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = outbound.send(OutboundSignal {
                            device_id,
                            signal: SdpSignal::Candidate {
                                sdp_mid: init.sdp_mid.unwrap_or_default(),
                                sdp_mline_index: init.sdp_mline_index,
                                candidate: init.candidate,
                            },
                        });
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let state_tx = self.state_tx.clone();
        let session_id = self.session_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let state_tx = state_tx.clone();
            let session_id = session_id.clone();
            Box::pin(async move {
                debug!(session_id = %session_id, ?state, "Peer connection state changed");
                // Transitions observed after close are stale; Closed is terminal.
                if *state_tx.borrow() == NegotiationState::Closed {
                    return;
                }
                match state {
                    RTCPeerConnectionState::Connected => {
                        info!(session_id = %session_id, "Peer connection established");
                        let _ = state_tx.send(NegotiationState::Connected);
                    }
                    RTCPeerConnectionState::Failed => {
                        warn!(session_id = %session_id, "Peer connection failed");
                        let _ = state_tx.send(NegotiationState::Failed);
                    }
                    _ => {}
                }
            })
        }));

        pc.on_ice_connection_state_change(Box::new(move |state| {
            Box::pin(async move {
                debug!(?state, "ICE connection state changed");
            })
        }));

        let channels = self.channels.clone();
        pc.on_data_channel(Box::new(move |dc| {
            let channels = channels.clone();
            Box::pin(async move {
                info!("Device announced data channel '{}'", dc.label());
                channels
                    .register(Arc::new(DeviceChannel::from_rtc_channel(dc)))
                    .await;
            })
        }));

        let track_handler = Arc::clone(&self.track_handler);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let track_handler = Arc::clone(&track_handler);
            Box::pin(async move {
                info!(kind = %track.kind(), ssrc = track.ssrc(), "Remote track started");
                if let Some(handler) = track_handler.read().await.as_ref() {
                    handler(track).await;
                }
            })
        }));

        Ok(pc)
    }

    /// Apply a candidate trickled by the device
    ///
    /// Candidates can only be applied once an offer has installed a peer
    /// connection; an early candidate is an error the caller drops.
    pub async fn add_remote_candidate(
        &self,
        candidate: &str,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<()> {
        let guard = self.pc.read().await;
        let pc = guard.as_ref().ok_or_else(|| {
            Error::Negotiation("Candidate received before remote offer".to_string())
        })?;
        pc.add_ice_candidate(RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid,
            sdp_mline_index,
            username_fragment: None,
        })
        .await
        .map_err(|e| Error::IceCandidate(format!("Failed to add remote candidate: {}", e)))
    }

    /// Tear the session down
    ///
    /// Idempotent; closes the device channels and the peer connection.
    pub async fn close(&self) {
        let _ = self.state_tx.send(NegotiationState::Closed);
        self.channels.clear().await;
        if let Some(pc) = self.pc.write().await.take() {
            if let Err(e) = pc.close().await {
                warn!(session_id = %self.session_id, "Error closing peer connection: {}", e);
            }
        }
        debug!(session_id = %self.session_id, "Session closed");
    }
}
