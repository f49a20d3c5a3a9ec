//! Loopback negotiation: a device-side offerer peer against PeerSession
//!
//! Exercises the full offer/answer/candidate exchange in-process and the
//! device-created channel path, including the default inbound observer
//! installed on attachment.

use devicecast_webrtc::{PeerSession, SdpSignal};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

const WAIT: Duration = Duration::from_secs(30);

async fn offerer_peer() -> Arc<RTCPeerConnection> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().unwrap();
    let registry = register_default_interceptors(Registry::new(), &mut media_engine).unwrap();
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();
    Arc::new(
        api.new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn attached_channel_observes_inbound_messages_by_default() {
    let offerer = offerer_peer().await;
    let control = offerer
        .create_data_channel("controlChanel", None)
        .await
        .unwrap();

    // Register the open signal before negotiation starts.
    let (open_tx, open_rx) = oneshot::channel();
    let open_tx = Mutex::new(Some(open_tx));
    control.on_open(Box::new(move || {
        if let Some(tx) = open_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        Box::pin(async {})
    }));

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let session = Arc::new(PeerSession::new("d1", outbound_tx));

    // Offerer candidates are buffered until the session's remote
    // description exists, i.e. until handle_remote_offer has returned.
    let (cand_tx, mut cand_rx) = mpsc::unbounded_channel::<RTCIceCandidateInit>();
    offerer.on_ice_candidate(Box::new(move |candidate| {
        let cand_tx = cand_tx.clone();
        Box::pin(async move {
            if let Some(candidate) = candidate {
                if let Ok(init) = candidate.to_json() {
                    let _ = cand_tx.send(init);
                }
            }
        })
    }));

    let offer = offerer.create_offer(None).await.unwrap();
    offerer.set_local_description(offer.clone()).await.unwrap();
    session.handle_remote_offer(&offer.sdp, &[]).await.unwrap();

    // Relay the session's answer and candidates back to the offerer;
    // candidates queued ahead of the answer wait for it.
    let answer_peer = Arc::clone(&offerer);
    tokio::spawn(async move {
        let mut pending: Vec<RTCIceCandidateInit> = Vec::new();
        let mut have_remote = false;
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound.signal {
                SdpSignal::Answer { sdp } => {
                    let answer = RTCSessionDescription::answer(sdp).unwrap();
                    answer_peer.set_remote_description(answer).await.unwrap();
                    have_remote = true;
                    for init in pending.drain(..) {
                        let _ = answer_peer.add_ice_candidate(init).await;
                    }
                }
                SdpSignal::Candidate {
                    sdp_mid,
                    sdp_mline_index,
                    candidate,
                } => {
                    let init = RTCIceCandidateInit {
                        candidate,
                        sdp_mid: Some(sdp_mid),
                        sdp_mline_index,
                        username_fragment: None,
                    };
                    if have_remote {
                        let _ = answer_peer.add_ice_candidate(init).await;
                    } else {
                        pending.push(init);
                    }
                }
                _ => {}
            }
        }
    });

    let candidate_sink = Arc::clone(&session);
    tokio::spawn(async move {
        while let Some(init) = cand_rx.recv().await {
            let _ = candidate_sink
                .add_remote_candidate(&init.candidate, init.sdp_mid, init.sdp_mline_index)
                .await;
        }
    });

    timeout(WAIT, open_rx).await.unwrap().unwrap();

    // Send without installing any message handler on the session side:
    // the observer installed on attachment must still count the bytes.
    control.send_text("ping".to_string()).await.unwrap();

    let channels = session.channels();
    timeout(WAIT, async {
        loop {
            if let Some(channel) = channels.control().await {
                if channel.bytes_received().await >= "ping".len() as u64 {
                    break;
                }
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    session.close().await;
    offerer.close().await.unwrap();
}
