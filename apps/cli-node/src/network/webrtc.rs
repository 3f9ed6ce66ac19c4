//! WebRTC peer transport.
//!
//! One `RTCPeerConnection` per peer with a single data channel labelled
//! "frost-dkg". Setup exchanges (offer/answer/ICE) ride the signaling relay
//! as transport-opaque payloads; the initiator rule (smaller device id
//! dials) is decided by the session layer and arrives via `create_connection`.

use crate::network::transport::{PeerTransport, TransportError, TransportEvent};
use crate::protocal::signal::{ClientMsg, WebSocketMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub const DATA_CHANNEL_LABEL: &str = "frost-dkg";

// --- Setup payloads relayed between peers (opaque to the core) ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum WebRTCSignal {
    Offer(SDPInfo),
    Answer(SDPInfo),
    Candidate(CandidateInfo),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SDPInfo {
    pub sdp: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CandidateInfo {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

fn relay_signal(signal_out: &mpsc::UnboundedSender<ClientMsg>, to: &str, signal: WebRTCSignal) {
    let inner = match serde_json::to_value(&signal) {
        Ok(v) => v,
        Err(e) => {
            warn!("failed to serialize transport signal: {e}");
            return;
        }
    };
    let payload = match serde_json::to_value(WebSocketMessage::TransportSignal { payload: inner }) {
        Ok(v) => v,
        Err(e) => {
            warn!("failed to serialize transport signal wrapper: {e}");
            return;
        }
    };
    let _ = signal_out.send(ClientMsg::Relay {
        to: to.to_string(),
        data: payload,
    });
}

pub struct WebRtcTransport {
    this: Weak<WebRtcTransport>,
    api: API,
    config: RTCConfiguration,
    connections: Mutex<HashMap<String, Arc<RTCPeerConnection>>>,
    channels: Mutex<HashMap<String, Arc<RTCDataChannel>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    signal_out: mpsc::UnboundedSender<ClientMsg>,
}

impl WebRtcTransport {
    /// Creates the transport and the event stream the session task consumes.
    /// `signal_out` is the shared relay writer queue.
    pub fn new(
        signal_out: mpsc::UnboundedSender<ClientMsg>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            api: APIBuilder::new().build(),
            config: RTCConfiguration {
                ice_servers: vec![RTCIceServer {
                    urls: vec!["stun:stun.l.google.com:19302".to_string()],
                    ..Default::default()
                }],
                ..Default::default()
            },
            connections: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            events: events_tx,
            signal_out,
        });
        (transport, events_rx)
    }

    /// Creates (or returns) the peer connection object and wires the
    /// connection-level callbacks.
    async fn get_or_create_connection(
        &self,
        peer: &str,
    ) -> Result<Arc<RTCPeerConnection>, TransportError> {
        {
            let connections = self.connections.lock().await;
            if let Some(pc) = connections.get(peer) {
                return Ok(pc.clone());
            }
        }

        let pc = self
            .api
            .new_peer_connection(self.config.clone())
            .await
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        let pc = Arc::new(pc);

        // ICE candidates go back through the relay as they trickle in.
        let signal_out = self.signal_out.clone();
        let peer_on_ice = peer.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let signal_out = signal_out.clone();
            let peer = peer_on_ice.clone();
            Box::pin(async move {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(init) => {
                            debug!(%peer, "ICE candidate generated");
                            relay_signal(
                                &signal_out,
                                &peer,
                                WebRTCSignal::Candidate(CandidateInfo {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                }),
                            );
                        }
                        Err(e) => warn!(%peer, "candidate serialization failed: {e}"),
                    }
                }
            })
        }));

        // The responder side receives the channel the initiator created.
        let weak = self.this.clone();
        let peer_on_dc = peer.to_string();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            let peer = peer_on_dc.clone();
            Box::pin(async move {
                if let Some(this) = weak.upgrade() {
                    this.setup_data_channel(&peer, dc).await;
                }
            })
        }));

        let weak = self.this.clone();
        let peer_on_state = peer.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let weak = weak.clone();
            let peer = peer_on_state.clone();
            Box::pin(async move {
                debug!(%peer, ?state, "peer connection state change");
                if matches!(
                    state,
                    RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed
                ) {
                    if let Some(this) = weak.upgrade() {
                        this.drop_peer(&peer).await;
                    }
                }
            })
        }));

        self.connections
            .lock()
            .await
            .insert(peer.to_string(), pc.clone());
        Ok(pc)
    }

    async fn setup_data_channel(&self, peer: &str, dc: Arc<RTCDataChannel>) {
        self.channels
            .lock()
            .await
            .insert(peer.to_string(), dc.clone());

        let events = self.events.clone();
        let peer_on_open = peer.to_string();
        dc.on_open(Box::new(move || {
            let events = events.clone();
            let peer = peer_on_open.clone();
            Box::pin(async move {
                info!(%peer, "data channel open");
                let _ = events.send(TransportEvent::Opened { peer });
            })
        }));

        let events = self.events.clone();
        let peer_on_message = peer.to_string();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            let peer = peer_on_message.clone();
            Box::pin(async move {
                let _ = events.send(TransportEvent::Message {
                    peer,
                    payload: msg.data.to_vec(),
                });
            })
        }));

        let weak = self.this.clone();
        let peer_on_close = peer.to_string();
        dc.on_close(Box::new(move || {
            let weak = weak.clone();
            let peer = peer_on_close.clone();
            Box::pin(async move {
                if let Some(this) = weak.upgrade() {
                    this.drop_peer(&peer).await;
                }
            })
        }));
    }

    async fn drop_peer(&self, peer: &str) {
        let had_channel = self.channels.lock().await.remove(peer).is_some();
        if let Some(pc) = self.connections.lock().await.remove(peer) {
            let _ = pc.close().await;
        }
        if had_channel {
            let _ = self.events.send(TransportEvent::Closed {
                peer: peer.to_string(),
            });
        }
    }

    async fn handle_offer(&self, from: &str, sdp: String) -> Result<(), TransportError> {
        let pc = self.get_or_create_connection(from).await?;
        let offer =
            RTCSessionDescription::offer(sdp).map_err(|e| TransportError::Signal(e.to_string()))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| TransportError::Signal(e.to_string()))?;
        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Signal(e.to_string()))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| TransportError::Signal(e.to_string()))?;
        relay_signal(
            &self.signal_out,
            from,
            WebRTCSignal::Answer(SDPInfo { sdp: answer.sdp }),
        );
        Ok(())
    }

    async fn handle_answer(&self, from: &str, sdp: String) -> Result<(), TransportError> {
        let pc = self
            .connections
            .lock()
            .await
            .get(from)
            .cloned()
            .ok_or_else(|| TransportError::Signal(format!("answer from unknown peer {from}")))?;
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| TransportError::Signal(e.to_string()))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| TransportError::Signal(e.to_string()))
    }

    async fn handle_candidate(&self, from: &str, info: CandidateInfo) -> Result<(), TransportError> {
        let pc = self
            .connections
            .lock()
            .await
            .get(from)
            .cloned()
            .ok_or_else(|| TransportError::Signal(format!("candidate from unknown peer {from}")))?;
        pc.add_ice_candidate(RTCIceCandidateInit {
            candidate: info.candidate,
            sdp_mid: info.sdp_mid,
            sdp_mline_index: info.sdp_mline_index,
            ..Default::default()
        })
        .await
        .map_err(|e| TransportError::Signal(e.to_string()))
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_connection(&self, peer: &str, initiator: bool) -> Result<(), TransportError> {
        // A channel reused across sessions is already open; announce it
        // again instead of renegotiating.
        if let Some(dc) = self.channels.lock().await.get(peer) {
            if dc.ready_state() == RTCDataChannelState::Open {
                let _ = self.events.send(TransportEvent::Opened {
                    peer: peer.to_string(),
                });
                return Ok(());
            }
        }

        let pc = self.get_or_create_connection(peer).await?;
        if !initiator {
            // The dialing side creates the channel and sends the offer; we
            // just wait for on_data_channel.
            return Ok(());
        }

        let dc = pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        self.setup_data_channel(peer, dc).await;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        relay_signal(
            &self.signal_out,
            peer,
            WebRTCSignal::Offer(SDPInfo { sdp: offer.sdp }),
        );
        info!(%peer, "sent connection offer");
        Ok(())
    }

    async fn send(&self, peer: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let dc = self
            .channels
            .lock()
            .await
            .get(peer)
            .cloned()
            .ok_or_else(|| TransportError::NotOpen(peer.to_string()))?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::NotOpen(peer.to_string()));
        }
        // Envelopes are JSON text frames, matching the extension cohort.
        let text = String::from_utf8(payload)
            .map_err(|e| TransportError::Send(format!("non-UTF8 envelope: {e}")))?;
        dc.send_text(text)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        Ok(())
    }

    async fn handle_signal(
        &self,
        from: &str,
        data: serde_json::Value,
    ) -> Result<(), TransportError> {
        let signal: WebRTCSignal = serde_json::from_value(data)
            .map_err(|e| TransportError::Signal(format!("undecodable setup payload: {e}")))?;
        match signal {
            WebRTCSignal::Offer(info) => self.handle_offer(from, info.sdp).await,
            WebRTCSignal::Answer(info) => self.handle_answer(from, info.sdp).await,
            WebRTCSignal::Candidate(info) => self.handle_candidate(from, info).await,
        }
    }

    async fn close_connection(&self, peer: &str) {
        self.drop_peer(peer).await;
    }
}
