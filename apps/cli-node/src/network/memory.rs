//! In-process mesh and signaling for tests and simulations.
//!
//! `MemoryMeshHub` gives every registered device an ordered, reliable channel
//! to every other device, opening a pair's link once both sides have asked
//! for it — the same observable contract as the WebRTC transport, without
//! sockets. `MemorySignalHub` plays the signaling relay: register, relay,
//! list, announce.

use crate::network::transport::{PeerTransport, TransportError, TransportEvent};
use crate::network::websocket::SignalConnection;
use crate::protocal::signal::{ClientMsg, ServerMsg, SessionAnnouncement};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a < b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[derive(Default)]
struct MeshHubInner {
    endpoints: HashMap<String, mpsc::UnboundedSender<TransportEvent>>,
    /// (pair, requester) marks one side having called create_connection.
    requested: HashSet<(String, String)>,
    open: HashSet<(String, String)>,
}

/// Hub shared by all in-memory transports of one test scenario.
#[derive(Default)]
pub struct MemoryMeshHub {
    inner: Mutex<MeshHubInner>,
}

impl MemoryMeshHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a device and returns its transport plus the event stream
    /// the session task consumes.
    pub fn transport(
        self: &Arc<Self>,
        device_id: &str,
    ) -> (Arc<MemoryTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap()
            .endpoints
            .insert(device_id.to_string(), tx);
        (
            Arc::new(MemoryTransport {
                device_id: device_id.to_string(),
                hub: Arc::clone(self),
            }),
            rx,
        )
    }

    /// Drops a device outright: every open link it had reports `Closed` to
    /// the surviving side. Test hook for peer-loss scenarios.
    pub fn kill(&self, device_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.endpoints.remove(device_id);
        let dead: Vec<(String, String)> = inner
            .open
            .iter()
            .filter(|(a, b)| a == device_id || b == device_id)
            .cloned()
            .collect();
        for pair in dead {
            inner.open.remove(&pair);
            let survivor = if pair.0 == device_id { &pair.1 } else { &pair.0 };
            if let Some(tx) = inner.endpoints.get(survivor) {
                let _ = tx.send(TransportEvent::Closed {
                    peer: device_id.to_string(),
                });
            }
        }
    }

    fn request_connect(&self, from: &str, to: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.endpoints.contains_key(to) {
            return Err(TransportError::Setup(format!("unknown peer {to}")));
        }
        let pair = pair_key(from, to);
        // A link reused across sessions is already open; re-announce it to
        // the requester instead of renegotiating.
        if inner.open.contains(&pair) {
            if let Some(tx) = inner.endpoints.get(from) {
                let _ = tx.send(TransportEvent::Opened {
                    peer: to.to_string(),
                });
            }
            return Ok(());
        }
        inner.requested.insert((format!("{}|{}", pair.0, pair.1), from.to_string()));

        let both = inner
            .requested
            .contains(&(format!("{}|{}", pair.0, pair.1), pair.0.clone()))
            && inner
                .requested
                .contains(&(format!("{}|{}", pair.0, pair.1), pair.1.clone()));
        if both && inner.open.insert(pair.clone()) {
            debug!(a = %pair.0, b = %pair.1, "memory mesh link open");
            for (me, peer) in [(&pair.0, &pair.1), (&pair.1, &pair.0)] {
                if let Some(tx) = inner.endpoints.get(me) {
                    let _ = tx.send(TransportEvent::Opened { peer: peer.clone() });
                }
            }
        }
        Ok(())
    }

    fn send(&self, from: &str, to: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let inner = self.inner.lock().unwrap();
        if !inner.open.contains(&pair_key(from, to)) {
            return Err(TransportError::NotOpen(to.to_string()));
        }
        let tx = inner
            .endpoints
            .get(to)
            .ok_or_else(|| TransportError::NotOpen(to.to_string()))?;
        tx.send(TransportEvent::Message {
            peer: from.to_string(),
            payload,
        })
        .map_err(|_| TransportError::Send(format!("{to} is gone")))
    }

    fn close(&self, from: &str, to: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.open.remove(&pair_key(from, to)) {
            if let Some(tx) = inner.endpoints.get(to) {
                let _ = tx.send(TransportEvent::Closed {
                    peer: from.to_string(),
                });
            }
        }
    }
}

pub struct MemoryTransport {
    device_id: String,
    hub: Arc<MemoryMeshHub>,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn create_connection(&self, peer: &str, _initiator: bool) -> Result<(), TransportError> {
        self.hub.request_connect(&self.device_id, peer)
    }

    async fn send(&self, peer: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.hub.send(&self.device_id, peer, payload)
    }

    async fn handle_signal(
        &self,
        _from: &str,
        _data: serde_json::Value,
    ) -> Result<(), TransportError> {
        // The in-memory mesh needs no setup exchange.
        Ok(())
    }

    async fn close_connection(&self, peer: &str) {
        self.hub.close(&self.device_id, peer);
    }
}

// --- In-process signaling relay ---

#[derive(Default)]
struct SignalHubInner {
    clients: HashMap<String, mpsc::UnboundedSender<ServerMsg>>,
    announcements: Vec<SessionAnnouncement>,
}

/// In-process stand-in for the signaling relay server.
#[derive(Default)]
pub struct MemorySignalHub {
    inner: Mutex<SignalHubInner>,
}

impl MemorySignalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a device and spawns the task that services its client
    /// messages the way the relay server would.
    pub fn connect(self: &Arc<Self>, device_id: &str) -> SignalConnection {
        let (server_tx, server_rx) = mpsc::unbounded_channel::<ServerMsg>();
        let (client_tx, mut client_rx) = mpsc::unbounded_channel::<ClientMsg>();

        self.inner
            .lock()
            .unwrap()
            .clients
            .insert(device_id.to_string(), server_tx);

        let hub = Arc::clone(self);
        let device = device_id.to_string();
        tokio::spawn(async move {
            while let Some(msg) = client_rx.recv().await {
                hub.handle_client_msg(&device, msg);
            }
            hub.inner.lock().unwrap().clients.remove(&device);
        });

        SignalConnection {
            outgoing: client_tx,
            incoming: server_rx,
        }
    }

    fn handle_client_msg(&self, from: &str, msg: ClientMsg) {
        let mut inner = self.inner.lock().unwrap();
        match msg {
            ClientMsg::Register { .. } => {}
            ClientMsg::ListDevices => {
                let devices: Vec<String> = inner.clients.keys().cloned().collect();
                if let Some(tx) = inner.clients.get(from) {
                    let _ = tx.send(ServerMsg::Devices { devices });
                }
            }
            ClientMsg::Relay { to, data } => {
                match inner.clients.get(&to) {
                    Some(tx) => {
                        let _ = tx.send(ServerMsg::Relay {
                            from: from.to_string(),
                            data,
                        });
                    }
                    None => {
                        if let Some(tx) = inner.clients.get(from) {
                            let _ = tx.send(ServerMsg::Error {
                                error: format!("unknown device: {to}"),
                            });
                        }
                    }
                }
            }
            ClientMsg::AnnounceSession {
                session_id,
                session_type,
                total,
                threshold,
                curve_type,
            } => {
                let announcement = SessionAnnouncement {
                    session_id,
                    session_type,
                    threshold,
                    total,
                    curve_type,
                    creator_device: from.to_string(),
                    participants_joined: 1,
                    description: None,
                    timestamp: 0,
                };
                inner.announcements.push(announcement.clone());
                for (device, tx) in &inner.clients {
                    if device != from {
                        let _ = tx.send(ServerMsg::SessionAvailable(announcement.clone()));
                    }
                }
            }
            ClientMsg::RequestActiveSessions => {
                if let Some(tx) = inner.clients.get(from) {
                    for ann in &inner.announcements {
                        let _ = tx.send(ServerMsg::SessionAvailable(ann.clone()));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn link_opens_when_both_sides_request() {
        let hub = MemoryMeshHub::new();
        let (ta, mut ra) = hub.transport("a");
        let (tb, mut rb) = hub.transport("b");

        ta.create_connection("b", true).await.unwrap();
        assert!(
            ta.send("b", b"early".to_vec()).await.is_err(),
            "no send before both sides joined"
        );
        tb.create_connection("a", false).await.unwrap();

        assert!(matches!(
            ra.recv().await.unwrap(),
            TransportEvent::Opened { peer } if peer == "b"
        ));
        assert!(matches!(
            rb.recv().await.unwrap(),
            TransportEvent::Opened { peer } if peer == "a"
        ));

        ta.send("b", b"hello".to_vec()).await.unwrap();
        match rb.recv().await.unwrap() {
            TransportEvent::Message { peer, payload } => {
                assert_eq!(peer, "a");
                assert_eq!(payload, b"hello");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn kill_notifies_survivors() {
        let hub = MemoryMeshHub::new();
        let (ta, mut ra) = hub.transport("a");
        let (tb, _rb) = hub.transport("b");
        ta.create_connection("b", true).await.unwrap();
        tb.create_connection("a", false).await.unwrap();
        let _ = ra.recv().await;

        hub.kill("b");
        assert!(matches!(
            ra.recv().await.unwrap(),
            TransportEvent::Closed { peer } if peer == "b"
        ));
        assert!(ta.send("b", vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn signal_hub_relays_between_devices() {
        let hub = MemorySignalHub::new();
        let conn_a = hub.connect("a");
        let mut conn_b = hub.connect("b");

        conn_a
            .outgoing
            .send(ClientMsg::Relay {
                to: "b".into(),
                data: serde_json::json!({"x": 1}),
            })
            .unwrap();

        match conn_b.incoming.recv().await.unwrap() {
            ServerMsg::Relay { from, data } => {
                assert_eq!(from, "a");
                assert_eq!(data["x"], 1);
            }
            other => panic!("unexpected msg {other:?}"),
        }
    }
}
