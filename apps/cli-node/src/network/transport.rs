//! Pluggable peer transport.
//!
//! The core needs exactly one thing from a transport: an ordered, reliable,
//! bidirectional datagram channel per peer pair. Connection setup payloads
//! (WebRTC offer/answer/ICE) travel through the signaling relay and are
//! opaque to everything except the transport that produced them.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel to {0} is not open")]
    NotOpen(String),

    #[error("connection setup failed: {0}")]
    Setup(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("signal handling failed: {0}")]
    Signal(String),
}

/// Events a transport emits into the session task.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The channel to this peer is open in both directions.
    Opened { peer: String },
    /// The channel to this peer closed or failed.
    Closed { peer: String },
    /// An application datagram arrived from this peer.
    Message { peer: String, payload: Vec<u8> },
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Begins connection setup with a peer. `initiator` follows the session
    /// tie-break rule: the device with the smaller id dials.
    async fn create_connection(&self, peer: &str, initiator: bool) -> Result<(), TransportError>;

    /// Sends one datagram over the open channel to `peer`.
    async fn send(&self, peer: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Feeds a setup payload relayed from `from` into the transport. The
    /// core never interprets these.
    async fn handle_signal(&self, from: &str, data: serde_json::Value)
    -> Result<(), TransportError>;

    /// Closes the channel to a peer (idempotent).
    async fn close_connection(&self, peer: &str);
}
