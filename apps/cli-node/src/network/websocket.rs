//! WebSocket client for the signaling relay.
//!
//! The relay is a single shared connection: one writer task serializes every
//! outgoing `ClientMsg` (all components funnel through the same queue), one
//! reader task decodes `ServerMsg` frames into the session task's channel.

use crate::errors::{AppError, Result};
use crate::protocal::signal::{ClientMsg, ServerMsg};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info};

/// The two channel ends a node uses to talk to the relay. Tests build the
/// same shape from the in-memory hub.
pub struct SignalConnection {
    pub outgoing: mpsc::UnboundedSender<ClientMsg>,
    pub incoming: mpsc::UnboundedReceiver<ServerMsg>,
}

/// Connects to the relay, registers the device id, and spawns the reader and
/// writer pumps.
pub async fn connect_relay(url: &str, device_id: &str) -> Result<SignalConnection> {
    let parsed = url::Url::parse(url)
        .map_err(|e| AppError::Signaling(format!("invalid signal url '{url}': {e}")))?;
    let (ws_stream, _) = connect_async(parsed.as_str())
        .await
        .map_err(|e| AppError::Signaling(format!("relay connection failed: {e}")))?;
    info!(%url, "connected to signaling relay");

    let (mut sink, mut stream) = ws_stream.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMsg>();
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<ServerMsg>();

    outgoing_tx
        .send(ClientMsg::Register {
            device_id: device_id.to_string(),
        })
        .map_err(|_| AppError::Signaling("relay writer closed".into()))?;

    // Writer: the single serialization point for the shared connection.
    tokio::spawn(async move {
        while let Some(msg) = outgoing_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    error!("failed to serialize relay message: {e}");
                    continue;
                }
            };
            if let Err(e) = sink.send(WsMessage::text(text)).await {
                error!("relay send failed: {e}");
                break;
            }
        }
    });

    // Reader: decode frames, drop anything that is not a ServerMsg.
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerMsg>(&text) {
                    Ok(msg) => {
                        if incoming_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("ignoring undecodable relay frame: {e}"),
                },
                Ok(WsMessage::Close(_)) => {
                    info!("relay closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("relay read failed: {e}");
                    break;
                }
            }
        }
    });

    Ok(SignalConnection {
        outgoing: outgoing_tx,
        incoming: incoming_rx,
    })
}
