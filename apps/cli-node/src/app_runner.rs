//! Core application runner.
//!
//! One `AppRunner` owns the session task: it consumes internal commands from
//! the UI, messages from the signaling relay, and events from the peer
//! transport, and drives the handlers. Components never call back into each
//! other; everything observable leaves through the status stream.

use crate::errors::{AppError, Result};
use crate::handlers::{
    dkg_commands, keystore_commands, mesh_commands, session_commands, signing_commands,
};
use crate::handlers::{emit, fail_session, process_router_events};
use crate::keystore::Keystore;
use crate::network::transport::{PeerTransport, TransportEvent};
use crate::network::websocket::SignalConnection;
use crate::protocal::envelope::ProtocolEnvelope;
use crate::protocal::signal::{CurveType, ServerMsg, WebSocketMessage};
use crate::utils::state::{AppState, InternalCommand, StatusUpdate};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

pub struct AppRunner {
    app_state: Arc<Mutex<AppState>>,
    internal_cmd_tx: mpsc::UnboundedSender<InternalCommand>,
    internal_cmd_rx: Option<mpsc::UnboundedReceiver<InternalCommand>>,
    status_tx: mpsc::UnboundedSender<StatusUpdate>,
    transport: Arc<dyn PeerTransport>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    signal: Option<SignalConnection>,
}

impl AppRunner {
    /// Builds a runner over an already-connected signal channel and peer
    /// transport. Returns the status stream for subscribers.
    pub fn new(
        device_id: &str,
        curve: CurveType,
        transport: Arc<dyn PeerTransport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        signal: Option<SignalConnection>,
    ) -> (Self, mpsc::UnboundedReceiver<StatusUpdate>) {
        let (internal_cmd_tx, internal_cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let app_state = Arc::new(Mutex::new(AppState::new(device_id, curve)));
        (
            Self {
                app_state,
                internal_cmd_tx,
                internal_cmd_rx: Some(internal_cmd_rx),
                status_tx,
                transport,
                transport_events: Some(transport_events),
                signal,
            },
            status_rx,
        )
    }

    /// Opens (or creates) the keystore for this device.
    pub async fn init_keystore(&self, base_path: impl AsRef<Path>) -> Result<()> {
        let mut guard = self.app_state.lock().await;
        let keystore = Keystore::new(base_path, &guard.device_id)?;
        guard.keystore = Some(Arc::new(Mutex::new(keystore)));
        Ok(())
    }

    /// Get a handle to send commands to the runner
    pub fn command_sender(&self) -> mpsc::UnboundedSender<InternalCommand> {
        self.internal_cmd_tx.clone()
    }

    /// Get a reference to the application state (for testing and monitoring)
    pub fn app_state(&self) -> Arc<Mutex<AppState>> {
        self.app_state.clone()
    }

    /// Runs the session task until `Shutdown` or every input closes.
    pub async fn run(mut self) {
        let mut cmd_rx = match self.internal_cmd_rx.take() {
            Some(rx) => rx,
            None => return,
        };
        let mut transport_events = match self.transport_events.take() {
            Some(rx) => rx,
            None => return,
        };
        let mut signal = self.signal.take();
        let mut timeout_tick = tokio::time::interval(Duration::from_secs(1));
        timeout_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = cmd_rx.recv() => {
                    match command {
                        Some(InternalCommand::Shutdown) | None => {
                            info!("session task shutting down");
                            break;
                        }
                        Some(InternalCommand::SendToServer(msg)) => {
                            if let Some(signal) = signal.as_ref() {
                                let _ = signal.outgoing.send(msg);
                            }
                        }
                        Some(command) => self.dispatch(command).await,
                    }
                }
                server_msg = async {
                    match signal.as_mut() {
                        Some(signal) => signal.incoming.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match server_msg {
                        Some(msg) => self.handle_server_msg(msg).await,
                        None => {
                            warn!("signaling relay closed");
                            signal = None;
                        }
                    }
                }
                event = transport_events.recv() => {
                    match event {
                        Some(event) => self.handle_transport_event(event).await,
                        None => {
                            warn!("transport event stream closed");
                            break;
                        }
                    }
                }
                _ = timeout_tick.tick() => {
                    let result = session_commands::handle_check_timeouts(
                        self.app_state.clone(),
                        &self.status_tx,
                    ).await;
                    if let Err(e) = result {
                        error!("timeout sweep failed: {e}");
                    }
                }
            }
        }
    }

    async fn dispatch(&self, command: InternalCommand) {
        let result = self.dispatch_inner(command).await;
        if let Err(e) = result {
            if session_fatal(&e) {
                let mut guard = self.app_state.lock().await;
                fail_session(&mut guard, &self.status_tx, e.to_string());
            } else {
                emit(&self.status_tx, StatusUpdate::Log(format!("error: {e}")));
            }
        }
    }

    async fn dispatch_inner(&self, command: InternalCommand) -> Result<()> {
        let state = self.app_state.clone();
        let cmd_tx = &self.internal_cmd_tx;
        let status_tx = &self.status_tx;
        let transport = &self.transport;

        match command {
            InternalCommand::SendToServer(_) | InternalCommand::Shutdown => Ok(()),

            InternalCommand::ProposeSession {
                session_id,
                total,
                threshold,
                participants,
            } => {
                session_commands::handle_propose_session(
                    state, transport, cmd_tx, status_tx, session_id, total, threshold, participants,
                )
                .await
            }
            InternalCommand::ProposeSigning {
                wallet_name,
                message_hex,
                signers,
            } => {
                session_commands::handle_propose_signing(
                    state, transport, cmd_tx, status_tx, wallet_name, message_hex, signers,
                )
                .await
            }
            InternalCommand::AcceptSessionProposal(session_id) => {
                session_commands::handle_accept_session(state, transport, cmd_tx, status_tx, session_id)
                    .await
            }
            InternalCommand::ProcessProposal { from, proposal } => {
                session_commands::handle_process_proposal(state, status_tx, from, proposal).await
            }
            InternalCommand::ProcessResponse { from, response } => {
                session_commands::handle_process_response(
                    state, transport, cmd_tx, status_tx, from, response,
                )
                .await
            }

            InternalCommand::InitiateMeshConnections => {
                mesh_commands::handle_initiate_mesh(state, transport).await
            }
            InternalCommand::ReportChannelOpen { device_id } => {
                mesh_commands::handle_channel_open(state, transport, status_tx, cmd_tx, device_id)
                    .await
            }
            InternalCommand::PeerDisconnected { device_id } => {
                mesh_commands::handle_peer_disconnected(
                    state, transport, status_tx, cmd_tx, device_id,
                )
                .await
            }
            InternalCommand::ProcessEnvelope { from, envelope } => {
                self.handle_envelope(from, envelope).await
            }

            InternalCommand::CheckAndTriggerDkg => {
                dkg_commands::handle_check_and_trigger_dkg(state, transport, status_tx, cmd_tx)
                    .await
            }
            InternalCommand::CheckAndTriggerSigning => {
                signing_commands::handle_check_and_trigger_signing(
                    state, transport, status_tx, cmd_tx,
                )
                .await
            }
            InternalCommand::CheckTimeouts => {
                session_commands::handle_check_timeouts(state, status_tx).await
            }

            InternalCommand::UnlockKeystore { password } => {
                keystore_commands::handle_unlock_keystore(state, cmd_tx, status_tx, password).await
            }
            InternalCommand::CreateWallet { password } => {
                keystore_commands::handle_create_wallet(state, status_tx, password).await
            }
            InternalCommand::ListWallets => {
                keystore_commands::handle_list_wallets(state, status_tx).await
            }
            InternalCommand::ExportWallet { wallet_id, path } => {
                keystore_commands::handle_export_wallet(state, status_tx, wallet_id, path).await
            }
            InternalCommand::ImportWallet { path, password } => {
                keystore_commands::handle_import_wallet(state, status_tx, path, password).await
            }
        }
    }

    async fn handle_envelope(&self, from: String, envelope: ProtocolEnvelope) -> Result<()> {
        let mut guard = self.app_state.lock().await;
        let routable = guard
            .router
            .as_ref()
            .map(|r| r.session_id() == envelope.session_id)
            .unwrap_or(false);
        if !routable {
            // A peer that formed the session faster than us can legitimately
            // be a message ahead; park the envelope until AllAccepted builds
            // the router for it.
            debug!(%from, session = %envelope.session_id, "buffering pre-session envelope");
            guard.buffer_pending_envelope(from, envelope);
            return Ok(());
        }
        let events = match guard.router.as_mut() {
            Some(router) => router.ingest(envelope)?,
            None => Vec::new(),
        };
        process_router_events(
            &mut guard,
            &self.transport,
            &self.status_tx,
            &self.internal_cmd_tx,
            events,
        )
        .await
    }

    async fn handle_server_msg(&self, msg: ServerMsg) {
        match msg {
            ServerMsg::Devices { devices } => {
                let mut guard = self.app_state.lock().await;
                guard.devices = devices.clone();
                drop(guard);
                emit(&self.status_tx, StatusUpdate::Devices(devices));
            }
            ServerMsg::Relay { from, data } => {
                match serde_json::from_value::<WebSocketMessage>(data) {
                    Ok(WebSocketMessage::SessionProposal(proposal)) => {
                        let _ = self.internal_cmd_tx.send(InternalCommand::ProcessProposal {
                            from,
                            proposal,
                        });
                    }
                    Ok(WebSocketMessage::SessionResponse(response)) => {
                        let _ = self.internal_cmd_tx.send(InternalCommand::ProcessResponse {
                            from,
                            response,
                        });
                    }
                    Ok(WebSocketMessage::TransportSignal { payload }) => {
                        if let Err(e) = self.transport.handle_signal(&from, payload).await {
                            warn!(%from, "transport signal failed: {e}");
                        }
                    }
                    Err(e) => warn!(%from, "undecodable relay payload: {e}"),
                }
            }
            ServerMsg::SessionAvailable(announcement) => {
                let mut guard = self.app_state.lock().await;
                guard
                    .discovered_sessions
                    .retain(|a| a.session_id != announcement.session_id);
                guard.discovered_sessions.push(announcement);
                let discovered = guard.discovered_sessions.clone();
                drop(guard);
                emit(&self.status_tx, StatusUpdate::SessionsDiscovered(discovered));
            }
            ServerMsg::SessionStatus { session_id, accepted_devices } => {
                debug!(%session_id, ?accepted_devices, "session status from relay");
            }
            ServerMsg::Error { error } => {
                emit(&self.status_tx, StatusUpdate::Log(format!("relay error: {error}")));
            }
        }
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Opened { peer } => {
                let _ = self
                    .internal_cmd_tx
                    .send(InternalCommand::ReportChannelOpen { device_id: peer });
            }
            TransportEvent::Closed { peer } => {
                let _ = self
                    .internal_cmd_tx
                    .send(InternalCommand::PeerDisconnected { device_id: peer });
            }
            TransportEvent::Message { peer, payload } => match ProtocolEnvelope::from_wire(&payload)
            {
                Ok(envelope) => {
                    let _ = self.internal_cmd_tx.send(InternalCommand::ProcessEnvelope {
                        from: peer,
                        envelope,
                    });
                }
                Err(e) => warn!(%peer, "undecodable peer datagram: {e}"),
            },
        }
    }
}

/// Whether an error aborts the active session (cryptographic and protocol
/// errors) or only the local operation (usage and keystore errors).
fn session_fatal(err: &AppError) -> bool {
    match err {
        AppError::Frost(_)
        | AppError::Protocol(_)
        | AppError::PeerLost(_)
        | AppError::RoundTimeout { .. }
        | AppError::Transport(_) => true,
        AppError::InvalidParams(_)
        | AppError::WalletMissing(_)
        | AppError::WalletMismatch { .. }
        | AppError::Locked
        | AppError::Keystore(_)
        | AppError::Signaling(_)
        | AppError::Cancelled => false,
    }
}
