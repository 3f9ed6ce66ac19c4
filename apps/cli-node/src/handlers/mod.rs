//! Command handlers for the session task.
//!
//! Each submodule owns one slice of the command surface; this module holds
//! the machinery they share: envelope broadcast, the router-event pump, and
//! session teardown. Handlers run with the `AppState` lock held for the
//! whole command, which is what makes the engines single-owner.

pub mod dkg_commands;
pub mod keystore_commands;
pub mod mesh_commands;
pub mod session_commands;
pub mod signing_commands;

use crate::errors::{AppError, Result};
use crate::keystore::BlockchainInfo;
use crate::network::transport::PeerTransport;
use crate::protocal::envelope::ProtocolEnvelope;
use crate::protocal::router::RouterEvent;
use crate::protocal::signal::{ClientMsg, CurveType, WebSocketMessage};
use crate::session::mesh::MeshAction;
use crate::utils::state::{AppState, InternalCommand, MeshStatus, StatusUpdate};
use frost_mpc_blockchain::BlockchainRegistry;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub(crate) const PROPOSAL_TIMEOUT: Duration = Duration::from_secs(120);
pub(crate) const DKG_ROUND_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const SIGNING_PHASE_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn emit(status_tx: &mpsc::UnboundedSender<StatusUpdate>, update: StatusUpdate) {
    let _ = status_tx.send(update);
}

/// Queues a relay send to one device (the shared writer serializes it).
pub(crate) fn relay_to(
    cmd_tx: &mpsc::UnboundedSender<InternalCommand>,
    to: &str,
    message: &WebSocketMessage,
) -> Result<()> {
    let data = serde_json::to_value(message).map_err(|e| AppError::Signaling(e.to_string()))?;
    cmd_tx
        .send(InternalCommand::SendToServer(ClientMsg::Relay {
            to: to.to_string(),
            data,
        }))
        .map_err(|_| AppError::Signaling("command channel closed".into()))?;
    Ok(())
}

/// Sends one envelope to every other participant of the active session.
pub(crate) async fn broadcast_envelope(
    state: &AppState,
    transport: &Arc<dyn PeerTransport>,
    envelope: &ProtocolEnvelope,
) -> Result<()> {
    let Some(session) = state.controller.active() else {
        return Ok(());
    };
    let bytes = envelope.to_wire()?;
    for peer in &session.participants {
        if peer == &state.device_id {
            continue;
        }
        if let Err(e) = transport.send(peer, bytes.clone()).await {
            warn!(%peer, "envelope send failed: {e}");
        }
    }
    Ok(())
}

/// Sends one envelope to the participant holding `recipient_index`.
pub(crate) async fn send_envelope_to_index(
    state: &AppState,
    transport: &Arc<dyn PeerTransport>,
    recipient_index: u16,
    envelope: &ProtocolEnvelope,
) -> Result<()> {
    let Some(peer) = state.device_for_index(recipient_index) else {
        return Err(AppError::Protocol(format!(
            "no device for participant index {recipient_index}"
        )));
    };
    transport
        .send(&peer, envelope.to_wire()?)
        .await
        .map_err(|e| AppError::Transport(e.to_string()))
}

/// Derives the per-chain address list for a freshly generated group key.
pub(crate) fn derive_addresses(curve: CurveType, group_key: &[u8]) -> Vec<BlockchainInfo> {
    let registry = BlockchainRegistry::new();
    let mut addresses = Vec::new();
    match curve {
        CurveType::Secp256k1 => {
            if let Some(handler) = registry.get("ethereum") {
                match handler.derive_address(group_key) {
                    Ok(address) => {
                        addresses.push(BlockchainInfo {
                            blockchain: "ethereum".to_string(),
                            network: "mainnet".to_string(),
                            chain_id: Some(1),
                            address: address.clone(),
                            address_format: "EIP-55".to_string(),
                            enabled: true,
                        });
                        // Every EVM chain reuses the same key-derived address.
                        for (chain, chain_id) in
                            [("polygon", 137u64), ("bsc", 56), ("arbitrum", 42161), ("optimism", 10)]
                        {
                            addresses.push(BlockchainInfo {
                                blockchain: chain.to_string(),
                                network: "mainnet".to_string(),
                                chain_id: Some(chain_id),
                                address: address.clone(),
                                address_format: "EIP-55".to_string(),
                                enabled: false,
                            });
                        }
                    }
                    Err(e) => warn!("could not derive ethereum address: {e}"),
                }
            }
        }
        CurveType::Ed25519 => {
            if let Some(handler) = registry.get("solana") {
                match handler.derive_address(group_key) {
                    Ok(address) => addresses.push(BlockchainInfo {
                        blockchain: "solana".to_string(),
                        network: "mainnet".to_string(),
                        chain_id: None,
                        address,
                        address_format: "base58".to_string(),
                        enabled: true,
                    }),
                    Err(e) => warn!("could not derive solana address: {e}"),
                }
            }
        }
    }
    addresses
}

/// Tears down the active session after a fatal error: cancel the engines,
/// drop buffers and secrets, emit the final status.
pub(crate) fn fail_session(
    state: &mut AppState,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
    reason: String,
) {
    if let Some(router) = state.router.as_mut() {
        if let Some(dkg) = router.dkg.as_mut() {
            dkg.cancel();
        }
        if let Some(signing) = router.signing.as_mut() {
            signing.cancel();
        }
    }
    let session_id = state
        .controller
        .fail_active()
        .map(|s| s.session_id)
        .unwrap_or_default();
    state.reset_session_state();
    state
        .pending_envelopes
        .retain(|(_, env)| env.session_id != session_id);
    warn!(%session_id, %reason, "session failed");
    emit(status_tx, StatusUpdate::SessionFailed { session_id, reason });
}

fn dkg_completed(
    state: &mut AppState,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
    group_key: Vec<u8>,
) {
    state.dkg_state = frost_mpc_core::DkgState::Complete;
    state.round_deadline = None;
    let group_public_key = hex::encode(&group_key);
    state.group_public_key = Some(group_public_key.clone());

    let curve = state
        .controller
        .active()
        .and_then(|s| CurveType::from_string(&s.curve_type))
        .unwrap_or(state.curve);
    let addresses = derive_addresses(curve, &group_key);
    state.blockchain_addresses = addresses.clone();

    let session_id = state
        .controller
        .active()
        .map(|s| s.session_id.clone())
        .unwrap_or_default();
    state.controller.complete_active();
    info!(%session_id, %group_public_key, "DKG complete");
    emit(status_tx, StatusUpdate::DkgStateChanged(state.dkg_state.clone()));
    emit(
        status_tx,
        StatusUpdate::DkgComplete {
            session_id,
            group_public_key,
            addresses,
        },
    );
}

fn signing_completed(
    state: &mut AppState,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
    signature: Vec<u8>,
) {
    state.round_deadline = None;
    state.last_signature = Some(signature.clone());
    let session_id = state
        .controller
        .active()
        .map(|s| s.session_id.clone())
        .unwrap_or_default();
    state.controller.complete_active();
    info!(%session_id, "signing complete");
    emit(
        status_tx,
        StatusUpdate::SigningComplete {
            session_id,
            signature: hex::encode(signature),
        },
    );
}

/// Works through router events (and the mesh actions they spawn) until the
/// queue is dry. Every enabling transition is followed by a `drain` so
/// buffered packages replay immediately — that replay is the contract that
/// keeps a fast peer's early round-2 traffic from wedging the run.
pub(crate) async fn process_router_events(
    state: &mut AppState,
    transport: &Arc<dyn PeerTransport>,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
    cmd_tx: &mpsc::UnboundedSender<InternalCommand>,
    events: Vec<RouterEvent>,
) -> Result<()> {
    let mut queue: VecDeque<RouterEvent> = events.into();
    while let Some(event) = queue.pop_front() {
        match event {
            RouterEvent::ChannelOpen { sender_index } => {
                let Some(device) = state.device_for_index(sender_index) else {
                    continue;
                };
                let actions = match state.mesh.as_mut() {
                    Some(mesh) => mesh.on_channel_open_received(&device),
                    None => Vec::new(),
                };
                apply_mesh_actions(state, transport, status_tx, cmd_tx, actions, &mut queue)
                    .await?;
            }
            RouterEvent::MeshReady { sender_index } => {
                let Some(device) = state.device_for_index(sender_index) else {
                    continue;
                };
                let actions = match state.mesh.as_mut() {
                    Some(mesh) => mesh.on_mesh_ready_received(&device),
                    None => Vec::new(),
                };
                apply_mesh_actions(state, transport, status_tx, cmd_tx, actions, &mut queue)
                    .await?;
            }
            RouterEvent::Round1Complete => {
                state.dkg_state = frost_mpc_core::DkgState::Round1Complete;
                emit(status_tx, StatusUpdate::DkgStateChanged(state.dkg_state.clone()));

                let session_id = state
                    .controller
                    .active()
                    .map(|s| s.session_id.clone())
                    .unwrap_or_default();
                let Some(router) = state.router.as_mut() else {
                    continue;
                };
                let my_index = router.my_index();
                let Some(dkg) = router.dkg.as_mut() else {
                    continue;
                };
                let targeted = dkg.generate_round2()?;
                state.dkg_state = frost_mpc_core::DkgState::Round2InProgress;
                state.round_deadline =
                    Some((Instant::now() + DKG_ROUND_TIMEOUT, 2, "dkg round 2".into()));
                emit(status_tx, StatusUpdate::DkgStateChanged(state.dkg_state.clone()));

                // Our round output goes out before we consume the round's
                // buffered inbound packages.
                for (recipient, bytes) in &targeted {
                    let envelope =
                        ProtocolEnvelope::dkg_round2(&session_id, my_index, *recipient, bytes);
                    send_envelope_to_index(state, transport, *recipient, &envelope).await?;
                }
                if let Some(router) = state.router.as_mut() {
                    queue.extend(router.drain()?);
                }
            }
            RouterEvent::Round2Complete => {
                let Some(router) = state.router.as_mut() else {
                    continue;
                };
                let Some(dkg) = router.dkg.as_mut() else {
                    continue;
                };
                let group_key = dkg.finalize()?;
                dkg_completed(state, status_tx, group_key);
            }
            RouterEvent::CommitmentsReady => {
                let session_id = state
                    .controller
                    .active()
                    .map(|s| s.session_id.clone())
                    .unwrap_or_default();
                let Some(router) = state.router.as_mut() else {
                    continue;
                };
                let my_index = router.my_index();
                let Some(signing) = router.signing.as_mut() else {
                    continue;
                };
                let share = signing.generate_signature_share()?;
                state.round_deadline = Some((
                    Instant::now() + SIGNING_PHASE_TIMEOUT,
                    2,
                    "signing share phase".into(),
                ));

                let envelope = ProtocolEnvelope::sign_share(&session_id, my_index, &share);
                broadcast_envelope(state, transport, &envelope).await?;
                if let Some(router) = state.router.as_mut() {
                    queue.extend(router.ingest(envelope)?);
                    queue.extend(router.drain()?);
                }
            }
            RouterEvent::SharesReady => {
                let Some(router) = state.router.as_mut() else {
                    continue;
                };
                let Some(signing) = router.signing.as_mut() else {
                    continue;
                };
                let signature = signing.aggregate()?;
                signing_completed(state, status_tx, signature);
            }
        }
    }
    Ok(())
}

/// Executes mesh-controller actions, feeding any newly enabled router events
/// back into the pump queue.
pub(crate) async fn apply_mesh_actions(
    state: &mut AppState,
    transport: &Arc<dyn PeerTransport>,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
    cmd_tx: &mpsc::UnboundedSender<InternalCommand>,
    actions: Vec<MeshAction>,
    queue: &mut VecDeque<RouterEvent>,
) -> Result<()> {
    for action in actions {
        match action {
            MeshAction::SendChannelOpen { to } => {
                let (session_id, my_index) = match (state.controller.active(), state.router.as_ref())
                {
                    (Some(session), Some(router)) => {
                        (session.session_id.clone(), router.my_index())
                    }
                    _ => continue,
                };
                let envelope = ProtocolEnvelope::channel_open(&session_id, my_index);
                if let Err(e) = transport.send(&to, envelope.to_wire()?).await {
                    warn!(peer = %to, "channel_open send failed: {e}");
                }
            }
            MeshAction::BroadcastMeshReady => {
                let (session_id, my_index) = match (state.controller.active(), state.router.as_ref())
                {
                    (Some(session), Some(router)) => {
                        (session.session_id.clone(), router.my_index())
                    }
                    _ => continue,
                };
                let envelope = ProtocolEnvelope::mesh_ready(&session_id, my_index);
                broadcast_envelope(state, transport, &envelope).await?;
            }
            MeshAction::StatusChanged(status) => {
                state.mesh_status = status.clone();
                emit(status_tx, StatusUpdate::MeshStatusChanged(status.clone()));
                if status == MeshStatus::Ready {
                    info!("mesh ready");
                    if let Some(router) = state.router.as_mut() {
                        router.set_mesh_ready();
                        queue.extend(router.drain()?);
                    }
                    let _ = cmd_tx.send(InternalCommand::CheckAndTriggerDkg);
                    let _ = cmd_tx.send(InternalCommand::CheckAndTriggerSigning);
                }
            }
        }
    }
    Ok(())
}
