//! Session proposal / acceptance handlers.

use super::{PROPOSAL_TIMEOUT, emit, fail_session, relay_to};
use crate::errors::{AppError, Result};
use crate::protocal::router::{ProtocolRouter, SessionDkg};
use crate::protocal::signal::{
    ClientMsg, CurveType, SessionProposal, SessionResponse, SessionStatus, SessionType,
    WalletStatus, WebSocketMessage,
};
use crate::session::controller::{ResponseOutcome, validate_signing_wallet};
use crate::session::mesh::MeshController;
use crate::utils::state::{AppState, InternalCommand, StatusUpdate};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

/// Proposes a DKG session and notifies the invited participants.
pub async fn handle_propose_session(
    state: Arc<Mutex<AppState>>,
    transport: &Arc<dyn crate::network::transport::PeerTransport>,
    cmd_tx: &mpsc::UnboundedSender<InternalCommand>,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
    session_id: String,
    total: u16,
    threshold: u16,
    participants: Vec<String>,
) -> Result<()> {
    let mut guard = state.lock().await;
    let curve = guard.curve;
    let session = guard.controller.propose(
        &session_id,
        total,
        threshold,
        participants,
        curve.as_str(),
        SessionType::DKG,
    )?;
    guard.reset_session_state();
    guard.proposal_deadline = Some(Instant::now() + PROPOSAL_TIMEOUT);

    let proposal = SessionProposal {
        session_id: session.session_id.clone(),
        total,
        threshold,
        participants: session.participants.clone(),
        session_type: SessionType::DKG,
        proposer_device_id: guard.device_id.clone(),
        curve_type: curve.as_str().to_string(),
    };
    for peer in &session.participants {
        if peer != &guard.device_id {
            relay_to(cmd_tx, peer, &WebSocketMessage::SessionProposal(proposal.clone()))?;
        }
    }
    let _ = cmd_tx.send(InternalCommand::SendToServer(ClientMsg::AnnounceSession {
        session_id: session.session_id.clone(),
        session_type: "dkg".to_string(),
        total,
        threshold,
        curve_type: curve.as_str().to_string(),
    }));

    info!(session_id = %session.session_id, "proposed DKG session");
    emit(
        status_tx,
        StatusUpdate::SessionProposed {
            session_id: session.session_id.clone(),
        },
    );

    // A 1-of-1 "mesh" is trivially all-accepted at proposal time.
    maybe_all_accepted(&mut guard, transport, cmd_tx, status_tx).await?;
    Ok(())
}

/// Proposes a signing session over an existing wallet with a chosen signer
/// set.
pub async fn handle_propose_signing(
    state: Arc<Mutex<AppState>>,
    transport: &Arc<dyn crate::network::transport::PeerTransport>,
    cmd_tx: &mpsc::UnboundedSender<InternalCommand>,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
    wallet_name: String,
    message_hex: String,
    signers: Vec<String>,
) -> Result<()> {
    let mut guard = state.lock().await;

    hex::decode(&message_hex)
        .map_err(|e| AppError::InvalidParams(format!("message is not hex: {e}")))?;

    let Some(keystore) = guard.keystore.clone() else {
        return Err(AppError::Keystore(crate::keystore::KeystoreError::General(
            "no keystore configured".into(),
        )));
    };
    let keystore_guard = keystore.lock().await;
    let wallet = keystore_guard
        .get_wallet(&wallet_name)
        .ok_or_else(|| AppError::WalletMissing(wallet_name.clone()))?
        .clone();
    drop(keystore_guard);

    let curve = CurveType::from_string(&wallet.curve_type)
        .ok_or_else(|| AppError::InvalidParams(format!("unknown curve {}", wallet.curve_type)))?;
    let blockchain = wallet
        .blockchains
        .iter()
        .find(|b| b.enabled)
        .map(|b| (b.blockchain.clone(), b.chain_id))
        .unwrap_or_else(|| match curve {
            CurveType::Secp256k1 => ("ethereum".to_string(), Some(1)),
            CurveType::Ed25519 => ("solana".to_string(), None),
        });

    let session_type = SessionType::Signing {
        wallet_name: wallet_name.clone(),
        curve_type: wallet.curve_type.clone(),
        threshold: wallet.threshold,
        total: wallet.total_participants,
        group_public_key: wallet.group_public_key.clone(),
        message: message_hex,
        blockchain: blockchain.0,
        chain_id: blockchain.1,
    };

    // The session id is the wallet name so every participant auto-selects
    // the right keystore entry.
    let session = guard.controller.propose(
        &wallet_name,
        wallet.total_participants,
        wallet.threshold,
        signers,
        &wallet.curve_type,
        session_type.clone(),
    )?;
    guard.reset_session_state();
    guard.proposal_deadline = Some(Instant::now() + PROPOSAL_TIMEOUT);
    let device_id = guard.device_id.clone();
    guard
        .signer_indices
        .insert(device_id, wallet.participant_index);

    let proposal = SessionProposal {
        session_id: session.session_id.clone(),
        total: wallet.total_participants,
        threshold: wallet.threshold,
        participants: session.participants.clone(),
        session_type,
        proposer_device_id: guard.device_id.clone(),
        curve_type: wallet.curve_type.clone(),
    };
    // The proposer's own acceptance (with its DKG-time index) rides along so
    // peers can complete the device -> index map.
    let own_response = SessionResponse {
        session_id: session.session_id.clone(),
        from_device_id: guard.device_id.clone(),
        accepted: true,
        wallet_status: Some(WalletStatus {
            has_wallet: true,
            wallet_valid: true,
            identifier: Some(wallet.participant_index),
            error_reason: None,
        }),
        reason: None,
    };
    for peer in &session.participants {
        if peer != &guard.device_id {
            relay_to(cmd_tx, peer, &WebSocketMessage::SessionProposal(proposal.clone()))?;
            relay_to(cmd_tx, peer, &WebSocketMessage::SessionResponse(own_response.clone()))?;
        }
    }

    info!(session_id = %session.session_id, "proposed signing session");
    emit(
        status_tx,
        StatusUpdate::SessionProposed {
            session_id: session.session_id,
        },
    );
    maybe_all_accepted(&mut guard, transport, cmd_tx, status_tx).await?;
    Ok(())
}

/// Stores an incoming proposal as an invite for the user to accept.
pub async fn handle_process_proposal(
    state: Arc<Mutex<AppState>>,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
    from: String,
    proposal: SessionProposal,
) -> Result<()> {
    let mut guard = state.lock().await;
    let session = guard.controller.on_proposal(proposal);
    info!(session_id = %session.session_id, %from, "received session proposal");
    emit(
        status_tx,
        StatusUpdate::SessionInvite {
            session_id: session.session_id,
            from,
        },
    );
    Ok(())
}

/// Accepts an invite: validates the wallet for signing sessions, reports our
/// status to every participant, and kicks off the mesh if we were last.
pub async fn handle_accept_session(
    state: Arc<Mutex<AppState>>,
    transport: &Arc<dyn crate::network::transport::PeerTransport>,
    cmd_tx: &mpsc::UnboundedSender<InternalCommand>,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
    session_id: String,
) -> Result<()> {
    let mut guard = state.lock().await;
    let session = guard.controller.accept(&session_id)?;
    guard.reset_session_state();
    guard.proposal_deadline = Some(Instant::now() + PROPOSAL_TIMEOUT);

    let mut wallet_status = None;
    if session.is_signing() {
        let keystore = guard.keystore.clone();
        let wallet = match keystore {
            Some(ks) => ks.lock().await.get_wallet(&session_id).cloned(),
            None => None,
        };
        match validate_signing_wallet(&session.session_type, wallet.as_ref()) {
            Ok(index) => {
                let device_id = guard.device_id.clone();
                guard.signer_indices.insert(device_id, index);
                wallet_status = Some(WalletStatus {
                    has_wallet: true,
                    wallet_valid: true,
                    identifier: Some(index),
                    error_reason: None,
                });
            }
            Err(e) => {
                // Fatal for this participant: tell everyone and abort locally.
                warn!(%session_id, "wallet validation failed: {e}");
                let response = SessionResponse {
                    session_id: session_id.clone(),
                    from_device_id: guard.device_id.clone(),
                    accepted: false,
                    wallet_status: Some(WalletStatus {
                        has_wallet: !matches!(e, AppError::WalletMissing(_)),
                        wallet_valid: false,
                        identifier: None,
                        error_reason: Some(e.to_string()),
                    }),
                    reason: Some(e.to_string()),
                };
                for peer in &session.participants {
                    if peer != &guard.device_id {
                        relay_to(cmd_tx, peer, &WebSocketMessage::SessionResponse(response.clone()))?;
                    }
                }
                fail_session(&mut guard, status_tx, e.to_string());
                return Err(e);
            }
        }
    }

    let response = SessionResponse {
        session_id: session_id.clone(),
        from_device_id: guard.device_id.clone(),
        accepted: true,
        wallet_status,
        reason: None,
    };
    for peer in &session.participants {
        if peer != &guard.device_id {
            relay_to(cmd_tx, peer, &WebSocketMessage::SessionResponse(response.clone()))?;
        }
    }

    info!(%session_id, "accepted session");
    maybe_all_accepted(&mut guard, transport, cmd_tx, status_tx).await?;
    Ok(())
}

/// Merges a peer's response; an abort from anyone kills the session for all.
pub async fn handle_process_response(
    state: Arc<Mutex<AppState>>,
    transport: &Arc<dyn crate::network::transport::PeerTransport>,
    cmd_tx: &mpsc::UnboundedSender<InternalCommand>,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
    from: String,
    response: SessionResponse,
) -> Result<()> {
    let mut guard = state.lock().await;

    if let Some(status) = &response.wallet_status {
        if let Some(index) = status.identifier {
            guard.signer_indices.insert(from.clone(), index);
        }
    }

    match guard.controller.on_response(&response) {
        ResponseOutcome::Aborted { device, reason } => {
            fail_session(
                &mut guard,
                status_tx,
                format!("{device} aborted the session: {reason}"),
            );
        }
        ResponseOutcome::AllAccepted => {
            on_all_accepted(&mut guard, transport, cmd_tx, status_tx).await?;
        }
        ResponseOutcome::Pending | ResponseOutcome::NotOurSession => {}
    }
    Ok(())
}

/// Fires the AllAccepted transition work if our own accept completed the set.
pub(crate) async fn maybe_all_accepted(
    guard: &mut AppState,
    transport: &Arc<dyn crate::network::transport::PeerTransport>,
    cmd_tx: &mpsc::UnboundedSender<InternalCommand>,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
) -> Result<()> {
    let transitioned = guard
        .controller
        .active()
        .map(|s| s.status == SessionStatus::AllAccepted)
        .unwrap_or(false)
        && guard.router.is_none();
    if transitioned {
        on_all_accepted(guard, transport, cmd_tx, status_tx).await?;
    }
    Ok(())
}

/// All participants accepted: build the router (and, for DKG, the engine),
/// start forming the mesh, and replay anything that arrived early — links
/// that were already open and envelopes that had no router yet.
pub(crate) async fn on_all_accepted(
    guard: &mut AppState,
    transport: &Arc<dyn crate::network::transport::PeerTransport>,
    cmd_tx: &mpsc::UnboundedSender<InternalCommand>,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
) -> Result<()> {
    let Some(session) = guard.controller.active().cloned() else {
        return Ok(());
    };
    guard.proposal_deadline = None;

    let device_id = guard.device_id.clone();
    let Some(my_index) = guard.participant_index_of(&device_id) else {
        return Err(AppError::Protocol(
            "no participant index for this device".into(),
        ));
    };

    let mut router = ProtocolRouter::new(&session.session_id, my_index);
    if !session.is_signing() {
        let curve = CurveType::from_string(&session.curve_type)
            .ok_or_else(|| AppError::InvalidParams(format!("unknown curve {}", session.curve_type)))?;
        router.dkg = Some(SessionDkg::new(
            curve,
            my_index,
            session.total,
            session.threshold,
        )?);
    }
    guard.router = Some(router);
    guard.mesh = Some(MeshController::new(
        &guard.device_id,
        session.participants.clone(),
    ));

    info!(session_id = %session.session_id, "all participants accepted");
    emit(
        status_tx,
        StatusUpdate::SessionAllAccepted {
            session_id: session.session_id.clone(),
        },
    );
    let _ = cmd_tx.send(InternalCommand::InitiateMeshConnections);

    let mut queue = std::collections::VecDeque::new();

    // Links reused from an earlier session are already open; the transport
    // will not announce them again.
    let open_now: Vec<String> = session
        .participants
        .iter()
        .filter(|p| **p != guard.device_id && guard.open_channels.contains(*p))
        .cloned()
        .collect();
    for peer in open_now {
        let actions = match guard.mesh.as_mut() {
            Some(mesh) => mesh.on_local_channel_open(&peer),
            None => Vec::new(),
        };
        super::apply_mesh_actions(guard, transport, status_tx, cmd_tx, actions, &mut queue).await?;
    }

    // Envelopes that outran the AllAccepted transition.
    let pending: Vec<_> = {
        let mut kept = Vec::new();
        let mut matching = Vec::new();
        for (from, envelope) in guard.pending_envelopes.drain(..) {
            if envelope.session_id == session.session_id {
                matching.push(envelope);
            } else {
                kept.push((from, envelope));
            }
        }
        guard.pending_envelopes = kept;
        matching
    };
    if let Some(router) = guard.router.as_mut() {
        for envelope in pending {
            queue.extend(router.ingest(envelope)?);
        }
        queue.extend(router.drain()?);
    }
    super::process_router_events(guard, transport, status_tx, cmd_tx, queue.into()).await?;
    Ok(())
}

/// Deadline sweep: proposal and round timeouts are fatal to the session.
pub async fn handle_check_timeouts(
    state: Arc<Mutex<AppState>>,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
) -> Result<()> {
    let mut guard = state.lock().await;
    let now = Instant::now();

    if let Some(deadline) = guard.proposal_deadline {
        if now >= deadline {
            guard.proposal_deadline = None;
            fail_session(
                &mut guard,
                status_tx,
                "session proposal timed out waiting for acceptance".into(),
            );
            return Ok(());
        }
    }

    if let Some((deadline, round, phase)) = guard.round_deadline.clone() {
        if now >= deadline {
            guard.round_deadline = None;
            let err = AppError::RoundTimeout { round, phase };
            fail_session(&mut guard, status_tx, err.to_string());
        }
    }
    Ok(())
}
