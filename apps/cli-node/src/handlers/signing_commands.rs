//! Signing drivers: build the engine from the keystore share once the mesh
//! is ready, then let router events carry the commitment/share/aggregate
//! phases.

use super::{SIGNING_PHASE_TIMEOUT, broadcast_envelope, emit, process_router_events};
use crate::errors::{AppError, Result};
use crate::network::transport::PeerTransport;
use crate::protocal::envelope::ProtocolEnvelope;
use crate::protocal::router::SessionSigning;
use crate::protocal::signal::{CurveType, SessionStatus, SessionType};
use crate::utils::state::{AppState, InternalCommand, MeshStatus, StatusUpdate};
use frost_mpc_core::KeystoreData;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tracing::info;

/// Starts the commitment phase when the signing session is fully accepted,
/// the mesh is ready, and the keystore can hand us the share.
pub async fn handle_check_and_trigger_signing(
    state: Arc<Mutex<AppState>>,
    transport: &Arc<dyn PeerTransport>,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
    cmd_tx: &mpsc::UnboundedSender<InternalCommand>,
) -> Result<()> {
    let mut guard = state.lock().await;

    let session = match guard.controller.active() {
        Some(session)
            if session.is_signing()
                && session.status == SessionStatus::AllAccepted
                && guard.mesh_status == MeshStatus::Ready =>
        {
            session.clone()
        }
        _ => return Ok(()),
    };
    if guard
        .router
        .as_ref()
        .map(|r| r.signing.is_some())
        .unwrap_or(true)
    {
        return Ok(());
    }

    let SessionType::Signing {
        wallet_name,
        curve_type,
        group_public_key,
        message,
        ..
    } = &session.session_type
    else {
        return Ok(());
    };

    let Some(keystore) = guard.keystore.clone() else {
        return Err(AppError::Keystore(crate::keystore::KeystoreError::General(
            "no keystore configured".into(),
        )));
    };
    let keystore_guard = keystore.lock().await;
    if !keystore_guard.is_unlocked() {
        emit(
            status_tx,
            StatusUpdate::Log("keystore is locked; /unlock <password> to proceed".into()),
        );
        return Ok(());
    }
    let share_bytes = keystore_guard.get_key_share(wallet_name)?;
    drop(keystore_guard);

    let keystore_data: KeystoreData = serde_json::from_slice(&share_bytes)
        .map_err(|e| AppError::Protocol(format!("corrupt key share: {e}")))?;

    let curve = CurveType::from_string(curve_type)
        .ok_or_else(|| AppError::InvalidParams(format!("unknown curve {curve_type}")))?;
    let message_bytes = hex::decode(message)
        .map_err(|e| AppError::InvalidParams(format!("message is not hex: {e}")))?;
    let expected_group_key = hex::decode(group_public_key)
        .map_err(|e| AppError::InvalidParams(format!("group key is not hex: {e}")))?;

    let mut signers: Vec<u16> = session
        .participants
        .iter()
        .filter_map(|p| guard.signer_indices.get(p).copied())
        .collect();
    signers.sort_unstable();
    signers.dedup();
    if signers.len() != session.participants.len() {
        return Err(AppError::Protocol(format!(
            "signer index map incomplete: {}/{} known",
            signers.len(),
            session.participants.len()
        )));
    }

    let Some(router) = guard.router.as_mut() else {
        return Ok(());
    };
    let my_index = router.my_index();
    let mut signing = SessionSigning::from_keystore_data(
        curve,
        &keystore_data,
        &session.session_id,
        message_bytes,
        my_index,
        &signers,
        Some(expected_group_key.as_slice()),
    )?;

    let commitment = signing.generate_commitment()?;
    router.signing = Some(signing);
    guard.round_deadline = Some((
        Instant::now() + SIGNING_PHASE_TIMEOUT,
        1,
        "signing commitment phase".into(),
    ));
    info!(session_id = %session.session_id, my_index, "signing commitment phase started");

    let envelope = ProtocolEnvelope::sign_commitment(&session.session_id, my_index, &commitment);
    broadcast_envelope(&guard, transport, &envelope).await?;

    let mut events = Vec::new();
    if let Some(router) = guard.router.as_mut() {
        events.extend(router.ingest(envelope)?);
        events.extend(router.drain()?);
    }
    process_router_events(&mut guard, transport, status_tx, cmd_tx, events).await?;
    Ok(())
}
