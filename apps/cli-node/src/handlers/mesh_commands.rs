//! Transport-event handlers: connection setup, channel bookkeeping, peer
//! loss.

use super::{apply_mesh_actions, emit, fail_session, process_router_events};
use crate::errors::Result;
use crate::network::transport::PeerTransport;
use crate::utils::state::{AppState, InternalCommand, StatusUpdate};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

/// Dials every session peer per the initiator rule (we dial ids greater than
/// ours; smaller ids dial us and we answer).
pub async fn handle_initiate_mesh(
    state: Arc<Mutex<AppState>>,
    transport: &Arc<dyn PeerTransport>,
) -> Result<()> {
    let guard = state.lock().await;
    let Some(mesh) = guard.mesh.as_ref() else {
        return Ok(());
    };
    let plan: Vec<(String, bool)> = mesh
        .peers()
        .into_iter()
        .map(|peer| {
            let initiator = mesh.is_initiator_for(&peer);
            (peer, initiator)
        })
        .collect();
    drop(guard);

    for (peer, initiator) in plan {
        info!(%peer, initiator, "starting transport connection");
        if let Err(e) = transport.create_connection(&peer, initiator).await {
            warn!(%peer, "connection setup failed: {e}");
        }
    }
    Ok(())
}

/// The transport opened our channel to `device_id`.
pub async fn handle_channel_open(
    state: Arc<Mutex<AppState>>,
    transport: &Arc<dyn PeerTransport>,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
    cmd_tx: &mpsc::UnboundedSender<InternalCommand>,
    device_id: String,
) -> Result<()> {
    let mut guard = state.lock().await;
    // Link state outlives sessions; a later session replays it at setup.
    guard.open_channels.insert(device_id.clone());
    let actions = match guard.mesh.as_mut() {
        Some(mesh) => mesh.on_local_channel_open(&device_id),
        None => return Ok(()),
    };
    let mut queue = VecDeque::new();
    apply_mesh_actions(&mut guard, transport, status_tx, cmd_tx, actions, &mut queue).await?;
    process_router_events(&mut guard, transport, status_tx, cmd_tx, queue.into()).await?;
    Ok(())
}

/// The transport lost the channel to `device_id`. Downgrades the mesh and
/// fails the session when the protocol still needs the peer's contributions.
pub async fn handle_peer_disconnected(
    state: Arc<Mutex<AppState>>,
    transport: &Arc<dyn PeerTransport>,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
    cmd_tx: &mpsc::UnboundedSender<InternalCommand>,
    device_id: String,
) -> Result<()> {
    let mut guard = state.lock().await;
    guard.open_channels.remove(&device_id);
    let Some(session) = guard.controller.active() else {
        return Ok(());
    };
    if !session.participants.contains(&device_id) {
        return Ok(());
    }

    let actions = match guard.mesh.as_mut() {
        Some(mesh) => mesh.on_peer_closed(&device_id),
        None => Vec::new(),
    };
    let mut queue = VecDeque::new();
    apply_mesh_actions(&mut guard, transport, status_tx, cmd_tx, actions, &mut queue).await?;
    process_router_events(&mut guard, transport, status_tx, cmd_tx, queue.into()).await?;

    // Does the protocol still need this peer?
    let peer_index = guard.participant_index_of(&device_id);
    let needed = match (peer_index, guard.router.as_ref()) {
        (Some(index), Some(router)) => {
            let dkg_needs = router.dkg.as_ref().map(|d| d.still_needs(index)).unwrap_or(false);
            let signing_needs = router
                .signing
                .as_ref()
                .map(|s| s.still_needs(index))
                .unwrap_or(false);
            // A signing session that has not built its engine yet still
            // needs every chosen signer.
            let signing_pending = guard
                .controller
                .active()
                .map(|s| s.is_signing())
                .unwrap_or(false)
                && router.signing.is_none();
            dkg_needs || signing_needs || signing_pending
        }
        (None, _) | (_, None) => false,
    };

    if needed {
        warn!(%device_id, "required peer lost");
        fail_session(
            &mut guard,
            status_tx,
            crate::errors::AppError::PeerLost(device_id).to_string(),
        );
    } else {
        emit(
            status_tx,
            StatusUpdate::Log(format!("peer {device_id} disconnected (not required)")),
        );
    }
    Ok(())
}
