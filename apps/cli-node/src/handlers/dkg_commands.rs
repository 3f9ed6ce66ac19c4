//! DKG drivers: trigger round 1 once the mesh is ready, then let the router
//! events carry the run through rounds 2 and finalization.

use super::{DKG_ROUND_TIMEOUT, broadcast_envelope, emit, process_router_events};
use crate::errors::Result;
use crate::network::transport::PeerTransport;
use crate::protocal::envelope::ProtocolEnvelope;
use crate::protocal::signal::{SessionStatus, SessionType};
use crate::utils::state::{AppState, InternalCommand, MeshStatus, StatusUpdate};
use frost_mpc_core::DkgState;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tracing::info;

/// Starts DKG round 1 when (and only when) the session is fully accepted,
/// the mesh is ready, and no run is already underway.
pub async fn handle_check_and_trigger_dkg(
    state: Arc<Mutex<AppState>>,
    transport: &Arc<dyn PeerTransport>,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
    cmd_tx: &mpsc::UnboundedSender<InternalCommand>,
) -> Result<()> {
    let mut guard = state.lock().await;

    let ready = match guard.controller.active() {
        Some(session) => {
            matches!(session.session_type, SessionType::DKG)
                && session.status == SessionStatus::AllAccepted
                && guard.mesh_status == MeshStatus::Ready
        }
        None => false,
    };
    if !ready || guard.dkg_state != DkgState::Idle {
        return Ok(());
    }
    let Some(session_id) = guard.controller.active().map(|s| s.session_id.clone()) else {
        return Ok(());
    };

    guard.dkg_state = DkgState::Initializing;
    emit(status_tx, StatusUpdate::DkgStateChanged(guard.dkg_state.clone()));

    let (my_index, package) = {
        let Some(router) = guard.router.as_mut() else {
            return Ok(());
        };
        let my_index = router.my_index();
        let Some(dkg) = router.dkg.as_mut() else {
            return Ok(());
        };
        (my_index, dkg.generate_round1()?)
    };

    guard.dkg_state = DkgState::Round1InProgress;
    guard.round_deadline = Some((Instant::now() + DKG_ROUND_TIMEOUT, 1, "dkg round 1".into()));
    emit(status_tx, StatusUpdate::DkgStateChanged(guard.dkg_state.clone()));
    info!(%session_id, my_index, "DKG round 1 started");

    // Broadcast our commitment first, then loop it back through the router
    // so our own package is accounted like everyone else's.
    let envelope = ProtocolEnvelope::dkg_round1(&session_id, my_index, &package);
    broadcast_envelope(&guard, transport, &envelope).await?;

    let mut events = Vec::new();
    if let Some(router) = guard.router.as_mut() {
        events.extend(router.ingest(envelope)?);
        events.extend(router.drain()?);
    }
    process_router_events(&mut guard, transport, status_tx, cmd_tx, events).await?;
    Ok(())
}
