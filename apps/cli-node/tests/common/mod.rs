//! Multi-node test harness: real runners over the in-memory signaling hub
//! and mesh, no sockets.

use cli_node::app_runner::AppRunner;
use cli_node::network::memory::{MemoryMeshHub, MemorySignalHub};
use cli_node::network::transport::PeerTransport;
use cli_node::protocal::signal::CurveType;
use cli_node::utils::state::{AppState, InternalCommand, StatusUpdate};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{Mutex, mpsc};

pub struct TestNode {
    pub device_id: String,
    pub cmd: mpsc::UnboundedSender<InternalCommand>,
    pub status: mpsc::UnboundedReceiver<StatusUpdate>,
    pub state: Arc<Mutex<AppState>>,
    // Keeps the keystore directory alive for the node's lifetime.
    pub keystore_dir: TempDir,
}

pub async fn spawn_node(
    signal_hub: &Arc<MemorySignalHub>,
    mesh_hub: &Arc<MemoryMeshHub>,
    device_id: &str,
    curve: CurveType,
) -> TestNode {
    let signal = signal_hub.connect(device_id);
    let (transport, transport_events) = mesh_hub.transport(device_id);
    let transport: Arc<dyn PeerTransport> = transport;

    let (runner, status) = AppRunner::new(device_id, curve, transport, transport_events, Some(signal));
    let keystore_dir = TempDir::new().expect("tempdir");
    runner
        .init_keystore(keystore_dir.path())
        .await
        .expect("keystore init");

    let cmd = runner.command_sender();
    let state = runner.app_state();
    tokio::spawn(runner.run());

    TestNode {
        device_id: device_id.to_string(),
        cmd,
        status,
        state,
        keystore_dir,
    }
}

/// Consumes status updates until one matches, panicking after `secs`.
pub async fn expect_status<F>(node: &mut TestNode, secs: u64, description: &str, pred: F) -> StatusUpdate
where
    F: Fn(&StatusUpdate) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, node.status.recv()).await {
            Ok(Some(update)) => {
                if pred(&update) {
                    return update;
                }
            }
            Ok(None) => panic!("{}: status stream of {} closed", description, node.device_id),
            Err(_) => panic!("{}: timed out on {}", description, node.device_id),
        }
    }
}

/// Waits for a `DkgComplete` and returns its group public key (hex).
pub async fn expect_dkg_complete(node: &mut TestNode, secs: u64) -> (String, Vec<cli_node::keystore::BlockchainInfo>) {
    let update = expect_status(node, secs, "dkg complete", |u| {
        matches!(u, StatusUpdate::DkgComplete { .. })
    })
    .await;
    match update {
        StatusUpdate::DkgComplete {
            group_public_key,
            addresses,
            ..
        } => (group_public_key, addresses),
        _ => unreachable!(),
    }
}

/// Waits for a `SigningComplete` and returns the signature hex.
pub async fn expect_signing_complete(node: &mut TestNode, secs: u64) -> String {
    let update = expect_status(node, secs, "signing complete", |u| {
        matches!(u, StatusUpdate::SigningComplete { .. })
    })
    .await;
    match update {
        StatusUpdate::SigningComplete { signature, .. } => signature,
        _ => unreachable!(),
    }
}
