//! End-to-end signing scenarios: threshold subsets, peer loss, wallet
//! mismatch.

mod common;

use cli_node::keystore::WalletMetadata;
use cli_node::network::memory::{MemoryMeshHub, MemorySignalHub};
use cli_node::protocal::signal::CurveType;
use cli_node::utils::state::{InternalCommand, MeshStatus, StatusUpdate};
use common::{TestNode, expect_dkg_complete, expect_signing_complete, expect_status, spawn_node};
use std::sync::Arc;

const MESSAGE_HEX: &str = "123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef0";

/// Runs a 2-of-3 secp256k1 DKG among three fresh nodes and saves the wallet
/// on each. Returns the nodes and the group key hex.
async fn dkg_and_save(
    signal_hub: &Arc<MemorySignalHub>,
    mesh_hub: &Arc<MemoryMeshHub>,
    names: [&str; 3],
) -> (Vec<TestNode>, String) {
    let mut nodes = Vec::new();
    for name in names {
        nodes.push(spawn_node(signal_hub, mesh_hub, name, CurveType::Secp256k1).await);
    }

    nodes[0]
        .cmd
        .send(InternalCommand::ProposeSession {
            session_id: "vault".into(),
            total: 3,
            threshold: 2,
            participants: names.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap();

    for node in nodes.iter_mut().skip(1) {
        expect_status(node, 10, "invite", |u| {
            matches!(u, StatusUpdate::SessionInvite { session_id, .. } if session_id == "vault")
        })
        .await;
        node.cmd
            .send(InternalCommand::AcceptSessionProposal("vault".into()))
            .unwrap();
    }

    let mut group_key = String::new();
    for node in nodes.iter_mut() {
        let (key, _) = expect_dkg_complete(node, 30).await;
        if group_key.is_empty() {
            group_key = key;
        } else {
            assert_eq!(group_key, key);
        }
    }

    for node in nodes.iter_mut() {
        node.cmd
            .send(InternalCommand::CreateWallet {
                password: "test-password".into(),
            })
            .unwrap();
        expect_status(node, 10, "wallet saved", |u| {
            matches!(u, StatusUpdate::WalletSaved { .. })
        })
        .await;
    }

    (nodes, group_key)
}

#[tokio::test]
async fn two_of_three_subset_signs_and_aggregates_identically() {
    let signal_hub = MemorySignalHub::new();
    let mesh_hub = MemoryMeshHub::new();
    let (mut nodes, _) = dkg_and_save(&signal_hub, &mesh_hub, ["sa", "sb", "sc"]).await;

    // Sign with the subset {sa, sb}; sc stays offline.
    nodes[0]
        .cmd
        .send(InternalCommand::ProposeSigning {
            wallet_name: "vault".into(),
            message_hex: MESSAGE_HEX.into(),
            signers: vec!["sa".into(), "sb".into()],
        })
        .unwrap();

    expect_status(&mut nodes[1], 10, "signing invite", |u| {
        matches!(u, StatusUpdate::SessionInvite { session_id, .. } if session_id == "vault")
    })
    .await;
    nodes[1]
        .cmd
        .send(InternalCommand::AcceptSessionProposal("vault".into()))
        .unwrap();

    let sig_a = expect_signing_complete(&mut nodes[0], 30).await;
    let sig_b = expect_signing_complete(&mut nodes[1], 30).await;

    // Aggregation is deterministic: both signers hold the same bytes, and
    // the engine refused to emit anything that does not verify.
    assert_eq!(sig_a, sig_b);
    assert!(!sig_a.is_empty());
}

#[tokio::test]
async fn losing_a_chosen_signer_fails_then_fresh_set_succeeds() {
    let signal_hub = MemorySignalHub::new();
    let mesh_hub = MemoryMeshHub::new();
    let (mut nodes, _) = dkg_and_save(&signal_hub, &mesh_hub, ["pa", "pb", "pc"]).await;

    // Lock pc's keystore so it never contributes a commitment: the signer
    // set {pa, pb, pc} is fixed at signing start, so pc's loss is fatal.
    {
        let keystore = nodes[2].state.lock().await.keystore.clone().unwrap();
        keystore.lock().await.lock();
    }

    nodes[0]
        .cmd
        .send(InternalCommand::ProposeSigning {
            wallet_name: "vault".into(),
            message_hex: MESSAGE_HEX.into(),
            signers: vec!["pa".into(), "pb".into(), "pc".into()],
        })
        .unwrap();
    for i in [1, 2] {
        expect_status(&mut nodes[i], 10, "signing invite", |u| {
            matches!(u, StatusUpdate::SessionInvite { session_id, .. } if session_id == "vault")
        })
        .await;
        nodes[i]
            .cmd
            .send(InternalCommand::AcceptSessionProposal("vault".into()))
            .unwrap();
    }

    // Wait for the mesh so the run is genuinely mid-protocol, then drop pc.
    expect_status(&mut nodes[0], 20, "mesh ready", |u| {
        matches!(u, StatusUpdate::MeshStatusChanged(MeshStatus::Ready))
    })
    .await;
    expect_status(&mut nodes[1], 20, "mesh ready", |u| {
        matches!(u, StatusUpdate::MeshStatusChanged(MeshStatus::Ready))
    })
    .await;
    mesh_hub.kill("pc");

    for node in nodes[..2].iter_mut() {
        let update = expect_status(node, 30, "peer lost", |u| {
            matches!(u, StatusUpdate::SessionFailed { .. })
        })
        .await;
        match update {
            StatusUpdate::SessionFailed { reason, .. } => {
                assert!(reason.contains("Peer lost"), "unexpected reason: {reason}");
            }
            _ => unreachable!(),
        }
    }

    // A fresh attempt with a different t-sized signer set completes.
    nodes[0]
        .cmd
        .send(InternalCommand::ProposeSigning {
            wallet_name: "vault".into(),
            message_hex: MESSAGE_HEX.into(),
            signers: vec!["pa".into(), "pb".into()],
        })
        .unwrap();
    expect_status(&mut nodes[1], 10, "signing invite", |u| {
        matches!(u, StatusUpdate::SessionInvite { session_id, .. } if session_id == "vault")
    })
    .await;
    nodes[1]
        .cmd
        .send(InternalCommand::AcceptSessionProposal("vault".into()))
        .unwrap();

    let sig_a = expect_signing_complete(&mut nodes[0], 30).await;
    let sig_b = expect_signing_complete(&mut nodes[1], 30).await;
    assert_eq!(sig_a, sig_b);
}

#[tokio::test]
async fn locked_keystore_stalls_until_unlock() {
    let signal_hub = MemorySignalHub::new();
    let mesh_hub = MemoryMeshHub::new();
    let (mut nodes, _) = dkg_and_save(&signal_hub, &mesh_hub, ["la", "lb", "lc"]).await;

    // lb forgets its session password.
    {
        let keystore = nodes[1].state.lock().await.keystore.clone().unwrap();
        keystore.lock().await.lock();
    }

    nodes[0]
        .cmd
        .send(InternalCommand::ProposeSigning {
            wallet_name: "vault".into(),
            message_hex: MESSAGE_HEX.into(),
            signers: vec!["la".into(), "lb".into()],
        })
        .unwrap();
    expect_status(&mut nodes[1], 10, "signing invite", |u| {
        matches!(u, StatusUpdate::SessionInvite { session_id, .. } if session_id == "vault")
    })
    .await;
    nodes[1]
        .cmd
        .send(InternalCommand::AcceptSessionProposal("vault".into()))
        .unwrap();

    // lb reaches the trigger but cannot read its share yet.
    expect_status(&mut nodes[1], 20, "locked hint", |u| {
        matches!(u, StatusUpdate::Log(line) if line.contains("locked"))
    })
    .await;

    // Unlocking re-fires the signing trigger and the run completes.
    nodes[1]
        .cmd
        .send(InternalCommand::UnlockKeystore {
            password: "test-password".into(),
        })
        .unwrap();
    let sig_a = expect_signing_complete(&mut nodes[0], 30).await;
    let sig_b = expect_signing_complete(&mut nodes[1], 30).await;
    assert_eq!(sig_a, sig_b);
}

#[tokio::test]
async fn wallet_mismatch_aborts_the_session_for_everyone() {
    let signal_hub = MemorySignalHub::new();
    let mesh_hub = MemoryMeshHub::new();
    let (mut nodes, group_key) = dkg_and_save(&signal_hub, &mesh_hub, ["ma", "mb", "mc"]).await;

    // Replace mc's wallet with a 3-of-3 entry of the same name.
    {
        let keystore = nodes[2].state.lock().await.keystore.clone().unwrap();
        let mut guard = keystore.lock().await;
        guard.remove_wallet("vault").unwrap();
        let mut metadata = WalletMetadata::new(
            "vault".into(),
            "mc".into(),
            "mc".into(),
            "secp256k1".into(),
            3,
            3,
            3,
            group_key.clone(),
        );
        metadata.touch();
        guard.add_wallet(metadata, b"not a real share").unwrap();
    }

    nodes[0]
        .cmd
        .send(InternalCommand::ProposeSigning {
            wallet_name: "vault".into(),
            message_hex: MESSAGE_HEX.into(),
            signers: vec!["ma".into(), "mb".into(), "mc".into()],
        })
        .unwrap();

    for i in [1, 2] {
        expect_status(&mut nodes[i], 10, "signing invite", |u| {
            matches!(u, StatusUpdate::SessionInvite { session_id, .. } if session_id == "vault")
        })
        .await;
        nodes[i]
            .cmd
            .send(InternalCommand::AcceptSessionProposal("vault".into()))
            .unwrap();
    }

    // mc detects the mismatch locally and reports it; the proposer aborts.
    let update = expect_status(&mut nodes[2], 10, "local mismatch", |u| {
        matches!(u, StatusUpdate::SessionFailed { .. })
    })
    .await;
    match update {
        StatusUpdate::SessionFailed { reason, .. } => {
            assert!(
                reason.contains("threshold") && reason.contains("expected 2") && reason.contains("got 3"),
                "unexpected reason: {reason}"
            );
        }
        _ => unreachable!(),
    }
    let update = expect_status(&mut nodes[0], 10, "proposer abort", |u| {
        matches!(u, StatusUpdate::SessionFailed { .. })
    })
    .await;
    match update {
        StatusUpdate::SessionFailed { reason, .. } => {
            assert!(reason.contains("mc"), "unexpected reason: {reason}");
        }
        _ => unreachable!(),
    }
}
