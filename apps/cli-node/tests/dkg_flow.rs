//! End-to-end DKG scenarios over the in-memory mesh.

mod common;

use cli_node::network::memory::{MemoryMeshHub, MemorySignalHub};
use cli_node::protocal::signal::CurveType;
use cli_node::utils::state::{InternalCommand, StatusUpdate};
use common::{expect_dkg_complete, expect_status, spawn_node};

#[tokio::test]
async fn two_of_two_ed25519_dkg_agrees() {
    let signal_hub = MemorySignalHub::new();
    let mesh_hub = MemoryMeshHub::new();

    let mut alpha = spawn_node(&signal_hub, &mesh_hub, "alpha", CurveType::Ed25519).await;
    let mut beta = spawn_node(&signal_hub, &mesh_hub, "beta", CurveType::Ed25519).await;

    alpha
        .cmd
        .send(InternalCommand::ProposeSession {
            session_id: "s1".into(),
            total: 2,
            threshold: 2,
            participants: vec!["alpha".into(), "beta".into()],
        })
        .unwrap();

    expect_status(&mut beta, 10, "invite", |u| {
        matches!(u, StatusUpdate::SessionInvite { session_id, .. } if session_id == "s1")
    })
    .await;
    beta.cmd
        .send(InternalCommand::AcceptSessionProposal("s1".into()))
        .unwrap();

    let (key_alpha, addrs_alpha) = expect_dkg_complete(&mut alpha, 30).await;
    let (key_beta, addrs_beta) = expect_dkg_complete(&mut beta, 30).await;

    assert_eq!(key_alpha, key_beta, "group keys must be byte-identical");
    let key_bytes = hex::decode(&key_alpha).unwrap();
    assert_eq!(key_bytes.len(), 32);

    // The Solana address is the base58 of the 32-byte group point.
    let expected = frost_mpc_blockchain::solana::derive_solana_address(&key_bytes).unwrap();
    assert_eq!(addrs_alpha[0].blockchain, "solana");
    assert_eq!(addrs_alpha[0].address, expected);
    assert_eq!(addrs_beta[0].address, expected);
}

#[tokio::test]
async fn two_of_three_secp256k1_dkg_agrees_with_stable_address() {
    let signal_hub = MemorySignalHub::new();
    let mesh_hub = MemoryMeshHub::new();

    let mut a = spawn_node(&signal_hub, &mesh_hub, "node-a", CurveType::Secp256k1).await;
    let mut b = spawn_node(&signal_hub, &mesh_hub, "node-b", CurveType::Secp256k1).await;
    let mut c = spawn_node(&signal_hub, &mesh_hub, "node-c", CurveType::Secp256k1).await;

    a.cmd
        .send(InternalCommand::ProposeSession {
            session_id: "vault".into(),
            total: 3,
            threshold: 2,
            participants: vec!["node-a".into(), "node-b".into(), "node-c".into()],
        })
        .unwrap();

    for node in [&mut b, &mut c] {
        expect_status(node, 10, "invite", |u| {
            matches!(u, StatusUpdate::SessionInvite { session_id, .. } if session_id == "vault")
        })
        .await;
        node.cmd
            .send(InternalCommand::AcceptSessionProposal("vault".into()))
            .unwrap();
    }

    let (key_a, addrs_a) = expect_dkg_complete(&mut a, 30).await;
    let (key_b, addrs_b) = expect_dkg_complete(&mut b, 30).await;
    let (key_c, addrs_c) = expect_dkg_complete(&mut c, 30).await;

    assert_eq!(key_a, key_b);
    assert_eq!(key_b, key_c);

    // Ethereum address: Keccak-256(X||Y)[12..] with EIP-55 casing, identical
    // on every participant.
    let expected =
        frost_mpc_blockchain::ethereum::derive_eth_address(&hex::decode(&key_a).unwrap()).unwrap();
    for addrs in [&addrs_a, &addrs_b, &addrs_c] {
        let eth = addrs.iter().find(|i| i.blockchain == "ethereum").unwrap();
        assert_eq!(eth.address, expected);
        assert_eq!(eth.address_format, "EIP-55");
    }
}

#[tokio::test]
async fn announced_sessions_are_discoverable_by_late_joiners() {
    let signal_hub = MemorySignalHub::new();
    let mesh_hub = MemoryMeshHub::new();

    let mut creator = spawn_node(&signal_hub, &mesh_hub, "creator", CurveType::Ed25519).await;
    creator
        .cmd
        .send(InternalCommand::ProposeSession {
            session_id: "open-house".into(),
            total: 2,
            threshold: 2,
            participants: vec!["creator".into(), "visitor".into()],
        })
        .unwrap();
    expect_status(&mut creator, 10, "proposed", |u| {
        matches!(u, StatusUpdate::SessionProposed { .. })
    })
    .await;

    // A device that connects later still discovers the announcement.
    let mut visitor = spawn_node(&signal_hub, &mesh_hub, "visitor", CurveType::Ed25519).await;
    visitor
        .cmd
        .send(InternalCommand::SendToServer(
            cli_node::protocal::signal::ClientMsg::RequestActiveSessions,
        ))
        .unwrap();
    let update = expect_status(&mut visitor, 10, "discovery", |u| {
        matches!(u, StatusUpdate::SessionsDiscovered(found) if !found.is_empty())
    })
    .await;
    match update {
        StatusUpdate::SessionsDiscovered(found) => {
            let ann = found.iter().find(|a| a.session_id == "open-house").unwrap();
            assert_eq!(ann.creator_device, "creator");
            assert_eq!(ann.threshold, 2);
            assert_eq!(ann.total, 2);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn rejected_session_fails_for_the_proposer() {
    let signal_hub = MemorySignalHub::new();
    let mesh_hub = MemoryMeshHub::new();

    let mut a = spawn_node(&signal_hub, &mesh_hub, "pa", CurveType::Ed25519).await;
    let mut b = spawn_node(&signal_hub, &mesh_hub, "pb", CurveType::Ed25519).await;

    a.cmd
        .send(InternalCommand::ProposeSession {
            session_id: "doomed".into(),
            total: 2,
            threshold: 2,
            participants: vec!["pa".into(), "pb".into()],
        })
        .unwrap();
    expect_status(&mut b, 10, "invite", |u| {
        matches!(u, StatusUpdate::SessionInvite { .. })
    })
    .await;

    // pb declines by responding accepted=false through the same relay path.
    let response = cli_node::protocal::signal::SessionResponse {
        session_id: "doomed".into(),
        from_device_id: "pb".into(),
        accepted: false,
        wallet_status: None,
        reason: Some("user declined".into()),
    };
    b.cmd
        .send(InternalCommand::SendToServer(
            cli_node::protocal::signal::ClientMsg::Relay {
                to: "pa".into(),
                data: serde_json::to_value(
                    cli_node::protocal::signal::WebSocketMessage::SessionResponse(response),
                )
                .unwrap(),
            },
        ))
        .unwrap();

    expect_status(&mut a, 10, "session failed", |u| {
        matches!(u, StatusUpdate::SessionFailed { session_id, .. } if session_id == "doomed")
    })
    .await;
}
