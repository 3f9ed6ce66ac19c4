//! CLI <-> extension keystore interop: a wallet file exported by the CLI is
//! decrypted by "the other side" using only the file's algorithm header, and
//! the imported share co-signs with a live CLI share.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use cli_node::keystore::{Keystore, WalletMetadata};
use frost_mpc_core::keystore::encryption::{KeyDerivation, decrypt_data};
use frost_mpc_core::{DkgEngine, DkgState, KeystoreData, Secp256K1Sha256, SigningEngine};
use std::collections::BTreeMap;
use tempfile::TempDir;

/// In-process 2-of-2 DKG, returning both completed engines.
fn run_dkg_pair() -> Vec<DkgEngine<Secp256K1Sha256>> {
    let mut engines: Vec<DkgEngine<Secp256K1Sha256>> = (1..=2)
        .map(|i| DkgEngine::new(i, 2, 2).unwrap())
        .collect();

    let round1: Vec<Vec<u8>> = engines
        .iter_mut()
        .map(|e| e.generate_round1().unwrap())
        .collect();
    for engine in engines.iter_mut() {
        for (i, bytes) in round1.iter().enumerate() {
            engine.add_round1_package(i as u16 + 1, bytes).unwrap();
        }
    }

    let round2: Vec<BTreeMap<u16, Vec<u8>>> = engines
        .iter_mut()
        .map(|e| e.generate_round2().unwrap())
        .collect();
    for recipient in 1u16..=2 {
        for sender in 1u16..=2 {
            if sender == recipient {
                continue;
            }
            let bytes = &round2[(sender - 1) as usize][&recipient];
            engines[(recipient - 1) as usize]
                .add_round2_package(sender, bytes)
                .unwrap();
        }
    }

    let keys: Vec<Vec<u8>> = engines.iter_mut().map(|e| e.finalize().unwrap()).collect();
    assert_eq!(keys[0], keys[1]);
    engines
}

/// Two-party signing across one live engine and one rebuilt from an imported
/// wallet file.
fn co_sign(
    live: &DkgEngine<Secp256K1Sha256>,
    imported: &DkgEngine<Secp256K1Sha256>,
    message: &[u8],
) -> Vec<u8> {
    let mut signer_live = SigningEngine::new(
        "interop",
        message.to_vec(),
        live.my_index(),
        &[1, 2],
        live.key_package().unwrap().clone(),
        live.public_key_package().unwrap().clone(),
    )
    .unwrap();
    let mut signer_imported = SigningEngine::new(
        "interop",
        message.to_vec(),
        imported.my_index(),
        &[1, 2],
        imported.key_package().unwrap().clone(),
        imported.public_key_package().unwrap().clone(),
    )
    .unwrap();

    let c1 = signer_live.generate_commitment().unwrap();
    let c2 = signer_imported.generate_commitment().unwrap();
    for (signer, own, other, other_index) in [
        (&mut signer_live, &c1, &c2, 2u16),
        (&mut signer_imported, &c2, &c1, 1u16),
    ] {
        signer.add_commitment(3 - other_index, own).unwrap();
        signer.add_commitment(other_index, other).unwrap();
    }

    let s1 = signer_live.generate_signature_share().unwrap();
    let s2 = signer_imported.generate_signature_share().unwrap();
    for (signer, own, other, other_index) in [
        (&mut signer_live, &s1, &s2, 2u16),
        (&mut signer_imported, &s2, &s1, 1u16),
    ] {
        signer.add_signature_share(3 - other_index, own).unwrap();
        signer.add_signature_share(other_index, other).unwrap();
    }

    let sig_live = signer_live.aggregate().unwrap();
    let sig_imported = signer_imported.aggregate().unwrap();
    assert_eq!(sig_live, sig_imported);
    sig_live
}

#[tokio::test]
async fn argon2id_wallet_file_round_trips_and_co_signs() {
    let engines = run_dkg_pair();
    let group_key = engines[1].group_public_key().unwrap();

    // The CLI side persists participant 2's share under Argon2id.
    let keystore_data = engines[1].export_keystore("secp256k1").unwrap();
    let share_bytes = serde_json::to_vec(&keystore_data).unwrap();

    let dir = TempDir::new().unwrap();
    let mut keystore = Keystore::new(dir.path(), "cli-device").unwrap();
    keystore.unlock("interop-password").unwrap();
    let metadata = WalletMetadata::new(
        "vault".into(),
        "cli-device".into(),
        "cli-device".into(),
        "secp256k1".into(),
        2,
        2,
        2,
        hex::encode(&group_key),
    );
    keystore.add_wallet(metadata, &share_bytes).unwrap();
    let exported = keystore.export_wallet("vault").unwrap();
    assert_eq!(exported.version, "2.0");
    assert_eq!(exported.algorithm, "AES-256-GCM-Argon2id");

    // "Extension" side: nothing but the wallet file and the password. The
    // algorithm header picks the KDF; the blob is salt||nonce||ct||tag.
    let blob = BASE64.decode(&exported.data).unwrap();
    let method = KeyDerivation::from_algorithm(&exported.algorithm).unwrap();
    let plaintext = decrypt_data(&blob, "interop-password", method).unwrap();
    let recovered: KeystoreData = serde_json::from_slice(&plaintext).unwrap();
    assert_eq!(recovered.participant_index, 2);
    assert_eq!(recovered.curve, "secp256k1");

    let imported =
        DkgEngine::<Secp256K1Sha256>::from_keystore(&recovered, Some(group_key.as_slice())).unwrap();
    assert_eq!(*imported.state(), DkgState::KeystoreImported);

    // The imported share signs jointly with the live participant 1 share.
    let signature = co_sign(&engines[0], &imported, b"interop signing message");
    assert!(!signature.is_empty());

    // And the wrong password must fail loudly, not corrupt.
    assert!(decrypt_data(&blob, "wrong-password", method).is_err());
}
