//! Keystore command handlers: unlock, wallet persistence, import/export.

use super::emit;
use crate::errors::{AppError, Result};
use crate::keystore::{WalletFile, WalletMetadata};
use crate::utils::state::{AppState, InternalCommand, StatusUpdate};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::info;

/// Unlocks the keystore; on success, re-checks whether a signing session was
/// waiting on the share.
pub async fn handle_unlock_keystore(
    state: Arc<Mutex<AppState>>,
    cmd_tx: &mpsc::UnboundedSender<InternalCommand>,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
    password: String,
) -> Result<()> {
    let guard = state.lock().await;
    let Some(keystore) = guard.keystore.clone() else {
        return Err(AppError::Keystore(crate::keystore::KeystoreError::General(
            "no keystore configured".into(),
        )));
    };
    drop(guard);

    keystore.lock().await.unlock(&password)?;
    emit(status_tx, StatusUpdate::Log("keystore unlocked".into()));
    let _ = cmd_tx.send(InternalCommand::CheckAndTriggerSigning);
    Ok(())
}

/// Persists the completed DKG run as an encrypted wallet named after the
/// session.
pub async fn handle_create_wallet(
    state: Arc<Mutex<AppState>>,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
    password: String,
) -> Result<()> {
    let mut guard = state.lock().await;

    let Some(session) = guard.controller.active().cloned() else {
        return Err(AppError::InvalidParams("no completed session to save".into()));
    };
    let Some(router) = guard.router.as_ref() else {
        return Err(AppError::InvalidParams("no completed DKG to save".into()));
    };
    let Some(dkg) = router.dkg.as_ref() else {
        return Err(AppError::InvalidParams("no completed DKG to save".into()));
    };
    if !matches!(
        dkg.state(),
        frost_mpc_core::DkgState::Complete | frost_mpc_core::DkgState::KeystoreImported
    ) {
        return Err(AppError::InvalidParams(format!(
            "DKG not complete: {:?}",
            dkg.state()
        )));
    }

    let mut keystore_data = dkg.export_keystore()?;
    keystore_data.wallet_id = Some(session.session_id.clone());
    keystore_data.device_id = Some(guard.device_id.clone());
    keystore_data.session_id = Some(session.session_id.clone());
    keystore_data.timestamp = Some(chrono::Utc::now().to_rfc3339());
    let share_bytes = serde_json::to_vec(&keystore_data)
        .map_err(|e| AppError::Protocol(format!("share serialization failed: {e}")))?;

    let group_public_key = guard
        .group_public_key
        .clone()
        .ok_or_else(|| AppError::InvalidParams("no group public key".into()))?;
    let my_index = router.my_index();

    let mut metadata = WalletMetadata::new(
        session.session_id.clone(),
        guard.device_id.clone(),
        guard.device_id.clone(),
        session.curve_type.clone(),
        session.threshold,
        session.total,
        my_index,
        group_public_key,
    );
    metadata.blockchains = guard.blockchain_addresses.clone();

    let Some(keystore) = guard.keystore.clone() else {
        return Err(AppError::Keystore(crate::keystore::KeystoreError::General(
            "no keystore configured".into(),
        )));
    };
    drop(guard);

    let mut keystore_guard = keystore.lock().await;
    if !keystore_guard.is_unlocked() {
        keystore_guard.unlock(&password)?;
    }
    let wallet_id = keystore_guard.add_wallet(metadata, &share_bytes)?;
    drop(keystore_guard);

    let mut guard = state.lock().await;
    guard.current_wallet_id = Some(wallet_id.clone());
    drop(guard);

    info!(%wallet_id, "wallet saved");
    emit(status_tx, StatusUpdate::WalletSaved { wallet_id });
    Ok(())
}

/// Lists wallets to the status stream.
pub async fn handle_list_wallets(
    state: Arc<Mutex<AppState>>,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
) -> Result<()> {
    let guard = state.lock().await;
    let Some(keystore) = guard.keystore.clone() else {
        emit(status_tx, StatusUpdate::WalletList(Vec::new()));
        return Ok(());
    };
    drop(guard);

    let keystore_guard = keystore.lock().await;
    let wallets = keystore_guard
        .list_wallets()
        .into_iter()
        .map(|w| {
            format!(
                "{} ({} {}-of-{}, index {})",
                w.wallet_id, w.curve_type, w.threshold, w.total_participants, w.participant_index
            )
        })
        .collect();
    emit(status_tx, StatusUpdate::WalletList(wallets));
    Ok(())
}

/// Writes a wallet file to the given path for sharing or backup.
pub async fn handle_export_wallet(
    state: Arc<Mutex<AppState>>,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
    wallet_id: String,
    path: String,
) -> Result<()> {
    let guard = state.lock().await;
    let Some(keystore) = guard.keystore.clone() else {
        return Err(AppError::Keystore(crate::keystore::KeystoreError::General(
            "no keystore configured".into(),
        )));
    };
    drop(guard);

    let wallet_file = keystore.lock().await.export_wallet(&wallet_id)?;
    let json = serde_json::to_string_pretty(&wallet_file)
        .map_err(|e| AppError::Keystore(crate::keystore::KeystoreError::Serde(e)))?;
    std::fs::write(Path::new(&path), json)
        .map_err(|e| AppError::Keystore(crate::keystore::KeystoreError::Io(e)))?;

    info!(%wallet_id, %path, "wallet exported");
    emit(
        status_tx,
        StatusUpdate::Log(format!("exported {wallet_id} to {path}")),
    );
    Ok(())
}

/// Imports a wallet file from disk into the keystore.
pub async fn handle_import_wallet(
    state: Arc<Mutex<AppState>>,
    status_tx: &mpsc::UnboundedSender<StatusUpdate>,
    path: String,
    password: String,
) -> Result<()> {
    let guard = state.lock().await;
    let Some(keystore) = guard.keystore.clone() else {
        return Err(AppError::Keystore(crate::keystore::KeystoreError::General(
            "no keystore configured".into(),
        )));
    };
    drop(guard);

    let json = std::fs::read_to_string(Path::new(&path))
        .map_err(|e| AppError::Keystore(crate::keystore::KeystoreError::Io(e)))?;
    let wallet_file: WalletFile = serde_json::from_str(&json)
        .map_err(|e| AppError::Keystore(crate::keystore::KeystoreError::Serde(e)))?;

    let wallet_id = keystore.lock().await.import_wallet(wallet_file, &password)?;
    info!(%wallet_id, %path, "wallet imported");
    emit(status_tx, StatusUpdate::WalletSaved { wallet_id });
    Ok(())
}
