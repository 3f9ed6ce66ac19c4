//! Application-level error type and exit-code mapping.

use crate::keystore::KeystoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("No wallet named '{0}' in the keystore")]
    WalletMissing(String),

    #[error("Wallet mismatch on {field}: expected {expected}, got {got}")]
    WalletMismatch {
        field: &'static str,
        expected: String,
        got: String,
    },

    #[error("Keystore is locked")]
    Locked,

    #[error(transparent)]
    Keystore(#[from] KeystoreError),

    #[error(transparent)]
    Frost(#[from] frost_mpc_core::FrostError),

    #[error("Peer lost: {0}")]
    PeerLost(String),

    #[error("Timeout in {phase} (round {round})")]
    RoundTimeout { round: u8, phase: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl AppError {
    /// Process exit code for this failure: 2 usage, 3 keystore, 4 protocol,
    /// 5 peer lost.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::InvalidParams(_) => 2,
            AppError::WalletMissing(_)
            | AppError::WalletMismatch { .. }
            | AppError::Locked
            | AppError::Keystore(_) => 3,
            AppError::PeerLost(_) => 5,
            _ => 4,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
