//! Encrypted wallet storage.
//!
//! One wallet file per key share plus an in-memory index rebuilt from disk at
//! startup. The on-disk format is the shared v2.0 JSON wallet file; see
//! [`models::WalletFile`].

pub mod encryption;
pub mod models;
pub mod storage;

pub use models::{BlockchainInfo, WalletFile, WalletMetadata};
pub use storage::Keystore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Keystore is locked")]
    Locked,

    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    #[error("Wallet already exists: {0}")]
    WalletExists(String),

    #[error("Decryption failed (wrong password or corrupted file)")]
    DecryptionFailed,

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("General error: {0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, KeystoreError>;
