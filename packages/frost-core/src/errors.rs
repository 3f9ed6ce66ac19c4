use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrostError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Duplicate package from participant {sender} in round {round}")]
    DuplicatePackage { round: u8, sender: u16 },

    #[error("Invalid package: {0}")]
    InvalidPackage(String),

    #[error("Verification failure: {0}")]
    VerificationFailure(String),

    #[error("Aggregated signature failed to verify under the group key")]
    AggregationFailure,

    #[error("DKG error: {0}")]
    DkgError(String),

    #[error("Signing error: {0}")]
    SigningError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Keystore error: {0}")]
    KeystoreError(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Encryption error: {0}")]
    EncryptionError(String),

    #[error("Decryption failed (wrong password or corrupted data)")]
    DecryptionFailed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FrostError>;
