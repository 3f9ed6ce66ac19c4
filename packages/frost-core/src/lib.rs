// Core FROST implementation shared between the CLI node and future embeddings

pub mod dkg;
pub mod errors;
pub mod keystore;
pub mod signing;

// Re-export main types
pub use dkg::{DkgEngine, DkgState, identifier_from_index};
pub use errors::{FrostError, Result};
pub use keystore::KeystoreData;
pub use keystore::encryption::KeyDerivation;
pub use signing::{SigningEngine, SigningPhase};

// Re-export the ciphersuites the wallet supports so downstream crates don't
// need to depend on the curve crates directly for the common case.
pub use frost_ed25519::Ed25519Sha512;
pub use frost_secp256k1::Secp256K1Sha256;
