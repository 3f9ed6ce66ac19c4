//! Keystore data codec shared between the CLI node and the browser extension.
//!
//! `KeystoreData` is the plaintext JSON that both implementations agree on;
//! the `encryption` module wraps it in AES-256-GCM with a password-derived
//! key. The encrypted blob layout is fixed across implementations:
//!
//! ```text
//! salt(16) || nonce(12) || ciphertext || tag(16)
//! ```
//!
//! with the GCM tag appended to the ciphertext by the AEAD. Which KDF
//! produced the key is recorded out-of-band in the wallet file's `algorithm`
//! header, and that header is authoritative on read.

use crate::errors::{FrostError, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use frost_core::Ciphersuite;
use frost_core::keys::{KeyPackage, PublicKeyPackage};
use serde::{Deserialize, Serialize};

/// Keystore data structure that's compatible between CLI and browser extension
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoreData {
    // Core data for FROST protocol
    pub key_package: String,        // Base64 encoded
    pub public_key_package: String, // Base64 encoded
    pub min_signers: u16,
    pub max_signers: u16,
    pub participant_index: u16,
    pub participant_indices: Vec<u16>,
    pub curve: String, // "secp256k1" or "ed25519"

    // Additional fields for UI/management
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl KeystoreData {
    /// Export key material in a format compatible with both CLI and browser
    pub fn export<C: Ciphersuite>(
        key_package: &KeyPackage<C>,
        public_key_package: &PublicKeyPackage<C>,
        min_signers: u16,
        max_signers: u16,
        participant_index: u16,
        participant_indices: Vec<u16>,
        curve: &str,
    ) -> Result<Self> {
        let key_package_bytes = serde_json::to_vec(key_package)
            .map_err(|e| FrostError::SerializationError(e.to_string()))?;
        let public_key_package_bytes = serde_json::to_vec(public_key_package)
            .map_err(|e| FrostError::SerializationError(e.to_string()))?;

        Ok(KeystoreData {
            key_package: BASE64.encode(&key_package_bytes),
            public_key_package: BASE64.encode(&public_key_package_bytes),
            min_signers,
            max_signers,
            participant_index,
            participant_indices,
            curve: curve.to_string(),
            wallet_id: None,
            device_id: None,
            device_name: None,
            session_id: None,
            timestamp: None,
        })
    }

    /// Import keystore data and deserialize the packages
    pub fn import<C: Ciphersuite>(&self) -> Result<(KeyPackage<C>, PublicKeyPackage<C>)> {
        let key_package_bytes = BASE64.decode(&self.key_package).map_err(|e| {
            FrostError::SerializationError(format!("Failed to decode key package: {}", e))
        })?;
        let public_key_package_bytes = BASE64.decode(&self.public_key_package).map_err(|e| {
            FrostError::SerializationError(format!("Failed to decode public key package: {}", e))
        })?;

        let key_package: KeyPackage<C> = serde_json::from_slice(&key_package_bytes)
            .map_err(|e| {
                FrostError::SerializationError(format!("Failed to deserialize key package: {}", e))
            })?;
        let public_key_package: PublicKeyPackage<C> =
            serde_json::from_slice(&public_key_package_bytes).map_err(|e| {
                FrostError::SerializationError(format!(
                    "Failed to deserialize public key package: {}",
                    e
                ))
            })?;

        Ok((key_package, public_key_package))
    }
}

/// Encryption module for keystore files
pub mod encryption {
    use super::*;
    use aes_gcm::{
        Aes256Gcm, Key, Nonce,
        aead::{Aead, KeyInit, OsRng},
    };
    use argon2::Argon2;
    use argon2::password_hash::rand_core::RngCore;
    use pbkdf2::pbkdf2_hmac;
    use sha2::Sha256;

    const SALT_LEN: usize = 16;
    const NONCE_LEN: usize = 12;
    const TAG_LEN: usize = 16;

    /// PBKDF2 iteration count for the canonical interop path. The browser
    /// extension's own fallback format uses 100 000 and is not written here.
    const PBKDF2_ROUNDS: u32 = 600_000;

    /// Key derivation function used to turn the password into an AES key.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum KeyDerivation {
        /// Argon2id with the default parameters (v19, m=19456, t=2, p=1).
        /// Canonical for CLI-written files; mandatory on read.
        Argon2id,
        /// PBKDF2-HMAC-SHA256, 600 000 iterations. Browser interop path.
        Pbkdf2,
    }

    impl KeyDerivation {
        /// The wallet-file `algorithm` header value for this KDF.
        pub fn algorithm_string(&self) -> &'static str {
            match self {
                KeyDerivation::Argon2id => "AES-256-GCM-Argon2id",
                KeyDerivation::Pbkdf2 => "AES-256-GCM-PBKDF2",
            }
        }

        /// Resolves the KDF from a wallet-file `algorithm` header. The header
        /// is authoritative; unknown values are an error, never a guess.
        pub fn from_algorithm(algorithm: &str) -> Result<Self> {
            match algorithm {
                "AES-256-GCM-Argon2id" => Ok(KeyDerivation::Argon2id),
                "AES-256-GCM-PBKDF2" | "AES-256-GCM" => Ok(KeyDerivation::Pbkdf2),
                other => Err(FrostError::EncryptionError(format!(
                    "unknown encryption algorithm: {}",
                    other
                ))),
            }
        }
    }

    fn derive_key(password: &str, salt: &[u8], method: KeyDerivation) -> Result<[u8; 32]> {
        let mut key = [0u8; 32];
        match method {
            KeyDerivation::Argon2id => {
                Argon2::default()
                    .hash_password_into(password.as_bytes(), salt, &mut key)
                    .map_err(|e| FrostError::EncryptionError(e.to_string()))?;
            }
            KeyDerivation::Pbkdf2 => {
                pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
            }
        }
        Ok(key)
    }

    /// Encrypt data with a fresh salt and nonce using the given KDF.
    pub fn encrypt_data(data: &[u8], password: &str, method: KeyDerivation) -> Result<Vec<u8>> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let key_bytes = derive_key(password, &salt, method)?;
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let cipher = Aes256Gcm::new(key);
        let ciphertext = cipher
            .encrypt(nonce, data)
            .map_err(|e| FrostError::EncryptionError(e.to_string()))?;

        // salt || nonce || ciphertext (tag already appended by the AEAD)
        let mut result = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&salt);
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt a `salt || nonce || ciphertext || tag` blob.
    pub fn decrypt_data(blob: &[u8], password: &str, method: KeyDerivation) -> Result<Vec<u8>> {
        if blob.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
            return Err(FrostError::EncryptionError(
                "invalid encrypted data length".into(),
            ));
        }

        let salt = &blob[..SALT_LEN];
        let nonce = Nonce::from_slice(&blob[SALT_LEN..SALT_LEN + NONCE_LEN]);
        let ciphertext = &blob[SALT_LEN + NONCE_LEN..];

        let key_bytes = derive_key(password, salt, method)?;
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);

        let cipher = Aes256Gcm::new(key);
        // A GCM tag mismatch is indistinguishable from a wrong password, and
        // both must surface the same way: no silent corruption, no retry.
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| FrostError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::encryption::{KeyDerivation, decrypt_data, encrypt_data};
    use super::*;
    use crate::dkg::tests::run_dkg;
    use frost_ed25519::Ed25519Sha512;

    #[test]
    fn encrypt_decrypt_round_trip_argon2id() {
        let plaintext = b"threshold key share material";
        let blob = encrypt_data(plaintext, "correct horse", KeyDerivation::Argon2id).unwrap();
        assert!(blob.len() >= 16 + 12 + plaintext.len() + 16);
        let decrypted = decrypt_data(&blob, "correct horse", KeyDerivation::Argon2id).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn encrypt_decrypt_round_trip_pbkdf2() {
        let plaintext = b"browser-compatible share";
        let blob = encrypt_data(plaintext, "hunter2", KeyDerivation::Pbkdf2).unwrap();
        let decrypted = decrypt_data(&blob, "hunter2", KeyDerivation::Pbkdf2).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_password_is_decryption_failed() {
        let blob = encrypt_data(b"secret", "right", KeyDerivation::Argon2id).unwrap();
        let err = decrypt_data(&blob, "wrong", KeyDerivation::Argon2id).unwrap_err();
        assert!(matches!(err, FrostError::DecryptionFailed));
    }

    #[test]
    fn tampered_ciphertext_is_decryption_failed() {
        let mut blob = encrypt_data(b"secret", "pw", KeyDerivation::Pbkdf2).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(
            decrypt_data(&blob, "pw", KeyDerivation::Pbkdf2),
            Err(FrostError::DecryptionFailed)
        ));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        assert!(decrypt_data(&[0u8; 20], "pw", KeyDerivation::Argon2id).is_err());
    }

    #[test]
    fn algorithm_tags_round_trip() {
        for method in [KeyDerivation::Argon2id, KeyDerivation::Pbkdf2] {
            let tag = method.algorithm_string();
            assert_eq!(KeyDerivation::from_algorithm(tag).unwrap(), method);
        }
        assert!(KeyDerivation::from_algorithm("ROT13").is_err());
    }

    #[test]
    fn keystore_data_round_trips_packages() {
        let engines = run_dkg::<Ed25519Sha512>(2, 2);
        let engine = &engines[0];
        let data = KeystoreData::export::<Ed25519Sha512>(
            engine.key_package().unwrap(),
            engine.public_key_package().unwrap(),
            2,
            2,
            1,
            vec![1, 2],
            "ed25519",
        )
        .unwrap();
        assert_eq!(data.curve, "ed25519");

        let (key_package, public_key_package) = data.import::<Ed25519Sha512>().unwrap();
        assert_eq!(key_package.identifier(), engine.key_package().unwrap().identifier());
        assert_eq!(
            public_key_package.verifying_key().serialize().unwrap(),
            engine.group_public_key().unwrap()
        );
    }
}
