//! Wallet-file encryption.
//!
//! Thin layer over the shared codec in `frost-mpc-core` so the CLI and the
//! extension stay byte-compatible. The wallet file's `algorithm` header picks
//! the KDF on read; writes default to Argon2id.

use super::{KeystoreError, Result};
use frost_mpc_core::FrostError;
pub use frost_mpc_core::KeyDerivation;

/// Encrypts wallet data with the given key-derivation method.
pub fn encrypt_data_with_method(
    data: &[u8],
    password: &str,
    method: KeyDerivation,
) -> Result<Vec<u8>> {
    frost_mpc_core::keystore::encryption::encrypt_data(data, password, method)
        .map_err(|e| KeystoreError::Encryption(e.to_string()))
}

/// Encrypts wallet data with the default (Argon2id) method.
pub fn encrypt_data(data: &[u8], password: &str) -> Result<Vec<u8>> {
    encrypt_data_with_method(data, password, KeyDerivation::Argon2id)
}

/// Decrypts a wallet blob. The `algorithm` string comes from the wallet
/// file header and is authoritative.
pub fn decrypt_data(blob: &[u8], password: &str, algorithm: &str) -> Result<Vec<u8>> {
    let method = KeyDerivation::from_algorithm(algorithm)
        .map_err(|e| KeystoreError::Encryption(e.to_string()))?;
    match frost_mpc_core::keystore::encryption::decrypt_data(blob, password, method) {
        Ok(plaintext) => Ok(plaintext),
        Err(FrostError::DecryptionFailed) => Err(KeystoreError::DecryptionFailed),
        Err(e) => Err(KeystoreError::Encryption(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_algorithm_headers_decrypt() {
        for method in [KeyDerivation::Argon2id, KeyDerivation::Pbkdf2] {
            let blob = encrypt_data_with_method(b"share", "pw", method).unwrap();
            let plain = decrypt_data(&blob, "pw", method.algorithm_string()).unwrap();
            assert_eq!(plain, b"share");
        }
    }

    #[test]
    fn wrong_password_maps_to_decryption_failed() {
        let blob = encrypt_data(b"share", "pw").unwrap();
        let err = decrypt_data(&blob, "nope", KeyDerivation::Argon2id.algorithm_string())
            .unwrap_err();
        assert!(matches!(err, KeystoreError::DecryptionFailed));
    }

    #[test]
    fn unknown_algorithm_is_an_error() {
        assert!(decrypt_data(&[0u8; 64], "pw", "AES-128-CBC").is_err());
    }
}
