//! Solana blockchain handler implementation

use super::{BlockchainError, BlockchainHandler, Result, SignatureData};

pub struct SolanaHandler {
    // Can add configuration here if needed
}

impl SolanaHandler {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for SolanaHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Derives the Solana address from a serialized Ed25519 group public key.
///
/// The address is the base58 encoding of the canonical 32-byte point, with
/// no checksum or prefix.
pub fn derive_solana_address(group_public_key: &[u8]) -> Result<String> {
    if group_public_key.len() != 32 {
        return Err(BlockchainError::InvalidPublicKey(format!(
            "expected 32-byte ed25519 point, got {} bytes",
            group_public_key.len()
        )));
    }
    Ok(bs58::encode(group_public_key).into_string())
}

impl BlockchainHandler for SolanaHandler {
    fn blockchain_id(&self) -> &str {
        "solana"
    }

    fn curve_type(&self) -> &str {
        "ed25519"
    }

    fn address_format(&self) -> &str {
        "base58"
    }

    fn derive_address(&self, group_public_key: &[u8]) -> Result<String> {
        derive_solana_address(group_public_key)
    }

    fn serialize_signature(&self, signature_bytes: &[u8]) -> Result<SignatureData> {
        if signature_bytes.len() != 64 {
            return Err(BlockchainError::SignatureError(format!(
                "expected 64-byte ed25519 signature, got {} bytes",
                signature_bytes.len()
            )));
        }
        Ok(SignatureData {
            signature: bs58::encode(signature_bytes).into_string(),
            recovery_id: None,
            metadata: serde_json::json!({
                "scheme": "ed25519",
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solana_address_is_base58_of_point() {
        let key = [7u8; 32];
        let addr = derive_solana_address(&key).unwrap();
        let decoded = bs58::decode(&addr).into_vec().unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(derive_solana_address(&[0u8; 31]).is_err());
        assert!(derive_solana_address(&[0u8; 33]).is_err());
    }

    #[test]
    fn signature_serialization_checks_length() {
        let handler = SolanaHandler::new();
        assert!(handler.serialize_signature(&[0u8; 64]).is_ok());
        assert!(handler.serialize_signature(&[0u8; 63]).is_err());
    }
}
