//! Ethereum (and EVM-compatible chains) handler implementation

use super::{BlockchainError, BlockchainHandler, Result, SignatureData};
use k256::PublicKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha3::{Digest, Keccak256};

pub struct EthereumHandler {
    // Can add configuration here if needed
}

impl EthereumHandler {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for EthereumHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Derives the Ethereum address from a serialized secp256k1 group public key.
///
/// Accepts SEC1 compressed (33 bytes) or uncompressed (65 bytes) encodings,
/// which is what `VerifyingKey::serialize` produces for the secp256k1
/// ciphersuite. The address is Keccak-256 over the 64-byte X||Y coordinates
/// with the last 20 bytes kept, then EIP-55 checksummed.
pub fn derive_eth_address(group_public_key: &[u8]) -> Result<String> {
    let pubkey = PublicKey::from_sec1_bytes(group_public_key)
        .map_err(|e| BlockchainError::InvalidPublicKey(e.to_string()))?;

    let uncompressed = pubkey.to_encoded_point(false);
    let uncompressed_bytes = uncompressed.as_bytes();

    // Skip the 0x04 prefix for uncompressed keys
    let hash = Keccak256::digest(&uncompressed_bytes[1..]);

    // Take the last 20 bytes as the address
    Ok(to_eip55_checksum(&hash[12..]))
}

/// Applies EIP-55 mixed-case checksum encoding to a 20-byte address.
///
/// A hex digit is uppercased when the corresponding nibble of
/// Keccak-256(lowercase_hex_address) is >= 8.
pub fn to_eip55_checksum(address_bytes: &[u8]) -> String {
    let lower = hex::encode(address_bytes);
    let hash = Keccak256::digest(lower.as_bytes());

    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = if i % 2 == 0 {
            hash[i / 2] >> 4
        } else {
            hash[i / 2] & 0x0f
        };
        if c.is_ascii_hexdigit() && c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

impl BlockchainHandler for EthereumHandler {
    fn blockchain_id(&self) -> &str {
        "ethereum"
    }

    fn curve_type(&self) -> &str {
        "secp256k1"
    }

    fn address_format(&self) -> &str {
        "EIP-55"
    }

    fn derive_address(&self, group_public_key: &[u8]) -> Result<String> {
        derive_eth_address(group_public_key)
    }

    fn serialize_signature(&self, signature_bytes: &[u8]) -> Result<SignatureData> {
        if signature_bytes.len() < 64 {
            return Err(BlockchainError::SignatureError(format!(
                "signature too short: {} bytes",
                signature_bytes.len()
            )));
        }
        Ok(SignatureData {
            signature: format!("0x{}", hex::encode(signature_bytes)),
            recovery_id: None,
            metadata: serde_json::json!({
                "scheme": "schnorr",
                "curve": "secp256k1",
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Checksum vectors from the EIP-55 reference.
    #[test]
    fn eip55_checksum_reference_vectors() {
        let vectors = [
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
            "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359",
            "0xdbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB",
            "0xD1220A0cf47c7B9Be7A2E6BA89F429762e7b9aDb",
        ];
        for expected in vectors {
            let bytes = hex::decode(&expected[2..].to_lowercase()).unwrap();
            assert_eq!(to_eip55_checksum(&bytes), expected);
        }
    }

    #[test]
    fn derive_address_is_deterministic() {
        // Any valid compressed secp256k1 point; the generator works.
        let generator =
            hex::decode("0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798")
                .unwrap();
        let a = derive_eth_address(&generator).unwrap();
        let b = derive_eth_address(&generator).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 42);
        assert!(a.starts_with("0x"));
        // EIP-55 output must round-trip through its own checksum.
        let raw = hex::decode(a[2..].to_lowercase()).unwrap();
        assert_eq!(to_eip55_checksum(&raw), a);
    }

    #[test]
    fn derive_address_rejects_garbage() {
        assert!(derive_eth_address(&[0u8; 33]).is_err());
        assert!(derive_eth_address(b"not a key").is_err());
    }
}
