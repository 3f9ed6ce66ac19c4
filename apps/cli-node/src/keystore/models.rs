//! Data models for the keystore module.

/// Information about a blockchain supported by a wallet
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockchainInfo {
    /// Blockchain identifier (e.g., "ethereum", "bsc", "polygon", "solana")
    pub blockchain: String,

    /// Network type (e.g., "mainnet", "testnet", "devnet")
    pub network: String,

    /// Chain ID for EVM-compatible chains
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,

    /// Address on this blockchain
    pub address: String,

    /// Address format/encoding (e.g., "EIP-55", "base58")
    pub address_format: String,

    /// Whether this blockchain is actively used
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Wallet metadata embedded in every wallet file. All blockchain addresses
/// are derivable from `group_public_key` + `curve_type`; the `blockchains`
/// list caches the derived values for display.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WalletMetadata {
    /// Wallet identifier (the session name from DKG)
    pub wallet_id: String,

    /// Device ID that owns this key share
    pub device_id: String,

    /// User-friendly device name
    pub device_name: String,

    /// Type of cryptographic curve used ("secp256k1" or "ed25519")
    pub curve_type: String,

    /// Blockchains enabled for this wallet
    #[serde(default)]
    pub blockchains: Vec<BlockchainInfo>,

    /// Minimum number of participants required to sign (K in K-of-N)
    pub threshold: u16,

    /// Total number of participants (N in K-of-N)
    pub total_participants: u16,

    /// This device's participant index (1-based). Immutable post-creation.
    pub participant_index: u16,

    /// Serialized FROST group public key, hex (source of truth for addresses)
    pub group_public_key: String,

    /// RFC 3339 timestamp when created
    pub created_at: String,

    /// RFC 3339 timestamp when last modified
    pub last_modified: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl WalletMetadata {
    pub fn new(
        wallet_id: String,
        device_id: String,
        device_name: String,
        curve_type: String,
        threshold: u16,
        total_participants: u16,
        participant_index: u16,
        group_public_key: String,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            wallet_id,
            device_id,
            device_name,
            curve_type,
            blockchains: Vec::new(),
            threshold,
            total_participants,
            participant_index,
            group_public_key,
            created_at: now.clone(),
            last_modified: now,
            tags: Vec::new(),
            description: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_modified = chrono::Utc::now().to_rfc3339();
    }
}

/// Self-contained wallet file format (v2.0), shared bit-exact between the
/// CLI node and the browser extension.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WalletFile {
    /// Format version
    pub version: String,

    /// Whether the data is encrypted
    pub encrypted: bool,

    /// Encryption algorithm used ("AES-256-GCM-Argon2id" or
    /// "AES-256-GCM-PBKDF2"); authoritative for decryption.
    pub algorithm: String,

    /// Base64 of `salt(16) || nonce(12) || ciphertext || tag(16)`
    pub data: String,

    /// Embedded metadata
    pub metadata: WalletMetadata,
}

pub const WALLET_FILE_VERSION: &str = "2.0";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wallet_file_serializes_the_shared_layout() {
        let metadata = WalletMetadata::new(
            "vault".into(),
            "node-a".into(),
            "Node A".into(),
            "secp256k1".into(),
            2,
            3,
            1,
            "02ff".into(),
        );
        let file = WalletFile {
            version: WALLET_FILE_VERSION.into(),
            encrypted: true,
            algorithm: "AES-256-GCM-Argon2id".into(),
            data: "AAAA".into(),
            metadata,
        };
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["version"], "2.0");
        assert_eq!(json["encrypted"], true);
        assert_eq!(json["metadata"]["wallet_id"], "vault");
        assert_eq!(json["metadata"]["participant_index"], 1);
        assert_eq!(json["metadata"]["total_participants"], 3);
        // chain_id is omitted when absent, not null
        assert!(json["metadata"]["blockchains"].as_array().unwrap().is_empty());

        let back: WalletFile = serde_json::from_value(json).unwrap();
        assert_eq!(back.metadata, file.metadata);
    }
}
