//! Blockchain abstraction layer for multi-chain support
//!
//! This module provides traits and implementations for blockchain-specific
//! operations like address derivation and signature serialization. Every
//! address is derived from the FROST group public key; nothing here talks to
//! a node or broadcasts transactions.

use thiserror::Error;

/// Blockchain error type
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("General error: {0}")]
    General(String),
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Signature error: {0}")]
    SignatureError(String),
    #[error("Unsupported blockchain: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, BlockchainError>;

pub mod ethereum;
pub mod solana;

/// Trait for blockchain-specific operations
pub trait BlockchainHandler: Send + Sync {
    /// Get the blockchain identifier
    fn blockchain_id(&self) -> &str;

    /// Get the curve type required for this blockchain
    fn curve_type(&self) -> &str;

    /// The address encoding this chain expects ("EIP-55" or "base58")
    fn address_format(&self) -> &str;

    /// Derive the on-chain address from the serialized group public key
    fn derive_address(&self, group_public_key: &[u8]) -> Result<String>;

    /// Serialize a raw FROST signature to blockchain-specific format
    fn serialize_signature(&self, signature_bytes: &[u8]) -> Result<SignatureData>;
}

/// Serialized signature data
#[derive(Debug, Clone)]
pub struct SignatureData {
    /// The signature in blockchain-specific format
    pub signature: String,
    /// Recovery ID for ECDSA (if applicable)
    pub recovery_id: Option<u8>,
    /// Additional signature data
    pub metadata: serde_json::Value,
}

/// Registry of blockchain handlers
pub struct BlockchainRegistry {
    handlers: std::collections::HashMap<String, Box<dyn BlockchainHandler>>,
}

impl BlockchainRegistry {
    /// Create a new registry with default handlers
    pub fn new() -> Self {
        let mut registry = Self {
            handlers: std::collections::HashMap::new(),
        };

        // Register default handlers
        registry.register(Box::new(ethereum::EthereumHandler::new()));
        registry.register(Box::new(solana::SolanaHandler::new()));

        registry
    }

    /// Register a blockchain handler
    pub fn register(&mut self, handler: Box<dyn BlockchainHandler>) {
        self.handlers
            .insert(handler.blockchain_id().to_string(), handler);
    }

    /// Get a handler by blockchain ID
    pub fn get(&self, blockchain: &str) -> Option<&dyn BlockchainHandler> {
        self.handlers.get(blockchain).map(|h| h.as_ref())
    }

    /// Get handler for a chain ID (for EVM chains)
    ///
    /// All EVM chains share the Ethereum handler since the address is the
    /// same key-derived value on every one of them.
    pub fn get_by_chain_id(&self, chain_id: u64) -> Option<&dyn BlockchainHandler> {
        match chain_id {
            1 | 56 | 137 | 42161 | 10 | 43114 => self.get("ethereum"),
            _ => None,
        }
    }

    /// Handlers compatible with a given curve type
    pub fn handlers_for_curve(&self, curve_type: &str) -> Vec<&dyn BlockchainHandler> {
        self.handlers
            .values()
            .filter(|h| h.curve_type() == curve_type)
            .map(|h| h.as_ref())
            .collect()
    }
}

impl Default for BlockchainRegistry {
    fn default() -> Self {
        Self::new()
    }
}
