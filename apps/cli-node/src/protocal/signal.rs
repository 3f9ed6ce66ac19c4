use serde::{Deserialize, Serialize};

/// Curve type for cryptographic operations
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CurveType {
    Secp256k1,
    Ed25519,
}

impl CurveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CurveType::Secp256k1 => "secp256k1",
            CurveType::Ed25519 => "ed25519",
        }
    }

    pub fn from_string(value: &str) -> Option<Self> {
        match value {
            "secp256k1" => Some(CurveType::Secp256k1),
            "ed25519" => Some(CurveType::Ed25519),
            _ => None,
        }
    }
}

/// Session type enum - represents different types of sessions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum SessionType {
    /// Distributed Key Generation session
    DKG,
    /// Signing session with existing wallet
    Signing {
        wallet_name: String,
        curve_type: String,
        threshold: u16,
        total: u16,
        group_public_key: String,
        /// Hex-encoded payload to sign (typically a 32-byte tx hash)
        message: String,
        /// Blockchain identifier for signature formatting
        blockchain: String,
        /// Chain ID for EVM chains
        chain_id: Option<u64>,
    },
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Proposed,
    AllAccepted,
    Complete,
    Failed,
}

// --- Session Info Struct ---
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub proposer_id: String,
    pub total: u16,
    pub threshold: u16,
    pub participants: Vec<String>,
    pub accepted_devices: Vec<String>, // List of device_ids that have accepted
    pub session_type: SessionType,
    /// Cryptographic curve type from the proposer
    pub curve_type: String,
    #[serde(default)]
    pub status: SessionStatus,
}

impl SessionInfo {
    /// Participant index of a device: 1-based rank in the ascending
    /// lexicographic order of the participant set. The lowest device id is
    /// index 1. Every node computes the same assignment independently.
    ///
    /// Signing sessions do NOT use this; their indices were fixed at DKG time
    /// and travel in the wallet-status reports.
    pub fn participant_index(&self, device_id: &str) -> Option<u16> {
        let mut sorted = self.participants.clone();
        sorted.sort();
        sorted
            .iter()
            .position(|p| p == device_id)
            .map(|i| i as u16 + 1)
    }

    /// Inverse of [`participant_index`].
    pub fn device_for_index(&self, index: u16) -> Option<&str> {
        let mut sorted: Vec<&String> = self.participants.iter().collect();
        sorted.sort();
        sorted.get((index as usize).checked_sub(1)?).map(|s| s.as_str())
    }

    pub fn is_all_accepted(&self) -> bool {
        self.participants
            .iter()
            .all(|p| self.accepted_devices.contains(p))
    }

    pub fn is_signing(&self) -> bool {
        matches!(self.session_type, SessionType::Signing { .. })
    }
}

/// Session proposal information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProposal {
    pub session_id: String,
    pub total: u16,
    pub threshold: u16,
    pub participants: Vec<String>,
    pub session_type: SessionType,
    /// Device ID of the wallet creator/proposer
    pub proposer_device_id: String,
    /// Cryptographic curve type (secp256k1 or ed25519)
    pub curve_type: String,
}

impl SessionProposal {
    pub fn into_session_info(self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id,
            proposer_id: self.proposer_device_id.clone(),
            total: self.total,
            threshold: self.threshold,
            participants: self.participants,
            accepted_devices: vec![self.proposer_device_id],
            session_type: self.session_type,
            curve_type: self.curve_type,
            status: SessionStatus::Proposed,
        }
    }
}

/// Session response information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub from_device_id: String,
    pub accepted: bool,
    pub wallet_status: Option<WalletStatus>,
    pub reason: Option<String>,
}

/// Wallet status for signing sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletStatus {
    pub has_wallet: bool,
    pub wallet_valid: bool,
    /// This device's participant index from DKG time
    pub identifier: Option<u16>,
    pub error_reason: Option<String>,
}

/// Session announcement for discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAnnouncement {
    pub session_id: String,
    pub session_type: String,
    pub threshold: u16,
    pub total: u16,
    pub curve_type: String,
    pub creator_device: String,
    pub participants_joined: u16,
    pub description: Option<String>,
    pub timestamp: u64,
}

// --- Relay protocol (client <-> signaling server), keyed by device id ---

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    Register {
        device_id: String,
    },
    ListDevices,
    Relay {
        to: String,
        data: serde_json::Value,
    },
    AnnounceSession {
        session_id: String,
        session_type: String,
        total: u16,
        threshold: u16,
        curve_type: String,
    },
    RequestActiveSessions,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    Devices {
        devices: Vec<String>,
    },
    Relay {
        from: String,
        data: serde_json::Value,
    },
    SessionAvailable(SessionAnnouncement),
    SessionStatus {
        session_id: String,
        accepted_devices: Vec<String>,
    },
    Error {
        error: String,
    },
}

// --- Messages relayed device-to-device through the signaling server ---
//
// Transport setup exchanges (offer/answer/ICE for WebRTC) also travel here;
// the core never looks inside them, it hands the payload to the transport.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "websocket_msg_type")]
pub enum WebSocketMessage {
    /// Session proposal message
    SessionProposal(SessionProposal),
    /// Session response message
    SessionResponse(SessionResponse),
    /// Transport-opaque connection setup payload
    TransportSignal { payload: serde_json::Value },
}
