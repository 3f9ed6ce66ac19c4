//! The peer-to-peer protocol envelope.
//!
//! Every application message between peers travels as one JSON envelope over
//! the data channel. Protocol bytes are hex-encoded on the wire; the FROST
//! engines never see hex.

use crate::errors::{AppError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    DkgRound1,
    DkgRound2,
    SignCommitment,
    SignShare,
    ChannelOpen,
    MeshReady,
}

impl EnvelopeType {
    pub fn is_protocol(&self) -> bool {
        !matches!(self, EnvelopeType::ChannelOpen | EnvelopeType::MeshReady)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolEnvelope {
    #[serde(rename = "type")]
    pub msg_type: EnvelopeType,
    pub session_id: String,
    pub sender_index: u16,
    pub recipient_index: Option<u16>,
    pub round: u8,
    pub data: String, // hex
}

impl ProtocolEnvelope {
    pub fn dkg_round1(session_id: &str, sender_index: u16, package: &[u8]) -> Self {
        Self {
            msg_type: EnvelopeType::DkgRound1,
            session_id: session_id.to_string(),
            sender_index,
            recipient_index: None,
            round: 1,
            data: hex::encode(package),
        }
    }

    pub fn dkg_round2(
        session_id: &str,
        sender_index: u16,
        recipient_index: u16,
        package: &[u8],
    ) -> Self {
        Self {
            msg_type: EnvelopeType::DkgRound2,
            session_id: session_id.to_string(),
            sender_index,
            recipient_index: Some(recipient_index),
            round: 2,
            data: hex::encode(package),
        }
    }

    pub fn sign_commitment(session_id: &str, sender_index: u16, commitment: &[u8]) -> Self {
        Self {
            msg_type: EnvelopeType::SignCommitment,
            session_id: session_id.to_string(),
            sender_index,
            recipient_index: None,
            round: 1,
            data: hex::encode(commitment),
        }
    }

    pub fn sign_share(session_id: &str, sender_index: u16, share: &[u8]) -> Self {
        Self {
            msg_type: EnvelopeType::SignShare,
            session_id: session_id.to_string(),
            sender_index,
            recipient_index: None,
            round: 2,
            data: hex::encode(share),
        }
    }

    pub fn channel_open(session_id: &str, sender_index: u16) -> Self {
        Self {
            msg_type: EnvelopeType::ChannelOpen,
            session_id: session_id.to_string(),
            sender_index,
            recipient_index: None,
            round: 0,
            data: String::new(),
        }
    }

    pub fn mesh_ready(session_id: &str, sender_index: u16) -> Self {
        Self {
            msg_type: EnvelopeType::MeshReady,
            session_id: session_id.to_string(),
            sender_index,
            recipient_index: None,
            round: 0,
            data: String::new(),
        }
    }

    /// Decodes the hex payload back into protocol bytes.
    pub fn payload(&self) -> Result<Vec<u8>> {
        hex::decode(&self.data)
            .map_err(|e| AppError::Protocol(format!("invalid hex payload: {}", e)))
    }

    pub fn to_wire(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| AppError::Protocol(e.to_string()))
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| AppError::Protocol(e.to_string()))
    }
}
