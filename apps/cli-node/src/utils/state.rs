use crate::keystore::{BlockchainInfo, Keystore};
use crate::protocal::router::ProtocolRouter;
use crate::protocal::signal::{
    ClientMsg, CurveType, SessionAnnouncement, SessionProposal, SessionResponse, SessionType,
};
use crate::session::controller::SessionController;
use crate::session::mesh::MeshController;
use crate::protocal::envelope::ProtocolEnvelope;
use frost_mpc_core::DkgState;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Mesh status tracking enum
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum MeshStatus {
    Incomplete,
    PartiallyReady {
        ready_devices: std::collections::HashSet<String>,
        total_devices: usize,
    },
    Ready,
}

/// Commands flowing into the session task from the UI, the signaling relay,
/// and the transport event pumps.
#[derive(Debug, Clone)]
pub enum InternalCommand {
    // --- Signaling ---
    /// Send a message to the signaling server
    SendToServer(ClientMsg),

    // --- Session lifecycle ---
    /// Propose a new DKG session
    ProposeSession {
        session_id: String,
        total: u16,
        threshold: u16,
        participants: Vec<String>,
    },
    /// Propose a signing session over an existing wallet
    ProposeSigning {
        wallet_name: String,
        message_hex: String,
        signers: Vec<String>,
    },
    /// Accept a session proposal by session ID
    AcceptSessionProposal(String),
    /// Process a session proposal relayed from a device
    ProcessProposal {
        from: String,
        proposal: SessionProposal,
    },
    /// Process a session response from a device
    ProcessResponse {
        from: String,
        response: SessionResponse,
    },

    // --- Mesh / transport ---
    /// Start transport connections with the session participants
    InitiateMeshConnections,
    /// The transport opened a channel to a device
    ReportChannelOpen { device_id: String },
    /// The transport lost the channel to a device
    PeerDisconnected { device_id: String },
    /// An application envelope arrived from a peer
    ProcessEnvelope {
        from: String,
        envelope: crate::protocal::envelope::ProtocolEnvelope,
    },

    // --- Protocol drivers ---
    /// Check if conditions are met to trigger DKG and do so if appropriate
    CheckAndTriggerDkg,
    /// Check if conditions are met to start the signing phases
    CheckAndTriggerSigning,
    /// Fire round/proposal deadline checks
    CheckTimeouts,

    // --- Keystore ---
    /// Unlock the keystore for this process
    UnlockKeystore { password: String },
    /// Persist the completed DKG share as a wallet
    CreateWallet { password: String },
    /// List wallets to the status stream
    ListWallets,
    /// Export a wallet file to a path
    ExportWallet { wallet_id: String, path: String },
    /// Import a wallet file from a path
    ImportWallet { path: String, password: String },

    Shutdown,
}

/// One-way status events for subscribers (CLI printer, tests). Components
/// never call back into each other; they emit these.
#[derive(Debug, Clone)]
pub enum StatusUpdate {
    SessionProposed { session_id: String },
    SessionInvite { session_id: String, from: String },
    SessionAllAccepted { session_id: String },
    SessionFailed { session_id: String, reason: String },
    MeshStatusChanged(MeshStatus),
    DkgStateChanged(DkgState),
    DkgComplete {
        session_id: String,
        group_public_key: String,
        addresses: Vec<BlockchainInfo>,
    },
    WalletSaved { wallet_id: String },
    SigningComplete {
        session_id: String,
        signature: String,
    },
    Devices(Vec<String>),
    SessionsDiscovered(Vec<SessionAnnouncement>),
    WalletList(Vec<String>),
    Log(String),
}

// DkgStateDisplay trait - defines display behavior for DkgState
pub trait DkgStateDisplay {
    fn display_status(&self) -> String;
    fn is_active(&self) -> bool;
    fn is_completed(&self) -> bool;
}

impl DkgStateDisplay for DkgState {
    fn display_status(&self) -> String {
        match self {
            DkgState::Idle => "Idle".to_string(),
            DkgState::Initializing => "Initializing".to_string(),
            DkgState::Round1InProgress => "Round 1 In Progress".to_string(),
            DkgState::Round1Complete => "Round 1 Complete".to_string(),
            DkgState::Round2InProgress => "Round 2 In Progress".to_string(),
            DkgState::Round2Complete => "Round 2 Complete".to_string(),
            DkgState::Finalizing => "Finalizing".to_string(),
            DkgState::Complete => "DKG Complete".to_string(),
            DkgState::KeystoreImported => "Key Share Imported".to_string(),
            DkgState::Failed(reason) => format!("Failed: {}", reason),
        }
    }

    fn is_active(&self) -> bool {
        matches!(
            self,
            DkgState::Initializing
                | DkgState::Round1InProgress
                | DkgState::Round1Complete
                | DkgState::Round2InProgress
                | DkgState::Round2Complete
                | DkgState::Finalizing
        )
    }

    fn is_completed(&self) -> bool {
        matches!(self, DkgState::Complete | DkgState::KeystoreImported)
    }
}

/// Shared application state owned by the session task.
pub struct AppState {
    pub device_id: String,
    pub curve: CurveType,
    pub keystore: Option<Arc<Mutex<Keystore>>>,

    pub controller: SessionController,
    pub mesh: Option<MeshController>,
    pub router: Option<ProtocolRouter>,

    pub mesh_status: MeshStatus,
    pub dkg_state: DkgState,

    /// Signing sessions: DKG-time participant index per device, collected
    /// from wallet-status reports during acceptance.
    pub signer_indices: HashMap<String, u16>,

    /// Peers with a currently open transport link. Session-independent:
    /// links outlive sessions, so a new session must be able to see links
    /// that opened before it formed.
    pub open_channels: HashSet<String>,

    /// Envelopes that arrived before their session's router existed; drained
    /// when the session reaches AllAccepted. Bounded FIFO.
    pub pending_envelopes: Vec<(String, ProtocolEnvelope)>,

    pub devices: Vec<String>,
    pub discovered_sessions: Vec<SessionAnnouncement>,

    pub group_public_key: Option<String>,
    pub blockchain_addresses: Vec<BlockchainInfo>,
    pub current_wallet_id: Option<String>,
    pub last_signature: Option<Vec<u8>>,

    pub proposal_deadline: Option<Instant>,
    pub round_deadline: Option<(Instant, u8, String)>,
}

impl AppState {
    pub fn new(device_id: &str, curve: CurveType) -> Self {
        Self {
            device_id: device_id.to_string(),
            curve,
            keystore: None,
            controller: SessionController::new(device_id),
            mesh: None,
            router: None,
            mesh_status: MeshStatus::Incomplete,
            dkg_state: DkgState::Idle,
            signer_indices: HashMap::new(),
            open_channels: HashSet::new(),
            pending_envelopes: Vec::new(),
            devices: Vec::new(),
            discovered_sessions: Vec::new(),
            group_public_key: None,
            blockchain_addresses: Vec::new(),
            current_wallet_id: None,
            last_signature: None,
            proposal_deadline: None,
            round_deadline: None,
        }
    }

    /// The participant index of a device in the active session.
    ///
    /// DKG sessions derive it from the sorted participant order; signing
    /// sessions use the indices fixed at DKG time and reported during
    /// acceptance.
    pub fn participant_index_of(&self, device_id: &str) -> Option<u16> {
        let session = self.controller.active()?;
        match &session.session_type {
            SessionType::DKG => session.participant_index(device_id),
            SessionType::Signing { .. } => self.signer_indices.get(device_id).copied(),
        }
    }

    pub fn device_for_index(&self, index: u16) -> Option<String> {
        let session = self.controller.active()?;
        match &session.session_type {
            SessionType::DKG => session.device_for_index(index).map(|s| s.to_string()),
            // Only current participants count; the index map can still hold
            // entries from earlier sessions.
            SessionType::Signing { .. } => self
                .signer_indices
                .iter()
                .find(|(device, i)| **i == index && session.participants.contains(*device))
                .map(|(device, _)| device.clone()),
        }
    }

    pub fn my_index(&self) -> Option<u16> {
        self.participant_index_of(self.device_id.as_str())
    }

    /// Queues an envelope that has no router yet (capped FIFO).
    pub fn buffer_pending_envelope(&mut self, from: String, envelope: ProtocolEnvelope) {
        const PENDING_CAP: usize = 256;
        if self.pending_envelopes.len() >= PENDING_CAP {
            self.pending_envelopes.remove(0);
        }
        self.pending_envelopes.push((from, envelope));
    }

    /// Clears everything tied to the current session. Engines are dropped
    /// (zeroizing their secrets) and buffers go with the router. Transport
    /// link state and pre-session envelopes survive; they belong to the
    /// next session.
    pub fn reset_session_state(&mut self) {
        self.mesh = None;
        self.router = None;
        self.mesh_status = MeshStatus::Incomplete;
        self.dkg_state = DkgState::Idle;
        self.proposal_deadline = None;
        self.round_deadline = None;
        // signer_indices is NOT cleared: wallet-status reports can outrun our
        // own accept, and each signing session overwrites its entries anyway.
    }
}
