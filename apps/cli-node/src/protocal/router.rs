//! Protocol message router.
//!
//! The router owns the per-session FROST engines (one ciphersuite sum type
//! per protocol) and is the only component that feeds them. Its obligations:
//!
//! - dispatch envelopes by type, rejecting unknown sessions;
//! - deduplicate on `(session_id, type, round, sender_index)` so the engine
//!   observes exactly one `add_*` call per logical package;
//! - gate on state: a package that arrives before the local state can consume
//!   it is buffered, never dropped and never forced into the engine;
//! - drain buffered packages in arrival order after every enabling local
//!   transition (`drain` is the caller's obligation after it advances state —
//!   skipping it is how nodes stall with peers' packages sitting unread);
//! - feed a participant's own packages through the same path as peer packages
//!   so received-counts are uniform.

use crate::errors::{AppError, Result};
use crate::protocal::envelope::{EnvelopeType, ProtocolEnvelope};
use crate::protocal::signal::CurveType;
use frost_mpc_core::{
    DkgEngine, DkgState, Ed25519Sha512, KeystoreData, Secp256K1Sha256, SigningEngine, SigningPhase,
};
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::{debug, warn};

/// DKG engine for whichever ciphersuite the session selected.
pub enum SessionDkg {
    Secp256k1(DkgEngine<Secp256K1Sha256>),
    Ed25519(DkgEngine<Ed25519Sha512>),
}

impl SessionDkg {
    pub fn new(curve: CurveType, my_index: u16, total: u16, threshold: u16) -> Result<Self> {
        Ok(match curve {
            CurveType::Secp256k1 => {
                SessionDkg::Secp256k1(DkgEngine::new(my_index, total, threshold)?)
            }
            CurveType::Ed25519 => SessionDkg::Ed25519(DkgEngine::new(my_index, total, threshold)?),
        })
    }

    pub fn state(&self) -> &DkgState {
        match self {
            SessionDkg::Secp256k1(e) => e.state(),
            SessionDkg::Ed25519(e) => e.state(),
        }
    }

    pub fn generate_round1(&mut self) -> Result<Vec<u8>> {
        Ok(match self {
            SessionDkg::Secp256k1(e) => e.generate_round1()?,
            SessionDkg::Ed25519(e) => e.generate_round1()?,
        })
    }

    pub fn add_round1_package(&mut self, sender_index: u16, bytes: &[u8]) -> Result<()> {
        match self {
            SessionDkg::Secp256k1(e) => e.add_round1_package(sender_index, bytes)?,
            SessionDkg::Ed25519(e) => e.add_round1_package(sender_index, bytes)?,
        }
        Ok(())
    }

    pub fn can_start_round2(&self) -> bool {
        match self {
            SessionDkg::Secp256k1(e) => e.can_start_round2(),
            SessionDkg::Ed25519(e) => e.can_start_round2(),
        }
    }

    pub fn generate_round2(&mut self) -> Result<BTreeMap<u16, Vec<u8>>> {
        Ok(match self {
            SessionDkg::Secp256k1(e) => e.generate_round2()?,
            SessionDkg::Ed25519(e) => e.generate_round2()?,
        })
    }

    pub fn add_round2_package(&mut self, sender_index: u16, bytes: &[u8]) -> Result<()> {
        match self {
            SessionDkg::Secp256k1(e) => e.add_round2_package(sender_index, bytes)?,
            SessionDkg::Ed25519(e) => e.add_round2_package(sender_index, bytes)?,
        }
        Ok(())
    }

    pub fn can_finalize(&self) -> bool {
        match self {
            SessionDkg::Secp256k1(e) => e.can_finalize(),
            SessionDkg::Ed25519(e) => e.can_finalize(),
        }
    }

    /// Whether this participant still owes us packages for the run to finish.
    pub fn still_needs(&self, sender_index: u16) -> bool {
        let (has_r1, has_r2, done) = match self {
            SessionDkg::Secp256k1(e) => (
                e.has_round1_package(sender_index),
                e.has_round2_package(sender_index),
                matches!(e.state(), DkgState::Complete | DkgState::KeystoreImported),
            ),
            SessionDkg::Ed25519(e) => (
                e.has_round1_package(sender_index),
                e.has_round2_package(sender_index),
                matches!(e.state(), DkgState::Complete | DkgState::KeystoreImported),
            ),
        };
        !done && !(has_r1 && has_r2)
    }

    pub fn finalize(&mut self) -> Result<Vec<u8>> {
        Ok(match self {
            SessionDkg::Secp256k1(e) => e.finalize()?,
            SessionDkg::Ed25519(e) => e.finalize()?,
        })
    }

    pub fn group_public_key(&self) -> Result<Vec<u8>> {
        Ok(match self {
            SessionDkg::Secp256k1(e) => e.group_public_key()?,
            SessionDkg::Ed25519(e) => e.group_public_key()?,
        })
    }

    pub fn export_keystore(&self) -> Result<KeystoreData> {
        Ok(match self {
            SessionDkg::Secp256k1(e) => e.export_keystore(CurveType::Secp256k1.as_str())?,
            SessionDkg::Ed25519(e) => e.export_keystore(CurveType::Ed25519.as_str())?,
        })
    }

    pub fn cancel(&mut self) {
        match self {
            SessionDkg::Secp256k1(e) => e.cancel(),
            SessionDkg::Ed25519(e) => e.cancel(),
        }
    }
}

/// Signing engine for whichever ciphersuite the wallet uses.
pub enum SessionSigning {
    Secp256k1(SigningEngine<Secp256K1Sha256>),
    Ed25519(SigningEngine<Ed25519Sha512>),
}

impl SessionSigning {
    /// Builds a signing engine from a decrypted keystore entry.
    ///
    /// `expected_group_key` is the group key announced in the session
    /// proposal; a share bound to a different group key must not sign.
    pub fn from_keystore_data(
        curve: CurveType,
        data: &KeystoreData,
        signing_id: &str,
        message: Vec<u8>,
        my_index: u16,
        signers: &[u16],
        expected_group_key: Option<&[u8]>,
    ) -> Result<Self> {
        Ok(match curve {
            CurveType::Secp256k1 => {
                let engine = DkgEngine::<Secp256K1Sha256>::from_keystore(data, expected_group_key)?;
                let key_package = engine
                    .key_package()
                    .ok_or(AppError::Protocol("keystore entry has no key package".into()))?
                    .clone();
                let public_key_package = engine
                    .public_key_package()
                    .ok_or(AppError::Protocol("keystore entry has no public key package".into()))?
                    .clone();
                SessionSigning::Secp256k1(SigningEngine::new(
                    signing_id,
                    message,
                    my_index,
                    signers,
                    key_package,
                    public_key_package,
                )?)
            }
            CurveType::Ed25519 => {
                let engine = DkgEngine::<Ed25519Sha512>::from_keystore(data, expected_group_key)?;
                let key_package = engine
                    .key_package()
                    .ok_or(AppError::Protocol("keystore entry has no key package".into()))?
                    .clone();
                let public_key_package = engine
                    .public_key_package()
                    .ok_or(AppError::Protocol("keystore entry has no public key package".into()))?
                    .clone();
                SessionSigning::Ed25519(SigningEngine::new(
                    signing_id,
                    message,
                    my_index,
                    signers,
                    key_package,
                    public_key_package,
                )?)
            }
        })
    }

    pub fn phase(&self) -> &SigningPhase {
        match self {
            SessionSigning::Secp256k1(e) => e.phase(),
            SessionSigning::Ed25519(e) => e.phase(),
        }
    }

    pub fn signers(&self) -> &[u16] {
        match self {
            SessionSigning::Secp256k1(e) => e.signers(),
            SessionSigning::Ed25519(e) => e.signers(),
        }
    }

    pub fn generate_commitment(&mut self) -> Result<Vec<u8>> {
        Ok(match self {
            SessionSigning::Secp256k1(e) => e.generate_commitment()?,
            SessionSigning::Ed25519(e) => e.generate_commitment()?,
        })
    }

    pub fn add_commitment(&mut self, sender_index: u16, bytes: &[u8]) -> Result<()> {
        match self {
            SessionSigning::Secp256k1(e) => e.add_commitment(sender_index, bytes)?,
            SessionSigning::Ed25519(e) => e.add_commitment(sender_index, bytes)?,
        }
        Ok(())
    }

    pub fn commitments_ready(&self) -> bool {
        match self {
            SessionSigning::Secp256k1(e) => e.commitments_ready(),
            SessionSigning::Ed25519(e) => e.commitments_ready(),
        }
    }

    pub fn generate_signature_share(&mut self) -> Result<Vec<u8>> {
        Ok(match self {
            SessionSigning::Secp256k1(e) => e.generate_signature_share()?,
            SessionSigning::Ed25519(e) => e.generate_signature_share()?,
        })
    }

    pub fn add_signature_share(&mut self, sender_index: u16, bytes: &[u8]) -> Result<()> {
        match self {
            SessionSigning::Secp256k1(e) => e.add_signature_share(sender_index, bytes)?,
            SessionSigning::Ed25519(e) => e.add_signature_share(sender_index, bytes)?,
        }
        Ok(())
    }

    pub fn shares_ready(&self) -> bool {
        match self {
            SessionSigning::Secp256k1(e) => e.shares_ready(),
            SessionSigning::Ed25519(e) => e.shares_ready(),
        }
    }

    /// Whether this signer still owes us a commitment or share.
    pub fn still_needs(&self, sender_index: u16) -> bool {
        let (is_signer, has_commitment, has_share, done) = match self {
            SessionSigning::Secp256k1(e) => (
                e.signers().contains(&sender_index),
                e.has_commitment(sender_index),
                e.has_share(sender_index),
                matches!(e.phase(), SigningPhase::Complete),
            ),
            SessionSigning::Ed25519(e) => (
                e.signers().contains(&sender_index),
                e.has_commitment(sender_index),
                e.has_share(sender_index),
                matches!(e.phase(), SigningPhase::Complete),
            ),
        };
        is_signer && !done && !(has_commitment && has_share)
    }

    pub fn aggregate(&mut self) -> Result<Vec<u8>> {
        Ok(match self {
            SessionSigning::Secp256k1(e) => e.aggregate()?,
            SessionSigning::Ed25519(e) => e.aggregate()?,
        })
    }

    pub fn signature(&self) -> Option<&[u8]> {
        match self {
            SessionSigning::Secp256k1(e) => e.signature(),
            SessionSigning::Ed25519(e) => e.signature(),
        }
    }

    pub fn cancel(&mut self) {
        match self {
            SessionSigning::Secp256k1(e) => e.cancel(),
            SessionSigning::Ed25519(e) => e.cancel(),
        }
    }
}

/// What the router observed while consuming envelopes. The session driver
/// reacts to these (generating round 2, finalizing, aggregating, ...) and
/// then calls `drain` again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    ChannelOpen { sender_index: u16 },
    MeshReady { sender_index: u16 },
    /// All DKG round 1 packages absorbed; round 2 can start.
    Round1Complete,
    /// All DKG round 2 packages absorbed; finalization can start.
    Round2Complete,
    /// All signer commitments absorbed; shares can be generated.
    CommitmentsReady,
    /// All signature shares absorbed; aggregation can run.
    SharesReady,
}

pub struct ProtocolRouter {
    session_id: String,
    my_index: u16,
    mesh_ready: bool,
    seen: HashSet<(EnvelopeType, u8, u16)>,
    buffer: VecDeque<ProtocolEnvelope>,
    pub dkg: Option<SessionDkg>,
    pub signing: Option<SessionSigning>,
}

fn dkg_rank(state: &DkgState) -> u8 {
    match state {
        DkgState::Idle => 0,
        DkgState::Initializing => 1,
        DkgState::Round1InProgress => 2,
        DkgState::Round1Complete => 3,
        DkgState::Round2InProgress => 4,
        DkgState::Round2Complete => 5,
        DkgState::Finalizing => 6,
        DkgState::Complete | DkgState::KeystoreImported => 7,
        DkgState::Failed(_) => u8::MAX,
    }
}

impl ProtocolRouter {
    pub fn new(session_id: &str, my_index: u16) -> Self {
        Self {
            session_id: session_id.to_string(),
            my_index,
            mesh_ready: false,
            seen: HashSet::new(),
            buffer: VecDeque::new(),
            dkg: None,
            signing: None,
        }
    }

    pub fn my_index(&self) -> u16 {
        self.my_index
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Marks the mesh as ready. The caller must `drain` afterwards to replay
    /// anything that arrived while the mesh was still forming.
    pub fn set_mesh_ready(&mut self) {
        self.mesh_ready = true;
    }

    /// Routes one envelope: dedup, recipient filter, then consume or buffer.
    pub fn ingest(&mut self, envelope: ProtocolEnvelope) -> Result<Vec<RouterEvent>> {
        if envelope.session_id != self.session_id {
            warn!(
                session = %envelope.session_id,
                "dropping envelope for unknown session"
            );
            return Ok(Vec::new());
        }

        // Round 2 packages are targeted; keep only the entry addressed to us.
        if let Some(recipient) = envelope.recipient_index {
            if recipient != self.my_index {
                return Ok(Vec::new());
            }
        }

        let key = (envelope.msg_type, envelope.round, envelope.sender_index);
        if !self.seen.insert(key) {
            debug!(?key, "dropping duplicate envelope");
            return Ok(Vec::new());
        }

        match self.try_consume(&envelope)? {
            Some(events) => Ok(events),
            None => {
                debug!(
                    msg_type = ?envelope.msg_type,
                    sender = envelope.sender_index,
                    "buffering early envelope"
                );
                self.buffer.push_back(envelope);
                Ok(Vec::new())
            }
        }
    }

    /// Replays buffered envelopes, in arrival order, until no further
    /// progress. Call after every local state transition that could make a
    /// buffered package consumable.
    pub fn drain(&mut self) -> Result<Vec<RouterEvent>> {
        let mut events = Vec::new();
        loop {
            let mut progressed = false;
            let mut remaining = VecDeque::with_capacity(self.buffer.len());
            while let Some(envelope) = self.buffer.pop_front() {
                match self.try_consume(&envelope)? {
                    Some(mut consumed) => {
                        events.append(&mut consumed);
                        progressed = true;
                    }
                    None => remaining.push_back(envelope),
                }
            }
            self.buffer = remaining;
            if !progressed {
                break;
            }
        }
        Ok(events)
    }

    /// Attempts to consume one envelope. `None` means "not yet consumable,
    /// buffer it"; errors are fatal to the session.
    fn try_consume(&mut self, envelope: &ProtocolEnvelope) -> Result<Option<Vec<RouterEvent>>> {
        match envelope.msg_type {
            EnvelopeType::ChannelOpen => Ok(Some(vec![RouterEvent::ChannelOpen {
                sender_index: envelope.sender_index,
            }])),
            EnvelopeType::MeshReady => Ok(Some(vec![RouterEvent::MeshReady {
                sender_index: envelope.sender_index,
            }])),
            _ if !self.mesh_ready => Ok(None),
            EnvelopeType::DkgRound1 => {
                let Some(dkg) = self.dkg.as_mut() else {
                    return Ok(None);
                };
                if dkg_rank(dkg.state()) < dkg_rank(&DkgState::Round1InProgress) {
                    return Ok(None);
                }
                dkg.add_round1_package(envelope.sender_index, &envelope.payload()?)?;
                if dkg.can_start_round2() {
                    Ok(Some(vec![RouterEvent::Round1Complete]))
                } else {
                    Ok(Some(Vec::new()))
                }
            }
            EnvelopeType::DkgRound2 => {
                let Some(dkg) = self.dkg.as_mut() else {
                    return Ok(None);
                };
                if dkg_rank(dkg.state()) < dkg_rank(&DkgState::Round2InProgress) {
                    return Ok(None);
                }
                dkg.add_round2_package(envelope.sender_index, &envelope.payload()?)?;
                if dkg.can_finalize() {
                    Ok(Some(vec![RouterEvent::Round2Complete]))
                } else {
                    Ok(Some(Vec::new()))
                }
            }
            EnvelopeType::SignCommitment => {
                let Some(signing) = self.signing.as_mut() else {
                    return Ok(None);
                };
                signing.add_commitment(envelope.sender_index, &envelope.payload()?)?;
                if signing.commitments_ready() {
                    Ok(Some(vec![RouterEvent::CommitmentsReady]))
                } else {
                    Ok(Some(Vec::new()))
                }
            }
            EnvelopeType::SignShare => {
                let Some(signing) = self.signing.as_mut() else {
                    return Ok(None);
                };
                if *signing.phase() == SigningPhase::CommitmentPhase {
                    return Ok(None);
                }
                signing.add_signature_share(envelope.sender_index, &envelope.payload()?)?;
                if signing.shares_ready() {
                    Ok(Some(vec![RouterEvent::SharesReady]))
                } else {
                    Ok(Some(Vec::new()))
                }
            }
        }
    }
}
