//! Session lifecycle: proposals, acceptance tracking, wallet validation.
//!
//! The controller owns at most one active session plus the set of pending
//! invites. It validates proposals, merges acceptance responses, and reports
//! the `AllAccepted` transition that hands control to the mesh layer. It
//! knows nothing about transports or engines.

use crate::errors::{AppError, Result};
use crate::keystore::WalletMetadata;
use crate::protocal::signal::{
    SessionInfo, SessionProposal, SessionResponse, SessionStatus, SessionType,
};
use std::collections::{HashMap, HashSet};

/// What merging a session response produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Still waiting on other participants.
    Pending,
    /// Everyone accepted; connection setup can begin.
    AllAccepted,
    /// A participant declined or reported a broken wallet; the session is
    /// dead for everyone.
    Aborted { device: String, reason: String },
    /// Response for a session we are not part of.
    NotOurSession,
}

pub struct SessionController {
    device_id: String,
    active: Option<SessionInfo>,
    invites: HashMap<String, SessionInfo>,
}

impl SessionController {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            active: None,
            invites: HashMap::new(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn active(&self) -> Option<&SessionInfo> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut SessionInfo> {
        self.active.as_mut()
    }

    pub fn invites(&self) -> impl Iterator<Item = &SessionInfo> {
        self.invites.values()
    }

    /// Validates and registers a locally proposed session, with ourselves as
    /// the first accepted participant.
    pub fn propose(
        &mut self,
        session_id: &str,
        total: u16,
        threshold: u16,
        participants: Vec<String>,
        curve_type: &str,
        session_type: SessionType,
    ) -> Result<SessionInfo> {
        if let Some(active) = &self.active {
            if matches!(
                active.status,
                SessionStatus::Proposed | SessionStatus::AllAccepted
            ) {
                return Err(AppError::InvalidParams(format!(
                    "session '{}' is still in progress",
                    active.session_id
                )));
            }
        }
        if session_id.is_empty() {
            return Err(AppError::InvalidParams("empty session id".into()));
        }
        if threshold < 1 || threshold > total {
            return Err(AppError::InvalidParams(format!(
                "threshold {} outside 1..={}",
                threshold, total
            )));
        }
        let is_signing = matches!(session_type, SessionType::Signing { .. });
        if is_signing {
            // Signing runs over a chosen signer subset: at least t, at most n.
            if (participants.len() as u16) < threshold || (participants.len() as u16) > total {
                return Err(AppError::InvalidParams(format!(
                    "{} signers selected for a {}-of-{} wallet",
                    participants.len(),
                    threshold,
                    total
                )));
            }
        } else if participants.len() as u16 != total {
            return Err(AppError::InvalidParams(format!(
                "{} participants listed, total is {}",
                participants.len(),
                total
            )));
        }
        if !participants.iter().any(|p| p == &self.device_id) {
            return Err(AppError::InvalidParams(
                "proposer is not in the participant list".into(),
            ));
        }
        let unique: HashSet<&String> = participants.iter().collect();
        if unique.len() != participants.len() {
            return Err(AppError::InvalidParams("duplicate device id".into()));
        }

        let mut session = SessionInfo {
            session_id: session_id.to_string(),
            proposer_id: self.device_id.clone(),
            total,
            threshold,
            participants,
            accepted_devices: vec![self.device_id.clone()],
            session_type,
            curve_type: curve_type.to_string(),
            status: SessionStatus::Proposed,
        };
        // A single-participant session has nobody left to accept.
        if session.is_all_accepted() {
            session.status = SessionStatus::AllAccepted;
        }
        self.active = Some(session.clone());
        Ok(session)
    }

    /// Records an incoming proposal as a pending invite.
    pub fn on_proposal(&mut self, proposal: SessionProposal) -> SessionInfo {
        let session = proposal.into_session_info();
        self.invites
            .insert(session.session_id.clone(), session.clone());
        session
    }

    /// Accepts a pending invite, making it the active session with ourselves
    /// appended to the accepted set.
    pub fn accept(&mut self, session_id: &str) -> Result<SessionInfo> {
        let mut session = self
            .invites
            .remove(session_id)
            .ok_or_else(|| AppError::InvalidParams(format!("no invite for '{}'", session_id)))?;
        if !session.participants.iter().any(|p| p == &self.device_id) {
            return Err(AppError::InvalidParams(format!(
                "this device is not a participant of '{}'",
                session_id
            )));
        }
        if !session.accepted_devices.contains(&self.device_id) {
            session.accepted_devices.push(self.device_id.clone());
        }
        if session.status == SessionStatus::Proposed && session.is_all_accepted() {
            session.status = SessionStatus::AllAccepted;
        }
        let accepted = session.clone();
        self.active = Some(session);
        Ok(accepted)
    }

    /// Promotes the active session to `AllAccepted` once every participant
    /// has accepted. Returns true only on the transition itself.
    pub fn try_transition_all_accepted(&mut self) -> bool {
        match self.active.as_mut() {
            Some(session)
                if session.status == SessionStatus::Proposed && session.is_all_accepted() =>
            {
                session.status = SessionStatus::AllAccepted;
                true
            }
            _ => false,
        }
    }

    /// Merges a peer's acceptance response into the active session, or into
    /// a pending invite when the response outran our own accept.
    pub fn on_response(&mut self, response: &SessionResponse) -> ResponseOutcome {
        let Some(session) = self.active.as_mut() else {
            // Responses can arrive before we accepted the invite ourselves;
            // losing them would wedge the acceptance count.
            if let Some(invite) = self.invites.get_mut(&response.session_id) {
                if response.accepted
                    && !invite.accepted_devices.contains(&response.from_device_id)
                {
                    invite.accepted_devices.push(response.from_device_id.clone());
                }
                return ResponseOutcome::Pending;
            }
            return ResponseOutcome::NotOurSession;
        };
        if session.session_id != response.session_id {
            return ResponseOutcome::NotOurSession;
        }

        if !response.accepted {
            let reason = response
                .reason
                .clone()
                .or_else(|| {
                    response
                        .wallet_status
                        .as_ref()
                        .and_then(|ws| ws.error_reason.clone())
                })
                .unwrap_or_else(|| "declined".to_string());
            session.status = SessionStatus::Failed;
            return ResponseOutcome::Aborted {
                device: response.from_device_id.clone(),
                reason,
            };
        }

        if !session
            .accepted_devices
            .contains(&response.from_device_id)
        {
            session.accepted_devices.push(response.from_device_id.clone());
        }

        if self.try_transition_all_accepted() {
            ResponseOutcome::AllAccepted
        } else {
            // Either still waiting, or a late duplicate after the transition.
            ResponseOutcome::Pending
        }
    }

    pub fn fail_active(&mut self) -> Option<SessionInfo> {
        if let Some(session) = self.active.as_mut() {
            session.status = SessionStatus::Failed;
        }
        self.active.take()
    }

    pub fn complete_active(&mut self) {
        if let Some(session) = self.active.as_mut() {
            session.status = SessionStatus::Complete;
        }
    }
}

/// Checks a local wallet against the parameters a signing proposal announced.
///
/// Returns this device's DKG-time participant index on success. Every
/// mismatch names the offending field so the proposer can surface an
/// actionable report (request share, import backup, decline).
pub fn validate_signing_wallet(
    session_type: &SessionType,
    wallet: Option<&WalletMetadata>,
) -> Result<u16> {
    let SessionType::Signing {
        wallet_name,
        curve_type,
        threshold,
        total,
        group_public_key,
        ..
    } = session_type
    else {
        return Err(AppError::InvalidParams(
            "wallet validation on a DKG session".into(),
        ));
    };

    let wallet = wallet.ok_or_else(|| AppError::WalletMissing(wallet_name.clone()))?;

    if wallet.curve_type != *curve_type {
        return Err(AppError::WalletMismatch {
            field: "curve_type",
            expected: curve_type.clone(),
            got: wallet.curve_type.clone(),
        });
    }
    if wallet.threshold != *threshold {
        return Err(AppError::WalletMismatch {
            field: "threshold",
            expected: threshold.to_string(),
            got: wallet.threshold.to_string(),
        });
    }
    if wallet.total_participants != *total {
        return Err(AppError::WalletMismatch {
            field: "total_participants",
            expected: total.to_string(),
            got: wallet.total_participants.to_string(),
        });
    }
    if wallet.group_public_key != *group_public_key {
        return Err(AppError::WalletMismatch {
            field: "group_public_key",
            expected: group_public_key.clone(),
            got: wallet.group_public_key.clone(),
        });
    }

    Ok(wallet.participant_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::WalletMetadata;

    fn dkg_proposal(id: &str, proposer: &str, participants: &[&str]) -> SessionProposal {
        SessionProposal {
            session_id: id.into(),
            total: participants.len() as u16,
            threshold: 2,
            participants: participants.iter().map(|s| s.to_string()).collect(),
            session_type: SessionType::DKG,
            proposer_device_id: proposer.into(),
            curve_type: "ed25519".into(),
        }
    }

    #[test]
    fn propose_validates_parameters() {
        let mut ctl = SessionController::new("alice");
        let parts = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        // threshold out of range
        assert!(ctl
            .propose("s", 2, 0, parts(&["alice", "bob"]), "ed25519", SessionType::DKG)
            .is_err());
        assert!(ctl
            .propose("s", 2, 3, parts(&["alice", "bob"]), "ed25519", SessionType::DKG)
            .is_err());
        // |participants| != n
        assert!(ctl
            .propose("s", 3, 2, parts(&["alice", "bob"]), "ed25519", SessionType::DKG)
            .is_err());
        // self not included
        assert!(ctl
            .propose("s", 2, 2, parts(&["bob", "carol"]), "ed25519", SessionType::DKG)
            .is_err());
        // duplicate device
        assert!(ctl
            .propose("s", 2, 2, parts(&["alice", "alice"]), "ed25519", SessionType::DKG)
            .is_err());
        // and a valid one
        let session = ctl
            .propose("s", 2, 2, parts(&["alice", "bob"]), "ed25519", SessionType::DKG)
            .unwrap();
        assert_eq!(session.accepted_devices, vec!["alice".to_string()]);
    }

    #[test]
    fn acceptance_reaches_all_accepted() {
        let mut proposer = SessionController::new("alice");
        proposer
            .propose(
                "s1",
                2,
                2,
                vec!["alice".into(), "bob".into()],
                "ed25519",
                SessionType::DKG,
            )
            .unwrap();

        let outcome = proposer.on_response(&SessionResponse {
            session_id: "s1".into(),
            from_device_id: "bob".into(),
            accepted: true,
            wallet_status: None,
            reason: None,
        });
        assert_eq!(outcome, ResponseOutcome::AllAccepted);
        assert_eq!(
            proposer.active().unwrap().status,
            SessionStatus::AllAccepted
        );
    }

    #[test]
    fn invite_accept_flow() {
        let mut ctl = SessionController::new("bob");
        ctl.on_proposal(dkg_proposal("s1", "alice", &["alice", "bob"]));
        let session = ctl.accept("s1").unwrap();
        assert!(session.accepted_devices.contains(&"bob".to_string()));
        assert!(ctl.accept("s1").is_err(), "invite is consumed");
    }

    #[test]
    fn rejection_aborts_the_session() {
        let mut ctl = SessionController::new("alice");
        ctl.propose(
            "s1",
            2,
            2,
            vec!["alice".into(), "bob".into()],
            "ed25519",
            SessionType::DKG,
        )
        .unwrap();
        let outcome = ctl.on_response(&SessionResponse {
            session_id: "s1".into(),
            from_device_id: "bob".into(),
            accepted: false,
            wallet_status: None,
            reason: Some("wallet mismatch".into()),
        });
        assert_eq!(
            outcome,
            ResponseOutcome::Aborted {
                device: "bob".into(),
                reason: "wallet mismatch".into()
            }
        );
    }

    fn vault_wallet(threshold: u16, total: u16) -> WalletMetadata {
        WalletMetadata::new(
            "vault".into(),
            "carol".into(),
            "carol".into(),
            "secp256k1".into(),
            threshold,
            total,
            3,
            "02abcdef".into(),
        )
    }

    fn vault_signing(threshold: u16, total: u16) -> SessionType {
        SessionType::Signing {
            wallet_name: "vault".into(),
            curve_type: "secp256k1".into(),
            threshold,
            total,
            group_public_key: "02abcdef".into(),
            message: "123456".into(),
            blockchain: "ethereum".into(),
            chain_id: Some(1),
        }
    }

    #[test]
    fn wallet_threshold_mismatch_is_reported() {
        // The session proposes 2-of-3; this participant holds a 3-of-3 share.
        let wallet = vault_wallet(3, 3);
        let err = validate_signing_wallet(&vault_signing(2, 3), Some(&wallet)).unwrap_err();
        match err {
            AppError::WalletMismatch {
                field,
                expected,
                got,
            } => {
                assert_eq!(field, "threshold");
                assert_eq!(expected, "2");
                assert_eq!(got, "3");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_wallet_is_reported() {
        let err = validate_signing_wallet(&vault_signing(2, 3), None).unwrap_err();
        assert!(matches!(err, AppError::WalletMissing(name) if name == "vault"));
    }

    #[test]
    fn matching_wallet_returns_participant_index() {
        let wallet = vault_wallet(2, 3);
        let index = validate_signing_wallet(&vault_signing(2, 3), Some(&wallet)).unwrap();
        assert_eq!(index, 3);
    }
}
