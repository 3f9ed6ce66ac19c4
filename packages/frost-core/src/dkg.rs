//! FROST distributed key generation engine.
//!
//! One `DkgEngine` drives a single DKG run for a single participant. The
//! engine is a plain state machine over opaque package bytes: callers hand it
//! serialized round packages keyed by participant index and it hands back
//! serialized packages to broadcast. It never sees hex, envelopes, or device
//! ids; those belong to the routing layer.
//!
//! All three FROST phases are implemented:
//! - Part 1: generates and exchanges commitments
//! - Part 2: generates and distributes per-recipient secret shares
//! - Part 3: computes the group public key and this participant's key package
//!
//! Any engine error is fatal for the run: the engine moves to `Failed` and
//! the caller is expected to drop it and start a fresh session. Retries are
//! session-level, never engine-level.

use crate::errors::{FrostError, Result};
use crate::keystore::KeystoreData;
use frost_core::keys::dkg::{round1, round2};
use frost_core::keys::{KeyPackage, PublicKeyPackage};
use frost_core::{Ciphersuite, Identifier};
use rand_core::OsRng;
use std::collections::BTreeMap;
use zeroize::Zeroize;

/// DKG status tracking enum
#[derive(Debug, PartialEq, Clone)]
pub enum DkgState {
    Idle,
    Initializing,
    Round1InProgress,
    Round1Complete,   // All Round 1 packages received
    Round2InProgress,
    Round2Complete,   // All Round 2 packages received
    Finalizing,
    Complete,
    /// Pseudo-complete: the key package was loaded from a keystore instead of
    /// being generated by a live DKG run.
    KeystoreImported,
    Failed(String),
}

/// Converts a 1-based participant index into the ciphersuite's identifier.
///
/// The resulting scalar encoding is whatever the FROST library defines as
/// canonical for the curve (big-endian for secp256k1, little-endian for
/// Ed25519); interop with the extension cohort depends on not reinventing it.
pub fn identifier_from_index<C: Ciphersuite>(index: u16) -> Result<Identifier<C>> {
    Identifier::<C>::try_from(index)
        .map_err(|_| FrostError::InvalidIdentifier(format!("participant index {} out of range", index)))
}

pub struct DkgEngine<C: Ciphersuite> {
    my_index: u16,
    total: u16,
    threshold: u16,
    state: DkgState,
    cancelled: bool,

    // Secret packages are held serialized so they can be zeroized on drop.
    round1_secret: Option<Vec<u8>>,
    round2_secret: Option<Vec<u8>>,

    // Keyed by identifier; round1 includes our own package (delivered via the
    // router's self-loopback so received == participants when complete).
    round1_packages: BTreeMap<Identifier<C>, round1::Package<C>>,
    // Only packages addressed to us; one per other participant.
    round2_packages: BTreeMap<Identifier<C>, round2::Package<C>>,

    key_package: Option<KeyPackage<C>>,
    public_key_package: Option<PublicKeyPackage<C>>,
}

impl<C: Ciphersuite> DkgEngine<C> {
    /// Allocates engine state for an `(threshold, total)` run as participant
    /// `my_index` (1-based).
    pub fn new(my_index: u16, total: u16, threshold: u16) -> Result<Self> {
        if threshold < 1 || threshold > total {
            return Err(FrostError::InvalidParams(format!(
                "threshold {} outside 1..={}",
                threshold, total
            )));
        }
        if my_index < 1 || my_index > total {
            return Err(FrostError::InvalidParams(format!(
                "participant index {} outside 1..={}",
                my_index, total
            )));
        }
        Ok(Self {
            my_index,
            total,
            threshold,
            state: DkgState::Idle,
            cancelled: false,
            round1_secret: None,
            round2_secret: None,
            round1_packages: BTreeMap::new(),
            round2_packages: BTreeMap::new(),
            key_package: None,
            public_key_package: None,
        })
    }

    pub fn state(&self) -> &DkgState {
        &self.state
    }

    pub fn my_index(&self) -> u16 {
        self.my_index
    }

    pub fn threshold(&self) -> u16 {
        self.threshold
    }

    pub fn total(&self) -> u16 {
        self.total
    }

    /// Requests cooperative cancellation; the next method entry returns
    /// `Cancelled`.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    fn ensure_active(&self) -> Result<()> {
        if self.cancelled {
            return Err(FrostError::Cancelled);
        }
        if let DkgState::Failed(reason) = &self.state {
            return Err(FrostError::InvalidState(format!("DKG already failed: {}", reason)));
        }
        Ok(())
    }

    fn fail<T>(&mut self, err: FrostError) -> Result<T> {
        self.state = DkgState::Failed(err.to_string());
        Err(err)
    }

    fn my_identifier(&self) -> Result<Identifier<C>> {
        identifier_from_index::<C>(self.my_index)
    }

    /// Generates this participant's Round 1 commitment package.
    ///
    /// Callable exactly once; transitions to `Round1InProgress`. The returned
    /// bytes are broadcast to every participant, our own copy included (the
    /// router loops it back so package accounting is uniform).
    pub fn generate_round1(&mut self) -> Result<Vec<u8>> {
        self.ensure_active()?;
        if !matches!(self.state, DkgState::Idle | DkgState::Initializing) {
            return Err(FrostError::InvalidState(format!(
                "generate_round1 called in {:?}",
                self.state
            )));
        }

        let identifier = self.my_identifier()?;
        let mut rng = OsRng;
        let (secret_package, public_package) =
            match frost_core::keys::dkg::part1(identifier, self.total, self.threshold, &mut rng) {
                Ok(parts) => parts,
                Err(e) => return self.fail(FrostError::DkgError(e.to_string())),
            };

        let secret_bytes = secret_package
            .serialize()
            .map_err(|e| FrostError::SerializationError(e.to_string()))?;
        let package_bytes = public_package
            .serialize()
            .map_err(|e| FrostError::SerializationError(e.to_string()))?;

        self.round1_secret = Some(secret_bytes);
        self.state = DkgState::Round1InProgress;
        Ok(package_bytes)
    }

    /// Absorbs a Round 1 package from `sender_index` (self-loopback included).
    ///
    /// A repeated sender is a `DuplicatePackage` error; the router's dedup
    /// layer is expected to have filtered redeliveries before this point, so
    /// a duplicate here is a protocol violation and fails the run.
    pub fn add_round1_package(&mut self, sender_index: u16, package_bytes: &[u8]) -> Result<()> {
        self.ensure_active()?;
        if self.state != DkgState::Round1InProgress {
            return Err(FrostError::InvalidState(format!(
                "round1 package in {:?}",
                self.state
            )));
        }
        if sender_index < 1 || sender_index > self.total {
            return self.fail(FrostError::InvalidIdentifier(format!(
                "round1 sender {} outside 1..={}",
                sender_index, self.total
            )));
        }

        let sender = identifier_from_index::<C>(sender_index)?;
        if self.round1_packages.contains_key(&sender) {
            return self.fail(FrostError::DuplicatePackage {
                round: 1,
                sender: sender_index,
            });
        }

        let package = match round1::Package::<C>::deserialize(package_bytes) {
            Ok(pkg) => pkg,
            Err(e) => {
                return self.fail(FrostError::InvalidPackage(format!(
                    "round1 package from {}: {}",
                    sender_index, e
                )));
            }
        };

        self.round1_packages.insert(sender, package);
        if self.round1_packages.len() == self.total as usize {
            self.state = DkgState::Round1Complete;
        }
        Ok(())
    }

    /// True once every participant's Round 1 package (ours included) has been
    /// absorbed.
    pub fn can_start_round2(&self) -> bool {
        self.state == DkgState::Round1Complete
    }

    /// Whether a Round 1 package from this sender has been absorbed.
    pub fn has_round1_package(&self, sender_index: u16) -> bool {
        identifier_from_index::<C>(sender_index)
            .map(|id| self.round1_packages.contains_key(&id))
            .unwrap_or(false)
    }

    /// Whether a Round 2 package from this sender has been absorbed.
    pub fn has_round2_package(&self, sender_index: u16) -> bool {
        identifier_from_index::<C>(sender_index)
            .map(|id| self.round2_packages.contains_key(&id))
            .unwrap_or(false)
    }

    /// Runs FROST part 2, producing one targeted package per other
    /// participant, keyed by recipient index.
    pub fn generate_round2(&mut self) -> Result<BTreeMap<u16, Vec<u8>>> {
        self.ensure_active()?;
        if !self.can_start_round2() {
            return Err(FrostError::InvalidState(format!(
                "generate_round2 called in {:?}",
                self.state
            )));
        }

        let secret_bytes = self
            .round1_secret
            .as_deref()
            .ok_or_else(|| FrostError::InvalidState("missing round 1 secret package".into()))?;
        let secret_package = round1::SecretPackage::<C>::deserialize(secret_bytes)
            .map_err(|e| FrostError::SerializationError(e.to_string()))?;

        // part2 expects the round 1 packages from everyone but ourselves.
        let my_identifier = self.my_identifier()?;
        let round1_from_others: BTreeMap<_, _> = self
            .round1_packages
            .iter()
            .filter(|(id, _)| **id != my_identifier)
            .map(|(id, pkg)| (*id, pkg.clone()))
            .collect();

        let (round2_secret, round2_public) =
            match frost_core::keys::dkg::part2(secret_package, &round1_from_others) {
                Ok(parts) => parts,
                Err(e) => return self.fail(FrostError::DkgError(format!("DKG part2 failed: {}", e))),
            };

        let round2_secret_bytes = round2_secret
            .serialize()
            .map_err(|e| FrostError::SerializationError(e.to_string()))?;
        if let Some(mut spent) = self.round1_secret.take() {
            spent.zeroize();
        }
        self.round2_secret = Some(round2_secret_bytes);

        let mut by_index = BTreeMap::new();
        for (recipient, package) in round2_public {
            let recipient_index = self.index_of(&recipient)?;
            let bytes = package
                .serialize()
                .map_err(|e| FrostError::SerializationError(e.to_string()))?;
            by_index.insert(recipient_index, bytes);
        }

        self.state = DkgState::Round2InProgress;
        Ok(by_index)
    }

    /// Absorbs a Round 2 package addressed to this participant.
    ///
    /// Recipient filtering happens at the envelope layer; here we only reject
    /// a package claiming to come from ourselves, out-of-range senders, and
    /// duplicates.
    pub fn add_round2_package(&mut self, sender_index: u16, package_bytes: &[u8]) -> Result<()> {
        self.ensure_active()?;
        if self.state != DkgState::Round2InProgress {
            return Err(FrostError::InvalidState(format!(
                "round2 package in {:?}",
                self.state
            )));
        }
        if sender_index == self.my_index {
            return self.fail(FrostError::InvalidPackage(
                "round2 package from self".into(),
            ));
        }
        if sender_index < 1 || sender_index > self.total {
            return self.fail(FrostError::InvalidIdentifier(format!(
                "round2 sender {} outside 1..={}",
                sender_index, self.total
            )));
        }

        let sender = identifier_from_index::<C>(sender_index)?;
        if self.round2_packages.contains_key(&sender) {
            return self.fail(FrostError::DuplicatePackage {
                round: 2,
                sender: sender_index,
            });
        }

        let package = match round2::Package::<C>::deserialize(package_bytes) {
            Ok(pkg) => pkg,
            Err(e) => {
                return self.fail(FrostError::InvalidPackage(format!(
                    "round2 package from {}: {}",
                    sender_index, e
                )));
            }
        };

        self.round2_packages.insert(sender, package);
        if self.round2_packages.len() == (self.total - 1) as usize {
            self.state = DkgState::Round2Complete;
        }
        Ok(())
    }

    /// True once a Round 2 package from every other participant has arrived.
    pub fn can_finalize(&self) -> bool {
        self.state == DkgState::Round2Complete
    }

    /// Runs FROST part 3 and returns the serialized group verifying key.
    ///
    /// The key package and public key package are retained on the engine for
    /// keystore export and subsequent signing.
    pub fn finalize(&mut self) -> Result<Vec<u8>> {
        self.ensure_active()?;
        if !self.can_finalize() {
            return Err(FrostError::InvalidState(format!(
                "finalize called in {:?}",
                self.state
            )));
        }
        self.state = DkgState::Finalizing;

        let secret_bytes = self
            .round2_secret
            .as_deref()
            .ok_or_else(|| FrostError::InvalidState("missing round 2 secret package".into()))?;
        let round2_secret = round2::SecretPackage::<C>::deserialize(secret_bytes)
            .map_err(|e| FrostError::SerializationError(e.to_string()))?;

        let my_identifier = self.my_identifier()?;
        let round1_from_others: BTreeMap<_, _> = self
            .round1_packages
            .iter()
            .filter(|(id, _)| **id != my_identifier)
            .map(|(id, pkg)| (*id, pkg.clone()))
            .collect();

        let (key_package, public_key_package) = match frost_core::keys::dkg::part3(
            &round2_secret,
            &round1_from_others,
            &self.round2_packages,
        ) {
            Ok(parts) => parts,
            Err(e) => return self.fail(FrostError::DkgError(format!("DKG part3 failed: {}", e))),
        };

        let group_key = public_key_package
            .verifying_key()
            .serialize()
            .map_err(|e| FrostError::SerializationError(e.to_string()))?;

        if let Some(mut spent) = self.round2_secret.take() {
            spent.zeroize();
        }
        self.key_package = Some(key_package);
        self.public_key_package = Some(public_key_package);
        self.state = DkgState::Complete;
        Ok(group_key)
    }

    /// The serialized group verifying key, available once `Complete` (or
    /// after a keystore import).
    pub fn group_public_key(&self) -> Result<Vec<u8>> {
        let pkg = self
            .public_key_package
            .as_ref()
            .ok_or_else(|| FrostError::InvalidState("DKG not complete".into()))?;
        pkg.verifying_key()
            .serialize()
            .map_err(|e| FrostError::SerializationError(e.to_string()))
    }

    pub fn key_package(&self) -> Option<&KeyPackage<C>> {
        self.key_package.as_ref()
    }

    pub fn public_key_package(&self) -> Option<&PublicKeyPackage<C>> {
        self.public_key_package.as_ref()
    }

    /// Serializes the key material and binding metadata for persistence.
    pub fn export_keystore(&self, curve: &str) -> Result<KeystoreData> {
        let key_package = self
            .key_package
            .as_ref()
            .ok_or_else(|| FrostError::InvalidState("no key package to export".into()))?;
        let public_key_package = self
            .public_key_package
            .as_ref()
            .ok_or_else(|| FrostError::InvalidState("no public key package to export".into()))?;

        KeystoreData::export::<C>(
            key_package,
            public_key_package,
            self.threshold,
            self.total,
            self.my_index,
            (1..=self.total).collect(),
            curve,
        )
    }

    /// Reconstructs an engine from persisted keystore data, skipping the DKG
    /// rounds entirely (`KeystoreImported` pseudo-state).
    ///
    /// When `expected_group_key` is given (signing sessions), the embedded
    /// group key must match it byte for byte.
    pub fn from_keystore(data: &KeystoreData, expected_group_key: Option<&[u8]>) -> Result<Self> {
        let (key_package, public_key_package) = data.import::<C>()?;

        let group_key = public_key_package
            .verifying_key()
            .serialize()
            .map_err(|e| FrostError::SerializationError(e.to_string()))?;
        if let Some(expected) = expected_group_key {
            if expected != group_key.as_slice() {
                return Err(FrostError::VerificationFailure(
                    "imported key share does not match the expected group public key".into(),
                ));
            }
        }

        let mut engine = Self::new(data.participant_index, data.max_signers, data.min_signers)?;
        engine.key_package = Some(key_package);
        engine.public_key_package = Some(public_key_package);
        engine.state = DkgState::KeystoreImported;
        Ok(engine)
    }

    fn index_of(&self, identifier: &Identifier<C>) -> Result<u16> {
        for index in 1..=self.total {
            if identifier_from_index::<C>(index)? == *identifier {
                return Ok(index);
            }
        }
        Err(FrostError::InvalidIdentifier(
            "identifier does not belong to any participant".into(),
        ))
    }
}

impl<C: Ciphersuite> Drop for DkgEngine<C> {
    fn drop(&mut self) {
        if let Some(mut secret) = self.round1_secret.take() {
            secret.zeroize();
        }
        if let Some(mut secret) = self.round2_secret.take() {
            secret.zeroize();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use frost_ed25519::Ed25519Sha512;
    use frost_secp256k1::Secp256K1Sha256;

    /// Drives a full `(threshold, total)` DKG across in-process engines and
    /// returns them in Complete state.
    pub(crate) fn run_dkg<C: Ciphersuite>(threshold: u16, total: u16) -> Vec<DkgEngine<C>> {
        let mut engines: Vec<DkgEngine<C>> = (1..=total)
            .map(|i| DkgEngine::new(i, total, threshold).unwrap())
            .collect();

        // Round 1: everyone broadcasts, everyone absorbs (self included).
        let round1: Vec<Vec<u8>> = engines
            .iter_mut()
            .map(|e| e.generate_round1().unwrap())
            .collect();
        for engine in engines.iter_mut() {
            for (sender, bytes) in round1.iter().enumerate() {
                engine.add_round1_package(sender as u16 + 1, bytes).unwrap();
            }
            assert!(engine.can_start_round2());
        }

        // Round 2: targeted packages.
        let round2: Vec<BTreeMap<u16, Vec<u8>>> = engines
            .iter_mut()
            .map(|e| e.generate_round2().unwrap())
            .collect();
        for (recipient_idx, engine) in engines.iter_mut().enumerate() {
            let recipient = recipient_idx as u16 + 1;
            for (sender_idx, packages) in round2.iter().enumerate() {
                let sender = sender_idx as u16 + 1;
                if sender == recipient {
                    continue;
                }
                let bytes = packages.get(&recipient).expect("missing targeted package");
                engine.add_round2_package(sender, bytes).unwrap();
            }
            assert!(engine.can_finalize());
        }

        let keys: Vec<Vec<u8>> = engines.iter_mut().map(|e| e.finalize().unwrap()).collect();
        for key in &keys {
            assert_eq!(key, &keys[0], "participants disagree on the group key");
        }
        engines
    }

    #[test]
    fn dkg_2_of_3_secp256k1_agrees() {
        let engines = run_dkg::<Secp256K1Sha256>(2, 3);
        for engine in &engines {
            assert_eq!(*engine.state(), DkgState::Complete);
            assert!(engine.key_package().is_some());
        }
    }

    #[test]
    fn dkg_2_of_2_ed25519_agrees() {
        let engines = run_dkg::<Ed25519Sha512>(2, 2);
        let key = engines[0].group_public_key().unwrap();
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn duplicate_round1_package_is_fatal() {
        let mut engines: Vec<DkgEngine<Ed25519Sha512>> = (1..=2)
            .map(|i| DkgEngine::new(i, 2, 2).unwrap())
            .collect();
        let p1 = engines[0].generate_round1().unwrap();
        let _p2 = engines[1].generate_round1().unwrap();

        engines[1].add_round1_package(1, &p1).unwrap();
        let err = engines[1].add_round1_package(1, &p1).unwrap_err();
        assert!(matches!(
            err,
            FrostError::DuplicatePackage { round: 1, sender: 1 }
        ));
        assert!(matches!(engines[1].state(), DkgState::Failed(_)));
    }

    #[test]
    fn round1_generation_is_single_shot() {
        let mut engine = DkgEngine::<Ed25519Sha512>::new(1, 3, 2).unwrap();
        engine.generate_round1().unwrap();
        assert!(matches!(
            engine.generate_round1(),
            Err(FrostError::InvalidState(_))
        ));
    }

    #[test]
    fn invalid_params_are_rejected() {
        assert!(DkgEngine::<Ed25519Sha512>::new(1, 3, 0).is_err());
        assert!(DkgEngine::<Ed25519Sha512>::new(1, 3, 4).is_err());
        assert!(DkgEngine::<Ed25519Sha512>::new(4, 3, 2).is_err());
        assert!(DkgEngine::<Ed25519Sha512>::new(0, 3, 2).is_err());
    }

    #[test]
    fn cancellation_wins_over_everything() {
        let mut engine = DkgEngine::<Secp256K1Sha256>::new(1, 2, 2).unwrap();
        engine.cancel();
        assert!(matches!(
            engine.generate_round1(),
            Err(FrostError::Cancelled)
        ));
    }

    #[test]
    fn garbage_round1_package_fails_the_run() {
        let mut engine = DkgEngine::<Secp256K1Sha256>::new(1, 2, 2).unwrap();
        engine.generate_round1().unwrap();
        let err = engine.add_round1_package(2, b"not a package").unwrap_err();
        assert!(matches!(err, FrostError::InvalidPackage(_)));
        assert!(matches!(engine.state(), DkgState::Failed(_)));
    }

    #[test]
    fn keystore_round_trip_preserves_group_key() {
        let engines = run_dkg::<Secp256K1Sha256>(2, 3);
        let exported = engines[0].export_keystore("secp256k1").unwrap();
        let expected = engines[0].group_public_key().unwrap();

        let imported =
            DkgEngine::<Secp256K1Sha256>::from_keystore(&exported, Some(expected.as_slice()))
                .unwrap();
        assert_eq!(*imported.state(), DkgState::KeystoreImported);
        assert_eq!(imported.group_public_key().unwrap(), expected);

        // A different expected key must be rejected.
        let other = run_dkg::<Secp256K1Sha256>(2, 3)[0].group_public_key().unwrap();
        assert!(
            DkgEngine::<Secp256K1Sha256>::from_keystore(&exported, Some(other.as_slice())).is_err()
        );
    }
}
