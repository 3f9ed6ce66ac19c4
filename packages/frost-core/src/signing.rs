//! FROST threshold signing engine.
//!
//! One `SigningEngine` drives a single signing attempt over a fixed signer
//! set. The signer set is chosen at construction and never changes; losing a
//! chosen signer mid-run fails the attempt and a fresh engine with a
//! different set must be created. Aggregation is deterministic, so any signer
//! may aggregate and all of them produce identical bytes.

use crate::dkg::identifier_from_index;
use crate::errors::{FrostError, Result};
use frost_core::keys::{KeyPackage, PublicKeyPackage};
use frost_core::round1::{SigningCommitments, SigningNonces};
use frost_core::round2::SignatureShare;
use frost_core::{Ciphersuite, Identifier, SigningPackage};
use rand_core::OsRng;
use std::collections::BTreeMap;

/// Signing phase tracking enum
#[derive(Debug, PartialEq, Clone)]
pub enum SigningPhase {
    CommitmentPhase,
    SharePhase,
    Complete,
    Failed(String),
}

#[derive(Debug)]
pub struct SigningEngine<C: Ciphersuite> {
    signing_id: String,
    message: Vec<u8>,
    my_index: u16,
    signers: Vec<u16>,
    phase: SigningPhase,
    cancelled: bool,

    key_package: KeyPackage<C>,
    public_key_package: PublicKeyPackage<C>,

    nonces: Option<SigningNonces<C>>,
    commitments: BTreeMap<Identifier<C>, SigningCommitments<C>>,
    signing_package: Option<SigningPackage<C>>,
    shares: BTreeMap<Identifier<C>, SignatureShare<C>>,
    signature: Option<Vec<u8>>,
}

impl<C: Ciphersuite> SigningEngine<C> {
    /// Creates an engine for one signing attempt.
    ///
    /// `signers` is the chosen participant-index set; it must contain this
    /// participant and hold at least `min_signers` entries, otherwise the
    /// attempt is refused with `InvalidParams` before any nonce is generated.
    pub fn new(
        signing_id: impl Into<String>,
        message: Vec<u8>,
        my_index: u16,
        signers: &[u16],
        key_package: KeyPackage<C>,
        public_key_package: PublicKeyPackage<C>,
    ) -> Result<Self> {
        let mut signers: Vec<u16> = signers.to_vec();
        signers.sort_unstable();
        signers.dedup();

        if !signers.contains(&my_index) {
            return Err(FrostError::InvalidParams(
                "signer set does not include this participant".into(),
            ));
        }
        let min_signers = *key_package.min_signers() as usize;
        if signers.len() < min_signers {
            return Err(FrostError::InvalidParams(format!(
                "{} signers selected, threshold is {}",
                signers.len(),
                min_signers
            )));
        }
        if message.is_empty() {
            return Err(FrostError::InvalidParams("empty signing message".into()));
        }

        Ok(Self {
            signing_id: signing_id.into(),
            message,
            my_index,
            signers,
            phase: SigningPhase::CommitmentPhase,
            cancelled: false,
            key_package,
            public_key_package,
            nonces: None,
            commitments: BTreeMap::new(),
            signing_package: None,
            shares: BTreeMap::new(),
            signature: None,
        })
    }

    pub fn signing_id(&self) -> &str {
        &self.signing_id
    }

    pub fn phase(&self) -> &SigningPhase {
        &self.phase
    }

    pub fn signers(&self) -> &[u16] {
        &self.signers
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    fn ensure_active(&self) -> Result<()> {
        if self.cancelled {
            return Err(FrostError::Cancelled);
        }
        if let SigningPhase::Failed(reason) = &self.phase {
            return Err(FrostError::InvalidState(format!(
                "signing already failed: {}",
                reason
            )));
        }
        Ok(())
    }

    fn fail<T>(&mut self, err: FrostError) -> Result<T> {
        self.phase = SigningPhase::Failed(err.to_string());
        Err(err)
    }

    fn is_signer(&self, index: u16) -> bool {
        self.signers.binary_search(&index).is_ok()
    }

    /// Generates this signer's nonce commitment. Single-shot; the returned
    /// bytes are broadcast to every chosen signer (self-loopback included).
    pub fn generate_commitment(&mut self) -> Result<Vec<u8>> {
        self.ensure_active()?;
        if self.phase != SigningPhase::CommitmentPhase {
            return Err(FrostError::InvalidState(format!(
                "generate_commitment in {:?}",
                self.phase
            )));
        }
        if self.nonces.is_some() {
            return Err(FrostError::InvalidState(
                "commitment already generated for this attempt".into(),
            ));
        }

        let mut rng = OsRng;
        let (nonces, commitments) =
            frost_core::round1::commit(self.key_package.signing_share(), &mut rng);
        let bytes = commitments
            .serialize()
            .map_err(|e| FrostError::SerializationError(e.to_string()))?;
        self.nonces = Some(nonces);
        Ok(bytes)
    }

    /// Absorbs a commitment from a chosen signer.
    pub fn add_commitment(&mut self, sender_index: u16, commitment_bytes: &[u8]) -> Result<()> {
        self.ensure_active()?;
        if self.phase != SigningPhase::CommitmentPhase {
            return Err(FrostError::InvalidState(format!(
                "commitment in {:?}",
                self.phase
            )));
        }
        if !self.is_signer(sender_index) {
            return self.fail(FrostError::InvalidPackage(format!(
                "commitment from non-signer {}",
                sender_index
            )));
        }

        let sender = identifier_from_index::<C>(sender_index)?;
        if self.commitments.contains_key(&sender) {
            return self.fail(FrostError::DuplicatePackage {
                round: 1,
                sender: sender_index,
            });
        }

        let commitment = match SigningCommitments::<C>::deserialize(commitment_bytes) {
            Ok(c) => c,
            Err(e) => {
                return self.fail(FrostError::InvalidPackage(format!(
                    "commitment from {}: {}",
                    sender_index, e
                )));
            }
        };

        self.commitments.insert(sender, commitment);
        Ok(())
    }

    /// Whether this signer's commitment has been absorbed.
    pub fn has_commitment(&self, sender_index: u16) -> bool {
        identifier_from_index::<C>(sender_index)
            .map(|id| self.commitments.contains_key(&id))
            .unwrap_or(false)
    }

    /// Whether this signer's signature share has been absorbed.
    pub fn has_share(&self, sender_index: u16) -> bool {
        identifier_from_index::<C>(sender_index)
            .map(|id| self.shares.contains_key(&id))
            .unwrap_or(false)
    }

    /// True once every chosen signer's commitment (ours included) is present.
    pub fn commitments_ready(&self) -> bool {
        self.phase == SigningPhase::CommitmentPhase && self.commitments.len() == self.signers.len()
    }

    /// Builds the signing package from the full commitment set and produces
    /// this signer's signature share. Transitions to `SharePhase`.
    pub fn generate_signature_share(&mut self) -> Result<Vec<u8>> {
        self.ensure_active()?;
        if !self.commitments_ready() {
            return Err(FrostError::InvalidState(format!(
                "signature share requested with {}/{} commitments",
                self.commitments.len(),
                self.signers.len()
            )));
        }
        let nonces = self
            .nonces
            .as_ref()
            .ok_or_else(|| FrostError::InvalidState("no local nonces for this attempt".into()))?;

        let signing_package = SigningPackage::new(self.commitments.clone(), &self.message);
        let share = match frost_core::round2::sign(&signing_package, nonces, &self.key_package) {
            Ok(share) => share,
            Err(e) => {
                return self.fail(FrostError::SigningError(format!(
                    "failed to generate signature share: {}",
                    e
                )));
            }
        };

        let bytes = share.serialize();
        self.signing_package = Some(signing_package);
        self.phase = SigningPhase::SharePhase;
        Ok(bytes)
    }

    /// Absorbs a signature share from a chosen signer.
    pub fn add_signature_share(&mut self, sender_index: u16, share_bytes: &[u8]) -> Result<()> {
        self.ensure_active()?;
        if self.phase != SigningPhase::SharePhase {
            return Err(FrostError::InvalidState(format!(
                "signature share in {:?}",
                self.phase
            )));
        }
        if !self.is_signer(sender_index) {
            return self.fail(FrostError::InvalidPackage(format!(
                "signature share from non-signer {}",
                sender_index
            )));
        }

        let sender = identifier_from_index::<C>(sender_index)?;
        if self.shares.contains_key(&sender) {
            return self.fail(FrostError::DuplicatePackage {
                round: 2,
                sender: sender_index,
            });
        }

        let share = match SignatureShare::<C>::deserialize(share_bytes) {
            Ok(s) => s,
            Err(e) => {
                return self.fail(FrostError::InvalidPackage(format!(
                    "signature share from {}: {}",
                    sender_index, e
                )));
            }
        };

        self.shares.insert(sender, share);
        Ok(())
    }

    /// True once every chosen signer's share (ours included) is present.
    pub fn shares_ready(&self) -> bool {
        self.phase == SigningPhase::SharePhase && self.shares.len() == self.signers.len()
    }

    /// Aggregates the shares into the final group signature and verifies it
    /// under the group public key before returning it.
    ///
    /// A signature that does not verify is an `AggregationFailure` and fails
    /// the attempt; it is never returned to the caller.
    pub fn aggregate(&mut self) -> Result<Vec<u8>> {
        self.ensure_active()?;
        if !self.shares_ready() {
            return Err(FrostError::InvalidState(format!(
                "aggregate requested with {}/{} shares",
                self.shares.len(),
                self.signers.len()
            )));
        }
        let signing_package = self
            .signing_package
            .as_ref()
            .ok_or_else(|| FrostError::InvalidState("missing signing package".into()))?;

        let signature =
            match frost_core::aggregate(signing_package, &self.shares, &self.public_key_package) {
                Ok(sig) => sig,
                Err(e) => return self.fail(FrostError::SigningError(e.to_string())),
            };

        if self
            .public_key_package
            .verifying_key()
            .verify(&self.message, &signature)
            .is_err()
        {
            return self.fail(FrostError::AggregationFailure);
        }

        let bytes = signature
            .serialize()
            .map_err(|e| FrostError::SerializationError(e.to_string()))?;
        self.signature = Some(bytes.clone());
        self.phase = SigningPhase::Complete;
        Ok(bytes)
    }

    /// The final signature, available once `Complete`.
    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dkg::tests::run_dkg;
    use crate::dkg::DkgEngine;
    use frost_ed25519::Ed25519Sha512;
    use frost_secp256k1::Secp256K1Sha256;

    /// Runs one full signing attempt over the given signer subset and
    /// returns each signer's aggregated signature.
    fn run_signing<C: Ciphersuite>(
        dkg: &[DkgEngine<C>],
        signers: &[u16],
        message: &[u8],
    ) -> Vec<Vec<u8>> {
        let mut engines: Vec<SigningEngine<C>> = signers
            .iter()
            .map(|&index| {
                let source = &dkg[(index - 1) as usize];
                SigningEngine::new(
                    "sign-test",
                    message.to_vec(),
                    index,
                    signers,
                    source.key_package().unwrap().clone(),
                    source.public_key_package().unwrap().clone(),
                )
                .unwrap()
            })
            .collect();

        let commitments: Vec<Vec<u8>> = engines
            .iter_mut()
            .map(|e| e.generate_commitment().unwrap())
            .collect();
        for engine in engines.iter_mut() {
            for (i, bytes) in commitments.iter().enumerate() {
                engine.add_commitment(signers[i], bytes).unwrap();
            }
            assert!(engine.commitments_ready());
        }

        let shares: Vec<Vec<u8>> = engines
            .iter_mut()
            .map(|e| e.generate_signature_share().unwrap())
            .collect();
        for engine in engines.iter_mut() {
            for (i, bytes) in shares.iter().enumerate() {
                engine.add_signature_share(signers[i], bytes).unwrap();
            }
            assert!(engine.shares_ready());
        }

        engines.iter_mut().map(|e| e.aggregate().unwrap()).collect()
    }

    #[test]
    fn threshold_subsets_produce_verifying_signatures() {
        let message = b"share binding across subsets";
        let dkg = run_dkg::<Secp256K1Sha256>(2, 3);
        for signers in [[1u16, 2], [1, 3], [2, 3]] {
            let signatures = run_signing(&dkg, &signers, message);
            // Aggregation is deterministic: every signer gets the same bytes.
            for sig in &signatures {
                assert_eq!(sig, &signatures[0]);
            }
        }
    }

    #[test]
    fn full_signer_set_also_works() {
        let message = b"all three of us";
        let dkg = run_dkg::<Ed25519Sha512>(2, 3);
        let signatures = run_signing(&dkg, &[1, 2, 3], message);
        assert_eq!(signatures[0].len(), 64);
    }

    #[test]
    fn below_threshold_signer_set_is_refused() {
        let dkg = run_dkg::<Ed25519Sha512>(2, 3);
        let err = SigningEngine::new(
            "sign-short",
            b"msg".to_vec(),
            1,
            &[1],
            dkg[0].key_package().unwrap().clone(),
            dkg[0].public_key_package().unwrap().clone(),
        )
        .unwrap_err();
        assert!(matches!(err, FrostError::InvalidParams(_)));
    }

    #[test]
    fn signer_set_must_include_self() {
        let dkg = run_dkg::<Ed25519Sha512>(2, 3);
        let err = SigningEngine::new(
            "sign-absent",
            b"msg".to_vec(),
            1,
            &[2, 3],
            dkg[0].key_package().unwrap().clone(),
            dkg[0].public_key_package().unwrap().clone(),
        )
        .unwrap_err();
        assert!(matches!(err, FrostError::InvalidParams(_)));
    }

    #[test]
    fn commitment_from_non_signer_is_fatal() {
        let dkg = run_dkg::<Secp256K1Sha256>(2, 3);
        let mut engine = SigningEngine::new(
            "sign-outsider",
            b"msg".to_vec(),
            1,
            &[1, 2],
            dkg[0].key_package().unwrap().clone(),
            dkg[0].public_key_package().unwrap().clone(),
        )
        .unwrap();
        let own = engine.generate_commitment().unwrap();
        let err = engine.add_commitment(3, &own).unwrap_err();
        assert!(matches!(err, FrostError::InvalidPackage(_)));
        assert!(matches!(engine.phase(), SigningPhase::Failed(_)));
    }

    #[test]
    fn duplicate_commitment_is_fatal() {
        let dkg = run_dkg::<Secp256K1Sha256>(2, 2);
        let mut engine = SigningEngine::new(
            "sign-dup",
            b"msg".to_vec(),
            1,
            &[1, 2],
            dkg[0].key_package().unwrap().clone(),
            dkg[0].public_key_package().unwrap().clone(),
        )
        .unwrap();
        let own = engine.generate_commitment().unwrap();
        engine.add_commitment(1, &own).unwrap();
        let err = engine.add_commitment(1, &own).unwrap_err();
        assert!(matches!(err, FrostError::DuplicatePackage { round: 1, .. }));
    }

    /// All k-subsets of `pool`, smallest-first.
    fn subsets(pool: &[u16], k: usize) -> Vec<Vec<u16>> {
        if k == 0 {
            return vec![Vec::new()];
        }
        if pool.len() < k {
            return Vec::new();
        }
        let mut out = Vec::new();
        let head = pool[0];
        for mut with_head in subsets(&pool[1..], k - 1) {
            with_head.insert(0, head);
            out.push(with_head);
        }
        out.extend(subsets(&pool[1..], k));
        out
    }

    #[test]
    fn every_threshold_subset_signs_for_small_configs() {
        let message = b"share binding sweep";
        for (threshold, total) in [(1u16, 2u16), (2, 2), (2, 3), (3, 4), (2, 5)] {
            let dkg = run_dkg::<Ed25519Sha512>(threshold, total);
            let pool: Vec<u16> = (1..=total).collect();
            for signers in subsets(&pool, threshold as usize) {
                let signatures = run_signing(&dkg, &signers, message);
                for sig in &signatures {
                    assert_eq!(
                        sig, &signatures[0],
                        "{threshold}-of-{total} subset {signers:?} disagreed"
                    );
                }
            }
        }
    }

    #[test]
    fn signatures_bind_to_the_message() {
        let dkg = run_dkg::<Secp256K1Sha256>(2, 3);
        let sig_a = run_signing(&dkg, &[1, 2], b"message a");
        let sig_b = run_signing(&dkg, &[1, 2], b"message b");
        assert_ne!(sig_a[0], sig_b[0]);
    }
}
