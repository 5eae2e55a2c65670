// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Core protocol types: views, votes and quorum certificates.

use alloy_primitives::{keccak256, Address, Bytes, Signature, B256};
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};
use std::fmt;

use crate::error::ConsensusError;
use crate::validator::ValidatorSet;

/// Identifier of one consensus attempt.
///
/// Views are totally ordered lexicographically: all rounds of height `h`
/// sort before every round of height `h + 1`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, RlpEncodable, RlpDecodable,
)]
pub struct View {
    pub height: u64,
    pub round: u64,
}

impl View {
    pub fn new(height: u64, round: u64) -> Self {
        Self { height, round }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{height: {}, round: {}}}", self.height, self.round)
    }
}

/// The payload an attester signs for `PrepareVote`, `PreCommitVote` and
/// `CommitVote`.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Vote {
    pub view: View,
    pub digest: B256,
}

impl Vote {
    pub fn new(view: View, digest: B256) -> Self {
        Self { view, digest }
    }

    /// Digest a committed seal signs: `keccak256(rlp(self))`.
    pub fn seal_hash(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{view: {}, digest: {}}}", self.view, self.digest)
    }
}

/// A self-authenticating proof that a quorum of validators signed the same
/// vote.
///
/// `seals` holds at least `Q = ceil(2n/3)` signatures of
/// `Vote { view, hash }`, each from a distinct validator of the epoch the
/// view belongs to. `extra` carries the header extra-data of the certified
/// proposal; after commit it is the sealed extra embedding the seals.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct QuorumCert {
    pub view: View,
    pub proposer: Address,
    pub hash: B256,
    pub extra: Bytes,
    pub seals: Vec<Bytes>,
}

impl QuorumCert {
    /// The digest every seal in this certificate must sign.
    pub fn seal_hash(&self) -> B256 {
        Vote::new(self.view, self.hash).seal_hash()
    }

    pub fn seal_count(&self) -> usize {
        self.seals.len()
    }

    /// Recover the signer of every seal.
    ///
    /// Fails if any seal is not a valid 65-byte recoverable signature.
    pub fn committers(&self) -> Result<Vec<Address>, ConsensusError> {
        let digest = self.seal_hash();
        self.seals
            .iter()
            .map(|seal| recover_seal(seal, digest))
            .collect()
    }

    /// Verify that the seals form a quorum of the given validator set.
    pub fn verify(&self, val_set: &ValidatorSet) -> Result<(), ConsensusError> {
        let committers = self.committers()?;
        val_set.check_quorum(&committers)
    }
}

impl fmt::Display for QuorumCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{view: {}, hash: {}, seals: {}}}",
            self.view,
            self.hash,
            self.seals.len()
        )
    }
}

/// Recover the signer address of a 65-byte seal over `digest`.
pub fn recover_seal(seal: &[u8], digest: B256) -> Result<Address, ConsensusError> {
    let signature = Signature::from_raw(seal).map_err(|_| ConsensusError::InvalidSigner)?;
    signature
        .recover_address_from_prehash(&digest)
        .map_err(|_| ConsensusError::InvalidSigner)
}

/// `NewView` payload: the sender's highest `prepareQC`, tagged with the view
/// the sender is entering. The tag is needed because the certificate usually
/// points at the previous height.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct NewViewMsg {
    pub view: View,
    pub prepare_qc: QuorumCert,
}

/// `Prepare` payload: the leader's proposal together with the highest
/// `prepareQC` across the `NewView` messages it collected.
///
/// The proposal travels pre-encoded so the envelope stays independent of the
/// concrete block type.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct PrepareMsg {
    pub view: View,
    pub proposal: Bytes,
    pub high_qc: QuorumCert,
}

impl PrepareMsg {
    pub fn encode_proposal<P: Encodable>(view: View, proposal: &P, high_qc: QuorumCert) -> Self {
        Self {
            view,
            proposal: alloy_rlp::encode(proposal).into(),
            high_qc,
        }
    }

    pub fn decode_proposal<P: Decodable>(&self) -> Result<P, ConsensusError> {
        Ok(P::decode(&mut self.proposal.as_ref())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::{KeySigner, Signer};
    use crate::validator::LeaderPolicy;

    #[test]
    fn test_view_ordering_is_lexicographic() {
        let a = View::new(1, 5);
        let b = View::new(2, 0);
        let c = View::new(2, 1);

        assert!(a < b);
        assert!(b < c);
        assert!(View::new(1, 0) < View::new(1, 1));
        assert_eq!(View::new(3, 3), View::new(3, 3));
    }

    #[test]
    fn test_view_rlp_round_trip() {
        let view = View::new(7, 2);
        let encoded = alloy_rlp::encode(view);
        let decoded = View::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(view, decoded);
    }

    #[test]
    fn test_vote_seal_hash_binds_view_and_digest() {
        let digest = B256::repeat_byte(0xab);
        let v1 = Vote::new(View::new(1, 0), digest);
        let v2 = Vote::new(View::new(1, 1), digest);
        let v3 = Vote::new(View::new(1, 0), B256::repeat_byte(0xac));

        assert_ne!(v1.seal_hash(), v2.seal_hash());
        assert_ne!(v1.seal_hash(), v3.seal_hash());
        assert_eq!(v1.seal_hash(), Vote::new(View::new(1, 0), digest).seal_hash());
    }

    #[test]
    fn test_quorum_cert_verify_accepts_quorum_of_seals() {
        let signers: Vec<KeySigner> = (0..4).map(KeySigner::from_seed).collect();
        let addrs: Vec<Address> = signers.iter().map(|s| s.address()).collect();
        let val_set = ValidatorSet::new(addrs, LeaderPolicy::RoundRobin);

        let mut qc = QuorumCert {
            view: View::new(1, 0),
            proposer: signers[0].address(),
            hash: B256::repeat_byte(0x11),
            extra: Bytes::new(),
            seals: Vec::new(),
        };
        let digest = qc.seal_hash();
        for signer in signers.iter().take(3) {
            let sig = signer.sign_hash(digest).unwrap();
            qc.seals.push(sig.as_bytes().to_vec().into());
        }

        assert!(qc.verify(&val_set).is_ok());
        assert_eq!(qc.committers().unwrap().len(), 3);
    }

    #[test]
    fn test_quorum_cert_verify_rejects_below_quorum() {
        let signers: Vec<KeySigner> = (0..4).map(KeySigner::from_seed).collect();
        let addrs: Vec<Address> = signers.iter().map(|s| s.address()).collect();
        let val_set = ValidatorSet::new(addrs, LeaderPolicy::RoundRobin);

        let mut qc = QuorumCert {
            view: View::new(1, 0),
            proposer: signers[0].address(),
            hash: B256::repeat_byte(0x22),
            extra: Bytes::new(),
            seals: Vec::new(),
        };
        let digest = qc.seal_hash();
        for signer in signers.iter().take(2) {
            let sig = signer.sign_hash(digest).unwrap();
            qc.seals.push(sig.as_bytes().to_vec().into());
        }

        assert!(qc.verify(&val_set).is_err());
    }

    #[test]
    fn test_quorum_cert_rejects_foreign_seal() {
        let signers: Vec<KeySigner> = (0..4).map(KeySigner::from_seed).collect();
        let addrs: Vec<Address> = signers.iter().take(3).map(|s| s.address()).collect();
        // Validator 3 is outside the set.
        let val_set = ValidatorSet::new(addrs, LeaderPolicy::RoundRobin);

        let mut qc = QuorumCert {
            view: View::new(2, 0),
            proposer: signers[0].address(),
            hash: B256::repeat_byte(0x33),
            extra: Bytes::new(),
            seals: Vec::new(),
        };
        let digest = qc.seal_hash();
        for signer in [&signers[0], &signers[1], &signers[3]] {
            let sig = signer.sign_hash(digest).unwrap();
            qc.seals.push(sig.as_bytes().to_vec().into());
        }

        assert!(qc.verify(&val_set).is_err());
    }

    #[test]
    fn test_prepare_msg_proposal_round_trip() {
        // A plain RLP value stands in for the block type.
        let payload: Vec<u8> = vec![1, 2, 3, 4];
        let msg = PrepareMsg::encode_proposal(View::new(3, 1), &payload, QuorumCert::default());
        let decoded: Vec<u8> = msg.decode_proposal().unwrap();
        assert_eq!(decoded, payload);
    }
}
