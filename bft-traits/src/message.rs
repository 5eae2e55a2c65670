// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! The signed wire envelope every consensus message travels in.

use alloy_primitives::{keccak256, Address, Bytes, B256};
use alloy_rlp::{Decodable, RlpDecodable, RlpEncodable};
use std::fmt;

use crate::error::ConsensusError;
use crate::signer::Signer;
use crate::types::recover_seal;

/// Message codes of the pipelined protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MsgType {
    NewView = 1,
    Prepare = 2,
    PrepareVote = 3,
    PreCommit = 4,
    PreCommitVote = 5,
    Commit = 6,
    CommitVote = 7,
    Decide = 8,
}

impl MsgType {
    /// Vote codes carry a committed seal next to the envelope signature.
    pub fn is_vote(&self) -> bool {
        matches!(
            self,
            MsgType::PrepareVote | MsgType::PreCommitVote | MsgType::CommitVote
        )
    }
}

impl TryFrom<u64> for MsgType {
    type Error = ConsensusError;

    fn try_from(code: u64) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(MsgType::NewView),
            2 => Ok(MsgType::Prepare),
            3 => Ok(MsgType::PrepareVote),
            4 => Ok(MsgType::PreCommit),
            5 => Ok(MsgType::PreCommitVote),
            6 => Ok(MsgType::Commit),
            7 => Ok(MsgType::CommitVote),
            8 => Ok(MsgType::Decide),
            other => Err(ConsensusError::InvalidMessage(other)),
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MsgType::NewView => "NewView",
            MsgType::Prepare => "Prepare",
            MsgType::PrepareVote => "PrepareVote",
            MsgType::PreCommit => "PreCommit",
            MsgType::PreCommitVote => "PreCommitVote",
            MsgType::Commit => "Commit",
            MsgType::CommitVote => "CommitVote",
            MsgType::Decide => "Decide",
        };
        f.write_str(name)
    }
}

/// Signed consensus message.
///
/// Wire form is the RLP of all five fields. The envelope signature covers
/// the keccak digest of the same encoding with `signature` emptied, so a
/// receiver can recover the signer and compare it against `address`.
///
/// For vote messages, `committed_seal` additionally carries the sender's
/// signature over the vote digest; the leader aggregates those seals into a
/// quorum certificate.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Message {
    pub code: u64,
    pub msg: Bytes,
    pub address: Address,
    pub signature: Bytes,
    pub committed_seal: Bytes,
}

impl Message {
    /// Build an unsigned message; [`Message::sign`] fills in the sender.
    pub fn new(code: MsgType, msg: Bytes) -> Self {
        Self {
            code: code as u64,
            msg,
            address: Address::ZERO,
            signature: Bytes::new(),
            committed_seal: Bytes::new(),
        }
    }

    pub fn msg_type(&self) -> Result<MsgType, ConsensusError> {
        MsgType::try_from(self.code)
    }

    /// Full wire encoding.
    pub fn payload(&self) -> Bytes {
        alloy_rlp::encode(self).into()
    }

    fn payload_no_sig(&self) -> Vec<u8> {
        let unsigned = Self {
            signature: Bytes::new(),
            ..self.clone()
        };
        alloy_rlp::encode(&unsigned)
    }

    /// Digest the envelope signature covers.
    pub fn seal_hash(&self) -> B256 {
        keccak256(self.payload_no_sig())
    }

    /// Stamp the sender address and sign the envelope. Any committed seal
    /// must be attached before signing since the signature covers it.
    pub fn sign(&mut self, signer: &dyn Signer) -> Result<(), ConsensusError> {
        self.address = signer.address();
        let signature = signer.sign_hash(self.seal_hash())?;
        self.signature = signature.as_bytes().to_vec().into();
        Ok(())
    }

    /// Decode a wire payload and authenticate the sender.
    pub fn from_payload(payload: &[u8]) -> Result<Self, ConsensusError> {
        let msg = Self::decode(&mut &payload[..])?;
        let signer = recover_seal(&msg.signature, msg.seal_hash())?;
        if signer != msg.address {
            return Err(ConsensusError::InvalidSigner);
        }
        Ok(msg)
    }

    /// Decode the phase payload carried in `msg`.
    pub fn decode_data<T: Decodable>(&self) -> Result<T, ConsensusError> {
        Ok(T::decode(&mut self.msg.as_ref())?)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{code: {}, address: {}}}", self.code, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::KeySigner;
    use crate::types::{View, Vote};

    fn signed_vote_message(signer: &KeySigner) -> Message {
        let vote = Vote::new(View::new(1, 0), B256::repeat_byte(0x42));
        let mut msg = Message::new(MsgType::PrepareVote, alloy_rlp::encode(&vote).into());
        let seal = signer.sign_hash(vote.seal_hash()).unwrap();
        msg.committed_seal = seal.as_bytes().to_vec().into();
        msg.sign(signer).unwrap();
        msg
    }

    #[test]
    fn test_sign_then_recover_returns_signer() {
        let signer = KeySigner::from_seed(1);
        let msg = signed_vote_message(&signer);

        let decoded = Message::from_payload(&msg.payload()).unwrap();
        assert_eq!(decoded.address, signer.address());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_tampered_address_is_rejected() {
        let signer = KeySigner::from_seed(2);
        let mut msg = signed_vote_message(&signer);
        msg.address = KeySigner::from_seed(3).address();

        let err = Message::from_payload(&msg.payload()).unwrap_err();
        assert!(matches!(err, ConsensusError::InvalidSigner));
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let signer = KeySigner::from_seed(4);
        let mut msg = signed_vote_message(&signer);
        msg.msg = Bytes::from(vec![0xde, 0xad]);

        let err = Message::from_payload(&msg.payload()).unwrap_err();
        assert!(matches!(err, ConsensusError::InvalidSigner));
    }

    #[test]
    fn test_garbage_payload_is_a_decode_error() {
        let err = Message::from_payload(&[0x01, 0x02, 0x03]).unwrap_err();
        assert!(matches!(err, ConsensusError::Decode(_)));
    }

    #[test]
    fn test_signature_covers_committed_seal() {
        let signer = KeySigner::from_seed(5);
        let mut msg = signed_vote_message(&signer);
        // Swapping the seal after signing must invalidate the envelope.
        msg.committed_seal = Bytes::from(vec![0u8; 65]);

        let err = Message::from_payload(&msg.payload()).unwrap_err();
        assert!(matches!(err, ConsensusError::InvalidSigner));
    }

    #[test]
    fn test_msg_type_codes() {
        for code in 1..=8u64 {
            let ty = MsgType::try_from(code).unwrap();
            assert_eq!(ty as u64, code);
        }
        assert!(MsgType::try_from(0).is_err());
        assert!(MsgType::try_from(9).is_err());
    }

    #[test]
    fn test_vote_codes_are_votes() {
        assert!(MsgType::PrepareVote.is_vote());
        assert!(MsgType::PreCommitVote.is_vote());
        assert!(MsgType::CommitVote.is_vote());
        assert!(!MsgType::NewView.is_vote());
        assert!(!MsgType::Prepare.is_vote());
        assert!(!MsgType::Decide.is_vote());
    }
}
