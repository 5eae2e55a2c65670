// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Header extra-data codec.
//!
//! The block header's `extra` field carries the consensus payload:
//!
//! - bytes `[0, 32)`: validator vanity, zero padded
//! - bytes `[32, ..)`: RLP of [`BftExtra`]
//!
//! The proposer seal and the committed seals are zeroed before hashing, so
//! sealing a block never changes its hash.

use alloy_primitives::{b256, Address, Bytes, B256};
use alloy_rlp::{RlpDecodable, RlpEncodable};

use crate::error::ConsensusError;

/// Number of extra-data bytes reserved for validator vanity.
pub const EXTRA_VANITY: usize = 32;

/// Length of a secp256k1 seal (r || s || v).
pub const EXTRA_SEAL: usize = 65;

/// Sentinel stored in the header's `mix_digest` to mark blocks produced by
/// this engine.
pub const BFT_DIGEST: B256 =
    b256!("63746963616c2062797a616e74696e65206661756c7420746f6c6572616e6365");

/// Consensus fields serialized after the vanity prefix.
///
/// `validators` is non-empty only when the block announces the validator
/// set of the next epoch. `salt` is opaque to the protocol; sealed blocks
/// use it to carry the RLP of the commit round.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct BftExtra {
    pub validators: Vec<Address>,
    pub seal: Bytes,
    pub committed_seal: Vec<Bytes>,
    pub salt: Bytes,
}

impl BftExtra {
    /// Decode the consensus fields from a full extra-data byte string.
    pub fn decode_extra(extra: &[u8]) -> Result<Self, ConsensusError> {
        if extra.len() < EXTRA_VANITY {
            return Err(ConsensusError::InvalidProposal(format!(
                "extra-data shorter than the {EXTRA_VANITY}-byte vanity"
            )));
        }
        Ok(alloy_rlp::decode_exact(&extra[EXTRA_VANITY..])?)
    }

    /// Re-assemble a full extra-data byte string, normalizing the vanity to
    /// exactly [`EXTRA_VANITY`] bytes.
    pub fn encode_extra(&self, vanity: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; EXTRA_VANITY];
        let n = vanity.len().min(EXTRA_VANITY);
        out[..n].copy_from_slice(&vanity[..n]);
        out.extend_from_slice(&alloy_rlp::encode(self));
        out
    }

    /// The commit round recorded in `salt`, or 0 when absent.
    pub fn salt_round(&self) -> u64 {
        if self.salt.is_empty() {
            return 0;
        }
        alloy_rlp::decode_exact::<u64>(self.salt.as_ref()).unwrap_or(0)
    }
}

/// Return a copy of `extra` with the committed seals cleared and, unless
/// `keep_seal`, the proposer seal cleared as well. This is the form the
/// block hash is computed over.
pub fn filtered_extra(extra: &[u8], keep_seal: bool) -> Result<Vec<u8>, ConsensusError> {
    let mut decoded = BftExtra::decode_extra(extra)?;
    if !keep_seal {
        decoded.seal = Bytes::new();
    }
    decoded.committed_seal = Vec::new();
    Ok(decoded.encode_extra(&extra[..EXTRA_VANITY]))
}

/// Write a validator list into `extra`, preserving the vanity and clearing
/// all seals. Used when building checkpoint headers.
pub fn fill_validators(extra: &[u8], validators: &[Address]) -> Vec<u8> {
    let decoded = BftExtra {
        validators: validators.to_vec(),
        seal: Bytes::new(),
        committed_seal: Vec::new(),
        salt: Bytes::new(),
    };
    decoded.encode_extra(extra)
}

/// Generate the genesis extra-data hex for a validator list: a zero vanity
/// followed by the RLP of a [`BftExtra`] carrying an all-zero proposer seal.
pub fn genesis_extra(validators: &[Address]) -> String {
    let extra = BftExtra {
        validators: validators.to_vec(),
        seal: Bytes::from(vec![0u8; EXTRA_SEAL]),
        committed_seal: Vec::new(),
        salt: Bytes::new(),
    };
    format!("0x{}", alloy_primitives::hex::encode(extra.encode_extra(&[])))
}
