// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Key material abstraction.
//!
//! The engine only ever asks for the local address and for recoverable
//! signatures over 32-byte digests; recovery itself is a pure function and
//! needs no key.

use alloy_primitives::{keccak256, Address, Signature, B256};
use k256::ecdsa::SigningKey;

use crate::error::ConsensusError;

/// Produces the seals this node attaches to messages and votes.
pub trait Signer: Send + Sync {
    /// The validator address of this node.
    fn address(&self) -> Address;

    /// Sign a 32-byte digest with a recoverable secp256k1 signature.
    fn sign_hash(&self, hash: B256) -> Result<Signature, ConsensusError>;
}

/// In-process signer over a raw secp256k1 key.
#[derive(Clone)]
pub struct KeySigner {
    key: SigningKey,
    address: Address,
}

impl KeySigner {
    pub fn new(key: SigningKey) -> Self {
        let point = key.verifying_key().to_encoded_point(false);
        let digest = keccak256(&point.as_bytes()[1..]);
        let address = Address::from_slice(&digest[12..]);
        Self { key, address }
    }

    /// Deterministic signer derived from a seed. Test and tooling helper;
    /// real deployments load keys from the node's keystore.
    pub fn from_seed(seed: u64) -> Self {
        let mut material = keccak256(seed.to_be_bytes());
        loop {
            if let Ok(key) = SigningKey::from_slice(material.as_slice()) {
                return Self::new(key);
            }
            material = keccak256(material);
        }
    }
}

impl Signer for KeySigner {
    fn address(&self) -> Address {
        self.address
    }

    fn sign_hash(&self, hash: B256) -> Result<Signature, ConsensusError> {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(hash.as_slice())
            .map_err(|e| ConsensusError::Signer(e.to_string()))?;
        Ok(Signature::from_signature_and_parity(
            signature,
            recovery_id.is_y_odd(),
        ))
    }
}

impl std::fmt::Debug for KeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
