// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! The proposal capability the engine is generic over.

use alloy_primitives::B256;
use alloy_rlp::{Decodable, Encodable};
use std::fmt::Debug;

/// An opaque block reference the engine agrees on.
///
/// The engine never inspects block contents: it orders proposals by hash and
/// number, and threads the header extra-data through the seal path. Sealing
/// itself (`WithSeal` in the original model) happens behind the
/// [`Backend`](crate::backend::Backend) so that the hash rules of the
/// embedding chain stay in one place.
pub trait Proposal: Clone + Debug + Encodable + Decodable + Send + Sync + 'static {
    /// Hash of the block with the seals filtered out.
    fn hash(&self) -> B256;

    /// Block number.
    fn number(&self) -> u64;

    /// The header extra-data bytes, including the vanity prefix.
    fn extra(&self) -> &[u8];
}

/// A leader-local pending proposal, waiting for the protocol to reach the
/// height it belongs to.
#[derive(Clone, Debug)]
pub struct Request<P> {
    pub proposal: P,
}

impl<P: Proposal> Request<P> {
    pub fn new(proposal: P) -> Self {
        Self { proposal }
    }
}
