// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Error kinds surfaced by the consensus engine.
//!
//! Local message drops never fault the event loop: handlers log the error
//! with context and return to the loop. Only the startup path (epoch
//! loading) is allowed to propagate an unrecoverable error to the caller.

use std::time::Duration;
use thiserror::Error;

/// Errors produced while validating and processing consensus messages.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// Malformed RLP in an inbound payload.
    #[error("failed to decode payload: {0}")]
    Decode(#[from] alloy_rlp::Error),

    /// The recovered signer does not match the address carried in the
    /// message, or the signature bytes are not a valid 65-byte seal.
    #[error("signature does not match the sender address")]
    InvalidSigner,

    /// The sender is not a member of the current validator set.
    #[error("message sender is not a validator")]
    UnauthorizedAddress,

    /// The message view is behind the current view.
    #[error("old message")]
    OldMessage,

    /// The message view is ahead of the current view. The caller stores the
    /// message in the backlog instead of dropping it.
    #[error("future message")]
    FutureMessage,

    /// A proposal request for an already decided height.
    #[error("old request")]
    OldRequest,

    /// A proposal request for a height the engine has not reached yet.
    #[error("future request")]
    FutureRequest,

    /// Unknown message code on the wire.
    #[error("unknown message code {0}")]
    InvalidMessage(u64),

    /// A leader-only message arrived from a non-proposer.
    #[error("message is not from the proposer")]
    NotFromProposer,

    /// The proposal or vote content is inconsistent with the round state.
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),

    /// A vote whose digest does not match the proposal under vote.
    #[error("vote digest does not match the current proposal")]
    InconsistentVote,

    /// A quorum certificate failed validation.
    #[error("invalid quorum certificate: {0}")]
    InvalidQuorumCert(String),

    /// Fewer distinct valid committers than the quorum threshold.
    #[error("quorum not reached: {got} of {want} required seals")]
    QuorumNotReached { got: usize, want: usize },

    /// The message is for the current view but its state precondition is
    /// unmet. Such messages are dropped, not backlogged.
    #[error("state precondition unmet: {0}")]
    StateMismatch(&'static str),

    /// The proposal carries a timestamp ahead of local time; retry after
    /// the given duration.
    #[error("proposal is from the future, retry in {0:?}")]
    FutureBlock(Duration),

    /// The engine is not running.
    #[error("engine stopped")]
    EngineStopped,

    /// Signing failure from the key backend.
    #[error("signer failure: {0}")]
    Signer(String),

    /// Failure reported by the backend adapter.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl ConsensusError {
    /// True for view-skew errors that are expected during normal operation
    /// and logged at a low level.
    pub fn is_view_skew(&self) -> bool {
        matches!(self, Self::OldMessage | Self::FutureMessage)
    }
}
