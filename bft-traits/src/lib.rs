// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! # BFT Consensus Contracts
//!
//! Wire types and trait seams shared between the consensus engine and the
//! node embedding it.
//!
//! The crate is organized around the boundary of the core engine:
//!
//! - [`types`] - Views, votes and quorum certificates
//! - [`message`] - The signed wire message envelope
//! - [`extra`] - The block header extra-data codec
//! - [`validator`] - Ordered validator sets, leader election and quorum math
//! - [`backend`] - The [`Backend`] contract the engine drives, and the
//!   [`CoreEngine`] contract the node drives
//! - [`signer`] - Key material abstraction used to seal messages and votes
//!
//! The engine itself lives in the `bft-core` crate and is generic over a
//! [`Proposal`] implementation; everything here is concrete so that two
//! nodes built on different block types still speak the same wire format.

pub mod backend;
pub mod config;
pub mod error;
pub mod extra;
pub mod message;
pub mod proposal;
pub mod signer;
pub mod types;
pub mod validator;

pub use backend::{Backend, CoreEngine, CoreEvent, EventMux};
pub use config::Config;
pub use error::ConsensusError;
pub use extra::{BftExtra, BFT_DIGEST, EXTRA_SEAL, EXTRA_VANITY};
pub use message::{Message, MsgType};
pub use proposal::{Proposal, Request};
pub use signer::{KeySigner, Signer};
pub use types::{NewViewMsg, PrepareMsg, QuorumCert, View, Vote};
pub use validator::{LeaderPolicy, ValidatorSet};
