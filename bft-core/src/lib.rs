// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! # BFT Consensus Engine
//!
//! A pipelined HotStuff-family consensus core. One validator runs one
//! [`Core`](engine::Core); per height the engine elects a leader, runs the
//! `NewView -> Prepare -> PrepareVote -> PreCommit -> PreCommitVote ->
//! Commit -> CommitVote -> Decide` exchange, and hands exactly one sealed
//! proposal back to the node for insertion.
//!
//! ## Architecture
//!
//! - [`engine`] - Round state, phase handlers, backlog and the event loop
//! - [`message_set`] - Per-round, per-phase vote accumulators
//! - [`epoch`] - Persisted validator-set history keyed by start height
//! - [`testing`] - Mock proposal and backend used by the test suites
//!
//! The engine is generic over the node's block type through the
//! [`Proposal`](bft_traits::Proposal) trait and drives the node through the
//! [`Backend`](bft_traits::Backend) contract. All consensus state is owned
//! by a single task; the only inbound path is the event mux.

pub mod engine;
pub mod epoch;
pub mod message_set;
pub mod testing;

pub use engine::{Core, RoundState, State};
pub use epoch::{Epoch, EpochStore, KvDb, MemoryDb};
pub use message_set::MessageSet;
