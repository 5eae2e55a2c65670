// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! The boundary between the engine and the embedding node.
//!
//! [`Backend`] is everything the engine asks of the node: the chain head,
//! validator sets, message delivery and block sealing. [`CoreEngine`] is the
//! narrow contract the node holds the engine behind, which keeps the two
//! from referencing each other's concrete types.
//!
//! Events cross the boundary as one tagged enum over a single
//! multi-producer/single-consumer channel, [`EventMux`]. The engine task is
//! the only consumer; producers are the network handler, the miner, the
//! chain inserter and the engine's own timer.

use alloy_primitives::{Address, Bytes, B256};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::ConsensusError;
use crate::message::Message;
use crate::proposal::Proposal;
use crate::validator::ValidatorSet;

/// Everything that can wake the engine.
#[derive(Debug)]
pub enum CoreEvent<P> {
    /// The miner produced a block for the engine to propose.
    Request { proposal: P },
    /// An authenticated wire payload from a peer (or from self-post).
    Message { payload: Bytes },
    /// A backlogged message released after a view change.
    Backlog { msg: Box<Message>, src: Address },
    /// The round-change timer fired.
    Timeout,
    /// A block reached the canonical chain.
    FinalCommitted { number: u64, hash: B256 },
    /// Drain and exit the event loop.
    Stop,
}

/// Single-consumer event bus between the node and the engine task.
pub struct EventMux<P> {
    tx: mpsc::UnboundedSender<CoreEvent<P>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<CoreEvent<P>>>>,
}

impl<P> EventMux<P> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Post an event. Fire-and-forget: posting after the consumer went away
    /// is not an error, the event is simply dropped.
    pub fn post(&self, event: CoreEvent<P>) {
        if self.tx.send(event).is_err() {
            trace!("event posted after the engine unsubscribed");
        }
    }

    /// Take the consuming end. Returns `None` if already subscribed.
    pub fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<CoreEvent<P>>> {
        self.rx.lock().expect("event mux poisoned").take()
    }

    /// Hand the receiver back on engine shutdown so a restart can subscribe
    /// again.
    pub fn unsubscribe(&self, rx: mpsc::UnboundedReceiver<CoreEvent<P>>) {
        *self.rx.lock().expect("event mux poisoned") = Some(rx);
    }

    /// A producer handle, e.g. for the engine's timer task.
    pub fn sender(&self) -> mpsc::UnboundedSender<CoreEvent<P>> {
        self.tx.clone()
    }
}

impl<P> Default for EventMux<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Node-side services the engine drives.
///
/// Delivery semantics: `broadcast` reaches every validator including self
/// (self-delivery goes through the event mux), `gossip` excludes self, and
/// `unicast` reaches the current proposer of the given set, again through
/// the mux when that proposer is this node.
#[async_trait]
pub trait Backend: Send + Sync {
    type Proposal: Proposal;

    /// The owner's validator address.
    fn address(&self) -> Address;

    /// Validator set of the epoch containing `height`.
    fn validators(&self, height: u64) -> ValidatorSet;

    /// The event bus shared with the engine.
    fn event_mux(&self) -> &EventMux<Self::Proposal>;

    /// Send to all validators, including self.
    async fn broadcast(&self, val_set: &ValidatorSet, payload: Bytes) -> Result<()>;

    /// Send to all validators except self.
    async fn gossip(&self, val_set: &ValidatorSet, payload: Bytes) -> Result<()>;

    /// Send to the current proposer of `val_set`.
    async fn unicast(&self, val_set: &ValidatorSet, payload: Bytes) -> Result<()>;

    /// Embed the committed seals into the proposal's header extra and return
    /// the sealed proposal.
    async fn pre_commit(
        &self,
        proposal: Self::Proposal,
        seals: Vec<Bytes>,
    ) -> Result<Self::Proposal>;

    /// Assemble an unsealed proposal and an already sealed extra into a full
    /// sealed proposal.
    async fn forward_commit(
        &self,
        proposal: Self::Proposal,
        extra: Bytes,
    ) -> Result<Self::Proposal>;

    /// Deliver an approved sealed proposal for chain insertion.
    async fn commit(&self, proposal: Self::Proposal) -> Result<()>;

    /// Full verification including the committed seals.
    /// [`ConsensusError::FutureBlock`] carries the wait until the proposal
    /// becomes current.
    async fn verify(&self, proposal: &Self::Proposal) -> Result<(), ConsensusError>;

    /// Same as [`Backend::verify`] without the committed-seal check.
    async fn verify_unsealed_proposal(
        &self,
        proposal: &Self::Proposal,
    ) -> Result<(), ConsensusError>;

    /// Execute the proposal and validate the resulting state.
    async fn validate_block(&self, proposal: &Self::Proposal) -> Result<(), ConsensusError>;

    /// Latest committed proposal and the address of its proposer.
    fn last_proposal(&self) -> Result<(Self::Proposal, Address)>;

    /// Whether the hash belongs to a proposal that previously failed
    /// insertion.
    fn has_bad_proposal(&self, hash: B256) -> bool;
}

/// The narrow engine handle the node keeps.
#[async_trait]
pub trait CoreEngine: Send {
    async fn start(&mut self) -> Result<(), ConsensusError>;

    async fn stop(&mut self) -> Result<(), ConsensusError>;

    /// True when the local address is the proposer of the current round.
    fn is_proposer(&self) -> bool;

    /// True when the hash matches the proposal or pending request of the
    /// current round. Used by the node to recognize its own block coming
    /// back from the network while it is still proposing it.
    fn is_current_proposal(&self, hash: B256) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mux_single_consumer() {
        let mux: EventMux<u64> = EventMux::new();
        let rx = mux.subscribe().expect("first subscribe");
        assert!(mux.subscribe().is_none());
        mux.unsubscribe(rx);
        assert!(mux.subscribe().is_some());
    }

    #[tokio::test]
    async fn test_post_and_receive_in_order() {
        let mux: EventMux<u64> = EventMux::new();
        let mut rx = mux.subscribe().unwrap();

        mux.post(CoreEvent::Timeout);
        mux.post(CoreEvent::FinalCommitted {
            number: 3,
            hash: B256::ZERO,
        });

        assert!(matches!(rx.recv().await, Some(CoreEvent::Timeout)));
        assert!(matches!(
            rx.recv().await,
            Some(CoreEvent::FinalCommitted { number: 3, .. })
        ));
    }

    #[test]
    fn test_post_without_consumer_is_silent() {
        let mux: EventMux<u64> = EventMux::new();
        let rx = mux.subscribe().unwrap();
        drop(rx);
        mux.post(CoreEvent::Timeout);
    }
}
