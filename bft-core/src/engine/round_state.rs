// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Mutable state of one `(height, round)` attempt.

use std::fmt;
use std::sync::Arc;

use bft_traits::{ConsensusError, Message, Proposal, QuorumCert, Request, ValidatorSet, View, Vote};

use crate::message_set::MessageSet;

/// Position inside the phase pipeline. Ordered: a handler that requires a
/// phase to have happened compares against this.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    AcceptRequest,
    NewView,
    HighQC,
    Prepare,
    PrepareVote,
    PreCommit,
    PreCommitVote,
    Commit,
    CommitVote,
    Committed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::AcceptRequest => "AcceptRequest",
            State::NewView => "NewView",
            State::HighQC => "HighQC",
            State::Prepare => "Prepare",
            State::PrepareVote => "PrepareVote",
            State::PreCommit => "PreCommit",
            State::PreCommitVote => "PreCommitVote",
            State::Commit => "Commit",
            State::CommitVote => "CommitVote",
            State::Committed => "Committed",
        };
        f.write_str(name)
    }
}

/// Everything the engine mutates within one view: the proposal under vote,
/// the chained certificates, and one message set per phase.
///
/// A fresh instance is allocated on every view change; the only state that
/// survives is the locked proposal and the leader's pending request, copied
/// over by `start_new_round`.
pub struct RoundState<P> {
    val_set: Arc<ValidatorSet>,
    view: View,
    state: State,

    pending_request: Option<Request<P>>,
    proposal: Option<P>,
    proposal_locked: bool,

    new_views: MessageSet,
    prepare_votes: MessageSet,
    pre_commit_votes: MessageSet,
    commit_votes: MessageSet,

    high_qc: Option<QuorumCert>,
    prepare_qc: Option<QuorumCert>,
    locked_qc: Option<QuorumCert>,
    committed_qc: Option<QuorumCert>,
}

impl<P: Proposal> RoundState<P> {
    pub fn new(view: View, val_set: Arc<ValidatorSet>, prepare_qc: Option<QuorumCert>) -> Self {
        Self {
            view,
            state: State::AcceptRequest,
            pending_request: None,
            proposal: None,
            proposal_locked: false,
            new_views: MessageSet::new(val_set.clone()),
            prepare_votes: MessageSet::new(val_set.clone()),
            pre_commit_votes: MessageSet::new(val_set.clone()),
            commit_votes: MessageSet::new(val_set.clone()),
            high_qc: None,
            locked_qc: prepare_qc.clone(),
            committed_qc: prepare_qc.clone(),
            prepare_qc,
            val_set,
        }
    }

    pub fn height(&self) -> u64 {
        self.view.height
    }

    pub fn round(&self) -> u64 {
        self.view.round
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn val_set(&self) -> &Arc<ValidatorSet> {
        &self.val_set
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn set_state(&mut self, state: State) {
        self.state = state;
    }

    pub fn proposal(&self) -> Option<&P> {
        self.proposal.as_ref()
    }

    pub fn set_proposal(&mut self, proposal: P) {
        self.proposal = Some(proposal);
    }

    /// The vote for the current proposal, if one is set.
    pub fn vote(&self) -> Option<Vote> {
        self.proposal
            .as_ref()
            .map(|p| Vote::new(self.view, p.hash()))
    }

    pub fn lock_proposal(&mut self) {
        if self.proposal.is_some() {
            self.proposal_locked = true;
        }
    }

    pub fn unlock_proposal(&mut self) {
        if self.proposal_locked {
            self.proposal_locked = false;
            self.proposal = None;
        }
    }

    pub fn is_proposal_locked(&self) -> bool {
        self.proposal_locked
    }

    /// The locked proposal to carry into the next round of this height.
    pub fn last_locked_proposal(&self) -> Option<&P> {
        if self.proposal_locked {
            self.proposal.as_ref()
        } else {
            None
        }
    }

    pub fn pending_request(&self) -> Option<&Request<P>> {
        self.pending_request.as_ref()
    }

    pub fn take_pending_request(&mut self) -> Option<Request<P>> {
        self.pending_request.take()
    }

    pub fn set_pending_request(&mut self, request: Request<P>) {
        self.pending_request = Some(request);
    }

    pub fn add_new_view(&mut self, msg: Message) -> Result<(), ConsensusError> {
        self.new_views.add(msg)
    }

    pub fn new_view_size(&self) -> usize {
        self.new_views.size()
    }

    pub fn new_views(&self) -> Vec<Message> {
        self.new_views.values()
    }

    pub fn add_prepare_vote(&mut self, msg: Message) -> Result<(), ConsensusError> {
        self.prepare_votes.add(msg)
    }

    pub fn prepare_vote_size(&self) -> usize {
        self.prepare_votes.size()
    }

    pub fn prepare_votes(&self) -> Vec<Message> {
        self.prepare_votes.values()
    }

    pub fn add_pre_commit_vote(&mut self, msg: Message) -> Result<(), ConsensusError> {
        self.pre_commit_votes.add(msg)
    }

    pub fn pre_commit_vote_size(&self) -> usize {
        self.pre_commit_votes.size()
    }

    pub fn pre_commit_votes(&self) -> Vec<Message> {
        self.pre_commit_votes.values()
    }

    pub fn add_commit_vote(&mut self, msg: Message) -> Result<(), ConsensusError> {
        self.commit_votes.add(msg)
    }

    pub fn commit_vote_size(&self) -> usize {
        self.commit_votes.size()
    }

    pub fn commit_votes(&self) -> Vec<Message> {
        self.commit_votes.values()
    }

    pub fn high_qc(&self) -> Option<&QuorumCert> {
        self.high_qc.as_ref()
    }

    pub fn set_high_qc(&mut self, qc: QuorumCert) {
        self.high_qc = Some(qc);
    }

    pub fn prepare_qc(&self) -> Option<&QuorumCert> {
        self.prepare_qc.as_ref()
    }

    pub fn set_prepare_qc(&mut self, qc: QuorumCert) {
        self.prepare_qc = Some(qc);
    }

    pub fn locked_qc(&self) -> Option<&QuorumCert> {
        self.locked_qc.as_ref()
    }

    pub fn set_locked_qc(&mut self, qc: QuorumCert) {
        self.locked_qc = Some(qc);
    }

    pub fn committed_qc(&self) -> Option<&QuorumCert> {
        self.committed_qc.as_ref()
    }

    pub fn set_committed_qc(&mut self, qc: QuorumCert) {
        self.committed_qc = Some(qc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestBlock;
    use alloy_primitives::B256;
    use bft_traits::LeaderPolicy;

    fn round_state() -> RoundState<TestBlock> {
        let val_set = ValidatorSet::new(
            (1..=4).map(alloy_primitives::Address::repeat_byte).collect(),
            LeaderPolicy::RoundRobin,
        );
        let qc = QuorumCert {
            view: View::new(0, 0),
            ..Default::default()
        };
        RoundState::new(View::new(1, 0), Arc::new(val_set), Some(qc))
    }

    #[test]
    fn test_state_ordering_follows_the_pipeline() {
        assert!(State::AcceptRequest < State::NewView);
        assert!(State::NewView < State::HighQC);
        assert!(State::HighQC < State::Prepare);
        assert!(State::Prepare < State::PrepareVote);
        assert!(State::PrepareVote < State::PreCommit);
        assert!(State::PreCommitVote < State::Commit);
        assert!(State::CommitVote < State::Committed);
    }

    #[test]
    fn test_bootstrap_qc_seeds_the_chain() {
        let rs = round_state();
        assert!(rs.prepare_qc().is_some());
        assert!(rs.locked_qc().is_some());
        assert!(rs.committed_qc().is_some());
        assert!(rs.high_qc().is_none());
        assert_eq!(rs.state(), State::AcceptRequest);
    }

    #[test]
    fn test_vote_requires_a_proposal() {
        let mut rs = round_state();
        assert!(rs.vote().is_none());

        let block = TestBlock::build(1, B256::ZERO, &[]);
        rs.set_proposal(block.clone());
        let vote = rs.vote().unwrap();
        assert_eq!(vote.view, View::new(1, 0));
        assert_eq!(vote.digest, bft_traits::Proposal::hash(&block));
    }

    #[test]
    fn test_lock_and_unlock() {
        let mut rs = round_state();

        // Locking without a proposal is a no-op.
        rs.lock_proposal();
        assert!(!rs.is_proposal_locked());

        rs.set_proposal(TestBlock::build(1, B256::ZERO, &[]));
        rs.lock_proposal();
        assert!(rs.is_proposal_locked());
        assert!(rs.last_locked_proposal().is_some());

        rs.unlock_proposal();
        assert!(!rs.is_proposal_locked());
        assert!(rs.proposal().is_none());
    }
}
