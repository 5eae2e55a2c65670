// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Proposal dissemination and the first voting phase.

use alloy_primitives::Address;
use tracing::{debug, trace, warn};

use bft_traits::{Backend, ConsensusError, Message, MsgType, PrepareMsg, Proposal, QuorumCert, Vote};

use super::{verify_committed_seal, Core, State};

impl<B: Backend> Core<B> {
    /// Replica side of `Prepare`: verify the proposal, apply the safe-node
    /// rule, and vote to the proposer when it passes.
    pub(crate) async fn handle_prepare(
        &mut self,
        msg: &Message,
        src: Address,
    ) -> Result<(), ConsensusError> {
        let data: PrepareMsg = msg.decode_data()?;
        self.check_view(data.view)?;
        {
            let current = self.round()?;
            if current.state() >= State::Prepare {
                trace!(%src, "proposal already accepted this round");
                return Ok(());
            }
            if !current.val_set().is_proposer(src) {
                return Err(ConsensusError::NotFromProposer);
            }
        }

        let proposal: B::Proposal = data.decode_proposal()?;
        if proposal.number() != data.view.height {
            return Err(ConsensusError::InvalidProposal(format!(
                "block {} proposed at height {}",
                proposal.number(),
                data.view.height
            )));
        }

        self.backend.verify_unsealed_proposal(&proposal).await?;
        self.backend.validate_block(&proposal).await?;
        self.verify_qc(&data.high_qc)?;

        if !self.is_safe_proposal(&proposal, &data.high_qc)? {
            // Withhold the vote; the round will time out if nobody else
            // carries it to quorum.
            warn!(
                hash = %proposal.hash(),
                high_view = %data.high_qc.view,
                "proposal does not extend the lock, vote withheld"
            );
            return Err(ConsensusError::InvalidProposal(
                "violates the locking rule".into(),
            ));
        }

        {
            let current = self.round_mut()?;
            if current.is_proposal_locked()
                && current.proposal().map(|p| p.hash()) != Some(proposal.hash())
            {
                // The lock is superseded by a higher-view certificate.
                current.unlock_proposal();
            }
            current.set_high_qc(data.high_qc);
            current.set_proposal(proposal);
        }
        self.set_state(State::Prepare);

        self.send_vote(MsgType::PrepareVote).await?;
        self.set_state(State::PrepareVote);
        Ok(())
    }

    /// The safe-node predicate: a proposal is voteable when it keeps the
    /// locked proposal, chain-extends the locked certificate, or carries a
    /// certificate from a higher view than the lock.
    fn is_safe_proposal(
        &self,
        proposal: &B::Proposal,
        high_qc: &QuorumCert,
    ) -> Result<bool, ConsensusError> {
        let current = self.round()?;
        let locked_qc = current
            .locked_qc()
            .ok_or(ConsensusError::StateMismatch("no locked certificate"))?;

        if current.is_proposal_locked() {
            if current.proposal().map(|p| p.hash()) == Some(proposal.hash()) {
                return Ok(true);
            }
            return Ok(high_qc.view > locked_qc.view);
        }
        Ok(high_qc.hash == locked_qc.hash || high_qc.view > locked_qc.view)
    }

    /// Shared admission check for the three vote codes: the phase carrying
    /// the vote must have started, the digest must match the proposal under
    /// vote, and the committed seal must verify against the sender.
    pub(crate) fn check_vote(&self, vote: &Vote, msg: &Message) -> Result<(), ConsensusError> {
        let current = self.round()?;
        if current.state() < State::Prepare {
            return Err(ConsensusError::StateMismatch("vote before any proposal"));
        }
        let proposal = current
            .proposal()
            .ok_or(ConsensusError::StateMismatch("vote without a proposal"))?;
        if vote.digest != proposal.hash() {
            return Err(ConsensusError::InconsistentVote);
        }
        verify_committed_seal(msg, vote)
    }

    /// Proposer side of `PrepareVote`: collect seals and broadcast the
    /// resulting `prepareQC` as `PreCommit` at quorum.
    pub(crate) async fn handle_prepare_vote(
        &mut self,
        msg: &Message,
        src: Address,
    ) -> Result<(), ConsensusError> {
        let vote: Vote = msg.decode_data()?;
        self.check_view(vote.view)?;
        if !self.is_proposer() {
            trace!(%src, "vote ignored, not leading this round");
            return Ok(());
        }
        self.check_vote(&vote, msg)?;
        self.round_mut()?.add_prepare_vote(msg.clone())?;

        let (size, quorum, state) = {
            let current = self.round()?;
            (
                current.prepare_vote_size(),
                current.val_set().q(),
                current.state(),
            )
        };
        debug!(%src, size, quorum, "prepare vote collected");

        if size >= quorum && state == State::PrepareVote {
            let qc = self.assemble_qc(&self.round()?.prepare_votes())?;
            debug!(view = %qc.view, seals = qc.seal_count(), "prepare certificate assembled");
            self.round_mut()?.set_prepare_qc(qc.clone());
            self.broadcast_message(MsgType::PreCommit, alloy_rlp::encode(&qc).into())
                .await?;
        }
        Ok(())
    }
}
