// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Second phase: locking on the certified proposal.

use alloy_primitives::Address;
use tracing::{debug, trace};

use bft_traits::{Backend, ConsensusError, Message, MsgType, Proposal, QuorumCert, Vote};

use super::{Core, State};

impl<B: Backend> Core<B> {
    /// Replica side of `PreCommit`: the proposer proved a prepare quorum,
    /// so adopt the certificate, lock the proposal and vote again.
    pub(crate) async fn handle_pre_commit(
        &mut self,
        msg: &Message,
        src: Address,
    ) -> Result<(), ConsensusError> {
        let qc: QuorumCert = msg.decode_data()?;
        self.check_view(qc.view)?;
        {
            let current = self.round()?;
            if !current.val_set().is_proposer(src) {
                return Err(ConsensusError::NotFromProposer);
            }
            if current.state() >= State::PreCommit {
                trace!(%src, "prepare certificate already adopted");
                return Ok(());
            }
            if current.state() < State::Prepare {
                return Err(ConsensusError::StateMismatch(
                    "certificate before any proposal",
                ));
            }
            if current.proposal().map(|p| p.hash()) != Some(qc.hash) {
                return Err(ConsensusError::InvalidQuorumCert(
                    "certificate is not for the proposal under vote".into(),
                ));
            }
        }
        self.verify_qc(&qc)?;

        {
            let current = self.round_mut()?;
            current.set_prepare_qc(qc.clone());
            current.set_locked_qc(qc);
            current.lock_proposal();
        }
        debug!("proposal locked");
        self.set_state(State::PreCommit);

        self.send_vote(MsgType::PreCommitVote).await?;
        self.set_state(State::PreCommitVote);
        Ok(())
    }

    /// Proposer side of `PreCommitVote`: at quorum, aggregate the seals
    /// into the locked certificate and broadcast it as `Commit`.
    pub(crate) async fn handle_pre_commit_vote(
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
        self.round_mut()?.add_pre_commit_vote(msg.clone())?;

        let (size, quorum, state) = {
            let current = self.round()?;
            (
                current.pre_commit_vote_size(),
                current.val_set().q(),
                current.state(),
            )
        };
        debug!(%src, size, quorum, "pre-commit vote collected");

        if size >= quorum && state == State::PreCommitVote {
            let qc = self.assemble_qc(&self.round()?.pre_commit_votes())?;
            debug!(view = %qc.view, seals = qc.seal_count(), "locked certificate assembled");
            self.round_mut()?.set_locked_qc(qc.clone());
            self.broadcast_message(MsgType::Commit, alloy_rlp::encode(&qc).into())
                .await?;
        }
        Ok(())
    }
}
