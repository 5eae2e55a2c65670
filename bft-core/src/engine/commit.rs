// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Final phases: commit voting, sealing and the decide broadcast.

use alloy_primitives::{Address, Bytes};
use tracing::{debug, error, trace};

use bft_traits::{Backend, ConsensusError, Message, MsgType, Proposal, QuorumCert, Vote};

use super::{Core, State};

impl<B: Backend> Core<B> {
    /// Replica side of `Commit`: the locked certificate reached quorum
    /// elsewhere; record it and cast the final vote.
    pub(crate) async fn handle_commit(
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
            if current.state() >= State::Commit {
                trace!(%src, "commit certificate already adopted");
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
            current.set_locked_qc(qc.clone());
            current.lock_proposal();
            current.set_committed_qc(qc);
        }
        self.set_state(State::Commit);

        self.send_vote(MsgType::CommitVote).await?;
        self.set_state(State::CommitVote);
        Ok(())
    }

    /// Proposer side of `CommitVote`: at quorum, seal the block with the
    /// collected seals, insert it, and tell everyone with `Decide`.
    pub(crate) async fn handle_commit_vote(
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
        self.round_mut()?.add_commit_vote(msg.clone())?;

        let (size, quorum, state) = {
            let current = self.round()?;
            (
                current.commit_vote_size(),
                current.val_set().q(),
                current.state(),
            )
        };
        debug!(%src, size, quorum, "commit vote collected");

        if size >= quorum && state == State::CommitVote {
            let (view, proposal, seals) = {
                let current = self.round()?;
                let proposal = current
                    .proposal()
                    .cloned()
                    .ok_or(ConsensusError::StateMismatch("no proposal to seal"))?;
                let seals: Vec<Bytes> = current
                    .commit_votes()
                    .iter()
                    .filter(|m| !m.committed_seal.is_empty())
                    .map(|m| m.committed_seal.clone())
                    .collect();
                (current.view(), proposal, seals)
            };

            let sealed = self
                .backend
                .pre_commit(proposal, seals.clone())
                .await
                .map_err(ConsensusError::Backend)?;
            let qc = QuorumCert {
                view,
                proposer: self.address(),
                hash: sealed.hash(),
                extra: Bytes::copy_from_slice(sealed.extra()),
                seals,
            };

            debug!(hash = %qc.hash, seals = qc.seal_count(), "decided");
            self.round_mut()?.set_committed_qc(qc.clone());
            self.set_state(State::Committed);
            self.deliver(sealed).await?;
            self.broadcast_message(MsgType::Decide, alloy_rlp::encode(&qc).into())
                .await?;
        }
        Ok(())
    }

    /// Replica side of `Decide`: assemble the sealed block out of the local
    /// proposal and the certificate's sealed extra, then insert it.
    pub(crate) async fn handle_decide(
        &mut self,
        msg: &Message,
        src: Address,
    ) -> Result<(), ConsensusError> {
        let qc: QuorumCert = msg.decode_data()?;
        self.check_view(qc.view)?;
        let proposal = {
            let current = self.round()?;
            if !current.val_set().is_proposer(src) {
                return Err(ConsensusError::NotFromProposer);
            }
            if current.state() >= State::Committed {
                trace!(%src, "already committed this round");
                return Ok(());
            }
            if current.state() < State::Prepare {
                return Err(ConsensusError::StateMismatch(
                    "decided before any proposal",
                ));
            }
            let proposal = current
                .proposal()
                .cloned()
                .ok_or(ConsensusError::StateMismatch("no proposal to commit"))?;
            if proposal.hash() != qc.hash {
                return Err(ConsensusError::InvalidQuorumCert(
                    "decision is not for the proposal under vote".into(),
                ));
            }
            proposal
        };
        self.verify_qc(&qc)?;

        let sealed = self
            .backend
            .forward_commit(proposal, qc.extra.clone())
            .await
            .map_err(ConsensusError::Backend)?;
        self.backend.verify(&sealed).await?;
        self.round_mut()?.set_committed_qc(qc);
        self.deliver(sealed).await?;
        self.set_state(State::Committed);
        Ok(())
    }

    async fn deliver(&mut self, sealed: B::Proposal) -> Result<(), ConsensusError> {
        let hash = sealed.hash();
        if let Err(err) = self.backend.commit(sealed).await {
            if self.backend.has_bad_proposal(hash) {
                error!(%hash, "sealed proposal was rejected by the chain");
            }
            return Err(ConsensusError::Backend(err));
        }
        Ok(())
    }
}
