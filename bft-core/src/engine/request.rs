// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Leader-local proposal requests.
//!
//! The miner posts a request whenever it has a block ready, regardless of
//! who leads the round. Requests ahead of the current height are buffered
//! and replayed when the engine gets there; the proposer turns the matching
//! request into a `Prepare` once it holds a quorum of `NewView` messages.

use alloy_rlp::Encodable;
use tracing::{debug, trace};

use bft_traits::{Backend, ConsensusError, MsgType, PrepareMsg, Proposal, Request};

use super::{Core, State};

impl<B: Backend> Core<B> {
    fn check_request(&self, request: &Request<B::Proposal>) -> Result<(), ConsensusError> {
        let height = self.round()?.height();
        let number = request.proposal.number();
        match number.cmp(&height) {
            std::cmp::Ordering::Less => Err(ConsensusError::OldRequest),
            std::cmp::Ordering::Greater => Err(ConsensusError::FutureRequest),
            std::cmp::Ordering::Equal => Ok(()),
        }
    }

    pub(crate) async fn handle_request(
        &mut self,
        request: Request<B::Proposal>,
    ) -> Result<(), ConsensusError> {
        match self.check_request(&request) {
            Ok(()) => {}
            Err(ConsensusError::FutureRequest) => {
                trace!(
                    number = request.proposal.number(),
                    "buffering request ahead of the current height"
                );
                self.pending_requests
                    .insert(request.proposal.number(), request);
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        debug!(
            number = request.proposal.number(),
            hash = %request.proposal.hash(),
            "pending request set"
        );
        self.round_mut()?.set_pending_request(request);
        self.try_send_prepare().await
    }

    /// Broadcast `Prepare` once everything lines up: we lead the round, a
    /// quorum of `NewView` messages fixed the high certificate, and the
    /// pending request matches the height. The leader's own state advances
    /// when its self-delivered `Prepare` comes back through the mux.
    pub(crate) async fn try_send_prepare(&mut self) -> Result<(), ConsensusError> {
        if !self.is_proposer() {
            return Ok(());
        }
        let (view, data) = {
            let current = self.round()?;
            if current.state() != State::HighQC {
                return Ok(());
            }
            let Some(request) = current.pending_request() else {
                return Ok(());
            };
            if request.proposal.number() != current.height() {
                return Ok(());
            }
            let high_qc = current
                .high_qc()
                .cloned()
                .ok_or(ConsensusError::StateMismatch("no high certificate"))?;
            let view = current.view();
            (
                view,
                PrepareMsg::encode_proposal(view, &request.proposal, high_qc),
            )
        };

        debug!(height = view.height, round = view.round, "proposing");
        let mut encoded = Vec::new();
        data.encode(&mut encoded);
        self.broadcast_message(MsgType::Prepare, encoded.into()).await
    }
}
