// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Event loop and message dispatch.

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use tracing::{debug, trace, warn};

use bft_traits::{Backend, ConsensusError, CoreEngine, CoreEvent, Message, MsgType, Request};

use super::Core;

impl<B: Backend> Core<B> {
    /// Subscribe to the event mux and enter the first round. The caller
    /// drives the engine afterwards, either through [`Core::run`] or by
    /// feeding [`Core::handle_event`] directly.
    pub async fn start(&mut self) -> Result<(), ConsensusError> {
        if self.is_running {
            return Ok(());
        }
        let events = self
            .backend
            .event_mux()
            .subscribe()
            .ok_or_else(|| ConsensusError::Backend(anyhow::anyhow!("event mux already taken")))?;
        self.events = Some(events);
        self.is_running = true;
        self.current = None;
        self.start_new_round(0).await;
        Ok(())
    }

    /// Cancel the timer, hand the subscription back and drain to idle.
    /// Events still in flight after this are discarded.
    pub async fn stop(&mut self) -> Result<(), ConsensusError> {
        self.stop_timer();
        if let Some(rx) = self.events.take() {
            self.backend.event_mux().unsubscribe(rx);
        }
        self.is_running = false;
        Ok(())
    }

    /// Consume events until [`CoreEvent::Stop`] or channel closure.
    pub async fn run(&mut self) {
        while self.is_running {
            let event = match self.events.as_mut() {
                Some(rx) => rx.recv().await,
                None => break,
            };
            match event {
                Some(CoreEvent::Stop) | None => {
                    let _ = self.stop().await;
                }
                Some(event) => self.handle_event(event).await,
            }
        }
    }

    /// Drain every event already queued, without waiting. Returns how many
    /// were handled. Test harnesses use this to step the engine
    /// deterministically.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let event = match self.events.as_mut() {
                Some(rx) => match rx.try_recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
                None => break,
            };
            self.handle_event(event).await;
            handled += 1;
        }
        handled
    }

    /// Dispatch one event. Handler errors never fault the loop; they are
    /// logged and the event is dropped.
    pub async fn handle_event(&mut self, event: CoreEvent<B::Proposal>) {
        if !self.is_running {
            trace!("event after stop discarded");
            return;
        }
        match event {
            CoreEvent::Request { proposal } => {
                if let Err(err) = self.handle_request(Request::new(proposal)).await {
                    self.log_handler_error("request", err);
                }
            }
            CoreEvent::Message { payload } => {
                if let Err(err) = self.handle_msg(&payload).await {
                    self.log_handler_error("message", err);
                }
            }
            CoreEvent::Backlog { msg, src } => {
                if let Err(err) = self.handle_checked_msg(*msg, src).await {
                    self.log_handler_error("backlog", err);
                }
            }
            CoreEvent::Timeout => self.handle_timeout().await,
            CoreEvent::FinalCommitted { number, hash } => {
                self.handle_final_committed(number, hash).await;
            }
            CoreEvent::Stop => {
                let _ = self.stop().await;
            }
        }
    }

    fn log_handler_error(&self, kind: &'static str, err: ConsensusError) {
        if err.is_view_skew() {
            trace!(kind, %err, "message outside the current view");
        } else {
            warn!(kind, %err, "dropped event");
        }
    }

    /// Decode, authenticate and dispatch a wire payload.
    pub async fn handle_msg(&mut self, payload: &[u8]) -> Result<(), ConsensusError> {
        let msg = Message::from_payload(payload)?;

        // Only current validators get a hearing.
        if !self.round()?.val_set().contains(msg.address) {
            return Err(ConsensusError::UnauthorizedAddress);
        }
        let src = msg.address;
        self.handle_checked_msg(msg, src).await
    }

    /// Dispatch an authenticated message by code. Future-view messages land
    /// in the backlog; everything else that fails is dropped.
    pub(crate) async fn handle_checked_msg(
        &mut self,
        msg: Message,
        src: Address,
    ) -> Result<(), ConsensusError> {
        let result = match msg.msg_type()? {
            MsgType::NewView => self.handle_new_view(&msg, src).await,
            MsgType::Prepare => self.handle_prepare(&msg, src).await,
            MsgType::PrepareVote => self.handle_prepare_vote(&msg, src).await,
            MsgType::PreCommit => self.handle_pre_commit(&msg, src).await,
            MsgType::PreCommitVote => self.handle_pre_commit_vote(&msg, src).await,
            MsgType::Commit => self.handle_commit(&msg, src).await,
            MsgType::CommitVote => self.handle_commit_vote(&msg, src).await,
            MsgType::Decide => self.handle_decide(&msg, src).await,
        };

        if matches!(result, Err(ConsensusError::FutureMessage)) {
            if let Some(jump_round) = self.store_backlog(msg, src) {
                self.start_new_round(jump_round).await;
            }
        }
        result
    }

    pub(crate) async fn handle_timeout(&mut self) {
        let Some(view) = self.current_view() else {
            return;
        };
        debug!(height = view.height, round = view.round, "round timed out");
        self.start_new_round(view.round + 1).await;
    }

    /// A block reached the chain; if it covers our height, move on.
    pub(crate) async fn handle_final_committed(&mut self, number: u64, hash: B256) {
        let Some(view) = self.current_view() else {
            return;
        };
        if number >= view.height {
            debug!(number, %hash, "chain head advanced");
            self.start_new_round(0).await;
        }
    }
}

#[async_trait]
impl<B: Backend> CoreEngine for Core<B> {
    async fn start(&mut self) -> Result<(), ConsensusError> {
        Core::start(self).await
    }

    async fn stop(&mut self) -> Result<(), ConsensusError> {
        Core::stop(self).await
    }

    fn is_proposer(&self) -> bool {
        Core::is_proposer(self)
    }

    fn is_current_proposal(&self, hash: B256) -> bool {
        Core::is_current_proposal(self, hash)
    }
}
