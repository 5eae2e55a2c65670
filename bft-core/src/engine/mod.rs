// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! The consensus engine.
//!
//! One [`Core`] task owns all round state. Events arrive on the backend's
//! event mux; handlers mutate the state, emit messages through the backend,
//! and on commit hand the sealed proposal back for chain insertion. Nothing
//! in here takes a lock around consensus state: the event loop is the only
//! writer.

mod backlog;
mod commit;
mod handler;
mod new_view;
mod precommit;
mod prepare;
mod request;
mod round_state;

pub use backlog::Backlog;
pub use round_state::{RoundState, State};

use alloy_primitives::{Address, Bytes, B256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use bft_traits::extra::BftExtra;
use bft_traits::types::recover_seal;
use bft_traits::{
    Backend, Config, ConsensusError, CoreEvent, Message, MsgType, Proposal, QuorumCert, Request,
    Signer, View, Vote,
};

/// Attempts to read a caught-up chain head before giving up on a round
/// start.
const MAX_CATCHUP_RETRY: u64 = 10;

/// Round-change timeout: the configured base, plus `2^round` seconds for
/// every round after the first. Strictly monotone in the round number.
pub fn round_timeout(base_ms: u64, round: u64) -> Duration {
    let mut timeout = Duration::from_millis(base_ms);
    if round > 0 {
        timeout += Duration::from_secs(1u64 << round.min(32));
    }
    timeout
}

/// Re-express a committed proposal as the quorum certificate that justified
/// it, seeding the certificate chain of the next height.
///
/// The commit round is read back from the sealed extra's salt; a proposal
/// without a decodable extra (genesis) yields an empty-seal certificate.
pub fn proposal_to_qc<P: Proposal>(proposal: &P) -> QuorumCert {
    let (round, seals) = match BftExtra::decode_extra(proposal.extra()) {
        Ok(extra) => (extra.salt_round(), extra.committed_seal),
        Err(_) => (0, Vec::new()),
    };
    QuorumCert {
        view: View::new(proposal.number(), round),
        proposer: Address::ZERO,
        hash: proposal.hash(),
        extra: Bytes::copy_from_slice(proposal.extra()),
        seals,
    }
}

/// Check that a vote message's committed seal was produced by its sender
/// over the vote digest.
pub(crate) fn verify_committed_seal(msg: &Message, vote: &Vote) -> Result<(), ConsensusError> {
    if msg.committed_seal.is_empty() {
        return Err(ConsensusError::InvalidSigner);
    }
    let signer = recover_seal(&msg.committed_seal, vote.seal_hash())?;
    if signer != msg.address {
        return Err(ConsensusError::InvalidSigner);
    }
    Ok(())
}

/// The consensus state machine of one validator.
pub struct Core<B: Backend> {
    config: Config,
    backend: Arc<B>,
    signer: Arc<dyn Signer>,
    address: Address,

    current: Option<RoundState<B::Proposal>>,
    pending_requests: BTreeMap<u64, Request<B::Proposal>>,
    backlog: Backlog,
    /// Senders hinting at a higher round of the current height, per round.
    round_hints: HashMap<u64, HashSet<Address>>,

    events: Option<mpsc::UnboundedReceiver<CoreEvent<B::Proposal>>>,
    round_change_timer: Option<JoinHandle<()>>,
    is_running: bool,
}

impl<B: Backend> Core<B> {
    pub fn new(backend: Arc<B>, config: Config, signer: Arc<dyn Signer>) -> Self {
        let address = signer.address();
        Self {
            config,
            backend,
            signer,
            address,
            current: None,
            pending_requests: BTreeMap::new(),
            backlog: Backlog::new(),
            round_hints: HashMap::new(),
            events: None,
            round_change_timer: None,
            is_running: false,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    /// The current view, if a round has been started.
    pub fn current_view(&self) -> Option<View> {
        self.current.as_ref().map(|c| c.view())
    }

    pub fn current_state(&self) -> Option<State> {
        self.current.as_ref().map(|c| c.state())
    }

    /// True when this node is the proposer of the current round.
    pub fn is_proposer(&self) -> bool {
        self.current
            .as_ref()
            .map(|c| c.val_set().is_proposer(self.address))
            .unwrap_or(false)
    }

    /// True when the hash matches the current proposal or pending request.
    pub fn is_current_proposal(&self, hash: B256) -> bool {
        let Some(current) = self.current.as_ref() else {
            return false;
        };
        if current.proposal().map(|p| p.hash()) == Some(hash) {
            return true;
        }
        current.pending_request().map(|r| r.proposal.hash()) == Some(hash)
    }

    pub(crate) fn round(&self) -> Result<&RoundState<B::Proposal>, ConsensusError> {
        self.current.as_ref().ok_or(ConsensusError::EngineStopped)
    }

    pub(crate) fn round_mut(&mut self) -> Result<&mut RoundState<B::Proposal>, ConsensusError> {
        self.current.as_mut().ok_or(ConsensusError::EngineStopped)
    }

    /// Classify a message view against the current one.
    pub(crate) fn check_view(&self, view: View) -> Result<(), ConsensusError> {
        let current = self.round()?.view();
        match view.cmp(&current) {
            std::cmp::Ordering::Less => Err(ConsensusError::OldMessage),
            std::cmp::Ordering::Greater => Err(ConsensusError::FutureMessage),
            std::cmp::Ordering::Equal => Ok(()),
        }
    }

    /// Transition the phase state and give the backlog a chance to release
    /// messages that became current.
    pub(crate) fn set_state(&mut self, state: State) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        trace!(height = current.height(), round = current.round(), %state, "state transition");
        current.set_state(state);
        self.process_backlog();
    }

    fn process_backlog(&mut self) {
        let Some(current) = self.current.as_ref() else {
            return;
        };
        let released = self.backlog.release(current.view());
        let mux = self.backend.event_mux();
        for (msg, src) in released {
            mux.post(CoreEvent::Backlog {
                msg: Box::new(msg),
                src,
            });
        }
    }

    /// Buffer a future-view message. Returns a round to jump to when enough
    /// distinct peers already moved past us at this height.
    pub(crate) fn store_backlog(&mut self, msg: Message, src: Address) -> Option<u64> {
        if src == self.address {
            trace!("own message is never backlogged");
            return None;
        }
        let code = msg.msg_type().ok()?;
        let view = message_view(&msg)?;
        self.backlog.store(view, msg, src);

        let current = self.current.as_ref()?;
        if code == MsgType::NewView && view.height == current.height() && view.round > current.round()
        {
            let hints = self.round_hints.entry(view.round).or_default();
            hints.insert(src);
            if hints.len() > current.val_set().f() {
                debug!(round = view.round, hints = hints.len(), "peers are ahead, changing round");
                return Some(view.round);
            }
        }
        None
    }

    /// Leave the current round behind and set up `(height', round)`.
    ///
    /// `round > 0` keeps the height (view change); `round == 0` follows the
    /// chain head. The locked proposal and any pending request survive a
    /// view change.
    pub(crate) async fn start_new_round(&mut self, round: u64) {
        if !self.is_running {
            trace!("engine not started");
            return;
        }

        let mut change_view = false;
        let mut retries = MAX_CATCHUP_RETRY;
        let retry_period =
            Duration::from_millis(self.config.request_timeout / MAX_CATCHUP_RETRY);

        let (last_proposal, last_proposer) = loop {
            let (last_proposal, last_proposer) = match self.backend.last_proposal() {
                Ok(head) => head,
                Err(err) => {
                    warn!(%err, "cannot read the chain head");
                    return;
                }
            };
            let Some((height, current_round)) =
                self.current.as_ref().map(|c| (c.height(), c.round()))
            else {
                trace!("starting the initial round");
                break (last_proposal, last_proposer);
            };

            if last_proposal.number() >= height {
                trace!(
                    number = last_proposal.number(),
                    hash = %last_proposal.hash(),
                    "catching up to the latest proposal"
                );
                break (last_proposal, last_proposer);
            } else if last_proposal.number() + 1 == height {
                if round == 0 {
                    // The chain reader has not seen our own commit yet.
                    retries -= 1;
                    if retries == 0 {
                        warn!(height, "chain head never caught up");
                        return;
                    }
                    tokio::time::sleep(retry_period).await;
                    continue;
                }
                if round < current_round {
                    warn!(
                        new_round = round,
                        old_round = current_round,
                        "new round must not regress"
                    );
                    return;
                }
                change_view = true;
                break (last_proposal, last_proposer);
            } else {
                warn!(
                    head = last_proposal.number(),
                    height, "chain head is behind the current height"
                );
                return;
            }
        };

        let new_view = if change_view {
            View::new(self.current.as_ref().expect("view change").height(), round)
        } else {
            View::new(last_proposal.number() + 1, 0)
        };

        let (last_locked, last_pending) = match self.current.take() {
            Some(mut previous) if change_view => (
                previous.last_locked_proposal().cloned(),
                previous.take_pending_request(),
            ),
            _ => (None, None),
        };

        let mut val_set = self.backend.validators(new_view.height);
        val_set.calc_proposer(last_proposer, new_view.round);
        let val_set = Arc::new(val_set);
        let prepare_qc = proposal_to_qc(&last_proposal);

        let mut current = RoundState::new(new_view, val_set.clone(), Some(prepare_qc));
        if change_view {
            if let Some(locked) = last_locked {
                current.set_proposal(locked);
                current.lock_proposal();
            }
            if let Some(pending) = last_pending {
                current.set_pending_request(pending);
            }
        }

        // Replay a buffered request for this height; everything below it is
        // decided and dropped.
        self.pending_requests = self.pending_requests.split_off(&new_view.height);
        if current.pending_request().is_none() {
            if let Some(request) = self.pending_requests.remove(&new_view.height) {
                current.set_pending_request(request);
            }
        }

        self.round_hints.clear();
        self.current = Some(current);

        debug!(
            height = new_view.height,
            round = new_view.round,
            proposer = %val_set.proposer(),
            validators = val_set.size(),
            is_proposer = self.is_proposer(),
            "new round"
        );

        self.set_state(State::AcceptRequest);
        self.send_new_view().await;
        self.new_round_change_timer();
    }

    pub(crate) fn stop_timer(&mut self) {
        if let Some(timer) = self.round_change_timer.take() {
            timer.abort();
        }
    }

    pub(crate) fn new_round_change_timer(&mut self) {
        self.stop_timer();
        let round = self.current.as_ref().map(|c| c.round()).unwrap_or(0);
        let timeout = round_timeout(self.config.request_timeout, round);
        let tx = self.backend.event_mux().sender();
        self.round_change_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(CoreEvent::Timeout);
        }));
    }

    /// Build a certificate for the current proposal out of collected vote
    /// seals.
    pub(crate) fn assemble_qc(&self, votes: &[Message]) -> Result<QuorumCert, ConsensusError> {
        let current = self.round()?;
        let proposal = current
            .proposal()
            .ok_or(ConsensusError::StateMismatch("no proposal to certify"))?;
        let seals: Vec<Bytes> = votes
            .iter()
            .filter(|m| !m.committed_seal.is_empty())
            .map(|m| m.committed_seal.clone())
            .collect();
        Ok(QuorumCert {
            view: current.view(),
            proposer: current.val_set().proposer(),
            hash: proposal.hash(),
            extra: Bytes::copy_from_slice(proposal.extra()),
            seals,
        })
    }

    /// Validate an inbound certificate.
    ///
    /// Certificates below the current height describe a block that is
    /// already in the chain, so they are matched against the head instead of
    /// re-checking seals (the reconstructed view of an inserted block is not
    /// authoritative). Same-height certificates get full seal recovery
    /// against the validator set of their height.
    pub(crate) fn verify_qc(&self, qc: &QuorumCert) -> Result<(), ConsensusError> {
        let height = self.round()?.height();
        if qc.view.height < height {
            let (last_proposal, _) = self
                .backend
                .last_proposal()
                .map_err(ConsensusError::Backend)?;
            if qc.view.height != last_proposal.number() || qc.hash != last_proposal.hash() {
                return Err(ConsensusError::InvalidQuorumCert(
                    "stale certificate does not match the chain head".into(),
                ));
            }
            return Ok(());
        }
        let val_set = self.backend.validators(qc.view.height);
        qc.verify(&val_set)
    }

    /// Sign and send a vote for the current proposal to the proposer.
    pub(crate) async fn send_vote(&mut self, code: MsgType) -> Result<(), ConsensusError> {
        let (vote, val_set) = {
            let current = self.round()?;
            let vote = current
                .vote()
                .ok_or(ConsensusError::StateMismatch("no proposal to vote on"))?;
            (vote, current.val_set().clone())
        };
        let mut msg = Message::new(code, alloy_rlp::encode(&vote).into());
        let seal = self.signer.sign_hash(vote.seal_hash())?;
        msg.committed_seal = seal.as_bytes().to_vec().into();
        msg.sign(self.signer.as_ref())?;

        trace!(%code, digest = %vote.digest, "sending vote");
        self.backend
            .unicast(&val_set, msg.payload())
            .await
            .map_err(ConsensusError::Backend)
    }

    /// Sign and broadcast a leader message to every validator, self
    /// included.
    pub(crate) async fn broadcast_message(
        &mut self,
        code: MsgType,
        data: Bytes,
    ) -> Result<(), ConsensusError> {
        let val_set = self.round()?.val_set().clone();
        let mut msg = Message::new(code, data);
        msg.sign(self.signer.as_ref())?;
        trace!(%code, "broadcasting");
        self.backend
            .broadcast(&val_set, msg.payload())
            .await
            .map_err(ConsensusError::Backend)
    }
}

/// The view a wire message pertains to, read out of its payload.
fn message_view(msg: &Message) -> Option<View> {
    let code = msg.msg_type().ok()?;
    match code {
        MsgType::NewView => msg
            .decode_data::<bft_traits::NewViewMsg>()
            .ok()
            .map(|d| d.view),
        MsgType::Prepare => msg
            .decode_data::<bft_traits::PrepareMsg>()
            .ok()
            .map(|d| d.view),
        MsgType::PrepareVote | MsgType::PreCommitVote | MsgType::CommitVote => {
            msg.decode_data::<Vote>().ok().map(|v| v.view)
        }
        MsgType::PreCommit | MsgType::Commit | MsgType::Decide => {
            msg.decode_data::<QuorumCert>().ok().map(|qc| qc.view)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestBlock;
    use bft_traits::Signer as _;

    #[test]
    fn test_round_timeout_backoff_is_monotone() {
        let base = 6000;
        assert_eq!(round_timeout(base, 0), Duration::from_millis(6000));
        assert_eq!(
            round_timeout(base, 1),
            Duration::from_millis(6000) + Duration::from_secs(2)
        );
        assert_eq!(
            round_timeout(base, 3),
            Duration::from_millis(6000) + Duration::from_secs(8)
        );
        for round in 0..20 {
            assert!(round_timeout(base, round + 1) > round_timeout(base, round));
        }
    }

    #[test]
    fn test_round_timeout_is_capped() {
        // Far-out rounds must not overflow the shift.
        let t = round_timeout(1000, 400);
        assert_eq!(t, Duration::from_millis(1000) + Duration::from_secs(1u64 << 32));
    }

    #[test]
    fn test_proposal_to_qc_reads_seals_and_salt() {
        let extra = bft_traits::extra::BftExtra {
            validators: Vec::new(),
            seal: Bytes::new(),
            committed_seal: vec![Bytes::from(vec![0xaa; 65])],
            salt: Bytes::from(alloy_rlp::encode(2u64)),
        };
        let block = TestBlock::build(9, B256::ZERO, &extra.encode_extra(&[]));

        let qc = proposal_to_qc(&block);
        assert_eq!(qc.view, View::new(9, 2));
        assert_eq!(qc.hash, Proposal::hash(&block));
        assert_eq!(qc.seals.len(), 1);
        assert_eq!(qc.proposer, Address::ZERO);
    }

    #[test]
    fn test_proposal_to_qc_tolerates_opaque_extra() {
        let block = TestBlock::build(0, B256::ZERO, b"not-consensus-extra");
        let qc = proposal_to_qc(&block);
        assert_eq!(qc.view, View::new(0, 0));
        assert!(qc.seals.is_empty());
    }

    #[test]
    fn test_verify_committed_seal() {
        let signer = bft_traits::KeySigner::from_seed(3);
        let vote = Vote::new(View::new(1, 0), B256::repeat_byte(0x01));

        let mut msg = Message::new(MsgType::PrepareVote, alloy_rlp::encode(&vote).into());
        msg.address = signer.address();
        msg.committed_seal = signer
            .sign_hash(vote.seal_hash())
            .unwrap()
            .as_bytes()
            .to_vec()
            .into();
        assert!(verify_committed_seal(&msg, &vote).is_ok());

        // Seal from a different key.
        msg.committed_seal = bft_traits::KeySigner::from_seed(4)
            .sign_hash(vote.seal_hash())
            .unwrap()
            .as_bytes()
            .to_vec()
            .into();
        assert!(verify_committed_seal(&msg, &vote).is_err());

        // Missing seal.
        msg.committed_seal = Bytes::new();
        assert!(verify_committed_seal(&msg, &vote).is_err());
    }
}
