// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Mock implementations used by the test suites.
//!
//! [`TestBlock`] is a minimal proposal with seal-independent hashing, and
//! [`MockBackend`] records every outbound message while looping self-posts
//! back through the event mux, so a single engine can be driven
//! deterministically against hand-crafted peers.

use alloy_primitives::{keccak256, Address, Bytes, B256};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use bft_traits::extra::{filtered_extra, genesis_extra, BftExtra};
use bft_traits::{
    Backend, ConsensusError, EventMux, KeySigner, LeaderPolicy, Message, MsgType, Proposal,
    QuorumCert, Signer, ValidatorSet, View, Vote,
};

/// A block stub: enough header to order, verify and seal.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct TestBlock {
    pub number: u64,
    pub parent_hash: B256,
    pub tx_hash: B256,
    pub extra: Bytes,
}

impl TestBlock {
    pub fn build(number: u64, parent_hash: B256, extra: &[u8]) -> Self {
        Self {
            number,
            parent_hash,
            tx_hash: keccak256(number.to_be_bytes()),
            extra: Bytes::copy_from_slice(extra),
        }
    }

    /// The genesis block of a chain run by the given validators.
    pub fn genesis(validators: &[Address]) -> Self {
        let extra = alloy_primitives::hex::decode(genesis_extra(validators))
            .expect("genesis extra is valid hex");
        Self::build(0, B256::ZERO, &extra)
    }

    /// A child of `parent` carrying an empty consensus extra.
    pub fn next(parent: &TestBlock) -> Self {
        let extra = BftExtra::default().encode_extra(&[]);
        Self::build(parent.number + 1, parent.hash(), &extra)
    }
}

impl Proposal for TestBlock {
    fn hash(&self) -> B256 {
        // Seals are filtered before hashing so sealing never moves the hash.
        let extra = filtered_extra(&self.extra, false).unwrap_or_else(|_| self.extra.to_vec());
        let mut buf = Vec::with_capacity(72 + extra.len());
        buf.extend_from_slice(&self.number.to_be_bytes());
        buf.extend_from_slice(self.parent_hash.as_slice());
        buf.extend_from_slice(self.tx_hash.as_slice());
        buf.extend_from_slice(&extra);
        keccak256(buf)
    }

    fn number(&self) -> u64 {
        self.number
    }

    fn extra(&self) -> &[u8] {
        &self.extra
    }
}

/// How a recorded message left the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SentKind {
    Broadcast,
    Gossip,
    Unicast,
}

/// Backend double: loops self-posts through the mux, records the rest.
pub struct MockBackend {
    address: Address,
    mux: EventMux<TestBlock>,
    val_set: ValidatorSet,
    chain: Mutex<Vec<(TestBlock, Address)>>,
    sent: Mutex<Vec<(SentKind, Bytes)>>,
    committed: Mutex<Vec<TestBlock>>,
    bad: Mutex<HashSet<B256>>,
    reject_proposals: Mutex<bool>,
}

impl MockBackend {
    pub fn new(address: Address, validators: Vec<Address>, genesis: TestBlock) -> Self {
        Self {
            address,
            mux: EventMux::new(),
            val_set: ValidatorSet::new(validators, LeaderPolicy::RoundRobin),
            chain: Mutex::new(vec![(genesis, Address::ZERO)]),
            sent: Mutex::new(Vec::new()),
            committed: Mutex::new(Vec::new()),
            bad: Mutex::new(HashSet::new()),
            reject_proposals: Mutex::new(false),
        }
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<(SentKind, Bytes)> {
        self.sent.lock().expect("mock poisoned").clone()
    }

    /// The codes of everything sent so far, in order.
    pub fn sent_codes(&self) -> Vec<(SentKind, MsgType)> {
        self.sent()
            .iter()
            .filter_map(|(kind, payload)| {
                let msg = Message::from_payload(payload).ok()?;
                Some((*kind, msg.msg_type().ok()?))
            })
            .collect()
    }

    pub fn committed(&self) -> Vec<TestBlock> {
        self.committed.lock().expect("mock poisoned").clone()
    }

    /// Advance the mock chain head, as the inserter would.
    pub fn push_chain(&self, block: TestBlock, proposer: Address) {
        self.chain.lock().expect("mock poisoned").push((block, proposer));
    }

    pub fn chain_height(&self) -> u64 {
        self.chain
            .lock()
            .expect("mock poisoned")
            .last()
            .map(|(b, _)| b.number)
            .unwrap_or(0)
    }

    pub fn set_reject_proposals(&self, reject: bool) {
        *self.reject_proposals.lock().expect("mock poisoned") = reject;
    }

    pub fn mark_bad(&self, hash: B256) {
        self.bad.lock().expect("mock poisoned").insert(hash);
    }

    fn check_proposal(&self) -> Result<(), ConsensusError> {
        if *self.reject_proposals.lock().expect("mock poisoned") {
            return Err(ConsensusError::InvalidProposal(
                "rejected by the mock chain".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MockBackend {
    type Proposal = TestBlock;

    fn address(&self) -> Address {
        self.address
    }

    fn validators(&self, _height: u64) -> ValidatorSet {
        self.val_set.clone()
    }

    fn event_mux(&self) -> &EventMux<TestBlock> {
        &self.mux
    }

    async fn broadcast(&self, _val_set: &ValidatorSet, payload: Bytes) -> Result<()> {
        self.sent
            .lock()
            .expect("mock poisoned")
            .push((SentKind::Broadcast, payload.clone()));
        self.mux.post(bft_traits::CoreEvent::Message { payload });
        Ok(())
    }

    async fn gossip(&self, _val_set: &ValidatorSet, payload: Bytes) -> Result<()> {
        self.sent
            .lock()
            .expect("mock poisoned")
            .push((SentKind::Gossip, payload));
        Ok(())
    }

    async fn unicast(&self, val_set: &ValidatorSet, payload: Bytes) -> Result<()> {
        self.sent
            .lock()
            .expect("mock poisoned")
            .push((SentKind::Unicast, payload.clone()));
        if val_set.is_proposer(self.address) {
            self.mux.post(bft_traits::CoreEvent::Message { payload });
        }
        Ok(())
    }

    async fn pre_commit(&self, proposal: TestBlock, seals: Vec<Bytes>) -> Result<TestBlock> {
        let mut extra = BftExtra::decode_extra(&proposal.extra)
            .map_err(|e| anyhow!("unsealable extra: {e}"))?;
        extra.committed_seal = seals;
        let vanity = &proposal.extra[..bft_traits::EXTRA_VANITY.min(proposal.extra.len())];
        let sealed = extra.encode_extra(vanity);
        Ok(TestBlock {
            extra: sealed.into(),
            ..proposal
        })
    }

    async fn forward_commit(&self, proposal: TestBlock, extra: Bytes) -> Result<TestBlock> {
        Ok(TestBlock { extra, ..proposal })
    }

    async fn commit(&self, proposal: TestBlock) -> Result<()> {
        if self.bad.lock().expect("mock poisoned").contains(&proposal.hash()) {
            return Err(anyhow!("bad proposal"));
        }
        self.committed.lock().expect("mock poisoned").push(proposal);
        Ok(())
    }

    async fn verify(&self, _proposal: &TestBlock) -> Result<(), ConsensusError> {
        self.check_proposal()
    }

    async fn verify_unsealed_proposal(&self, _proposal: &TestBlock) -> Result<(), ConsensusError> {
        self.check_proposal()
    }

    async fn validate_block(&self, _proposal: &TestBlock) -> Result<(), ConsensusError> {
        self.check_proposal()
    }

    fn last_proposal(&self) -> Result<(TestBlock, Address)> {
        self.chain
            .lock()
            .expect("mock poisoned")
            .last()
            .cloned()
            .ok_or_else(|| anyhow!("empty chain"))
    }

    fn has_bad_proposal(&self, hash: B256) -> bool {
        self.bad.lock().expect("mock poisoned").contains(&hash)
    }
}

/// Deterministic signers, ordered the way the validator set will order
/// their addresses.
pub fn sorted_signers(n: usize) -> Vec<KeySigner> {
    let mut signers: Vec<KeySigner> = (0..n as u64).map(KeySigner::from_seed).collect();
    signers.sort_by_key(|s| s.address());
    signers
}

pub fn addresses_of(signers: &[KeySigner]) -> Vec<Address> {
    signers.iter().map(|s| s.address()).collect()
}

/// Wire payload of a signed phase message from `signer`.
pub fn signed_payload(signer: &KeySigner, code: MsgType, data: Bytes) -> Bytes {
    let mut msg = Message::new(code, data);
    msg.sign(signer).expect("test signer");
    msg.payload()
}

/// Wire payload of a signed vote, committed seal included.
pub fn vote_payload(signer: &KeySigner, code: MsgType, vote: &Vote) -> Bytes {
    let mut msg = Message::new(code, alloy_rlp::encode(vote).into());
    let seal = signer.sign_hash(vote.seal_hash()).expect("test signer");
    msg.committed_seal = seal.as_bytes().to_vec().into();
    msg.sign(signer).expect("test signer");
    msg.payload()
}

/// A quorum certificate over `(view, hash)` sealed by the given signers.
pub fn make_qc(view: View, hash: B256, extra: Bytes, signers: &[&KeySigner]) -> QuorumCert {
    let mut qc = QuorumCert {
        view,
        proposer: signers.first().map(|s| s.address()).unwrap_or_default(),
        hash,
        extra,
        seals: Vec::new(),
    };
    let digest = qc.seal_hash();
    for signer in signers {
        let seal = signer.sign_hash(digest).expect("test signer");
        qc.seals.push(seal.as_bytes().to_vec().into());
    }
    qc
}

/// One engine wired to a mock backend, stepped deterministically.
pub struct TestNode {
    pub core: crate::engine::Core<MockBackend>,
    pub backend: Arc<MockBackend>,
    pub signers: Vec<KeySigner>,
}

impl TestNode {
    /// Start validator `index` of an `n`-validator chain at height 1.
    /// The round timer is pushed far out so tests drive timeouts by hand.
    pub async fn start(n: usize, index: usize) -> Self {
        let signers = sorted_signers(n);
        let addrs = addresses_of(&signers);
        let genesis = TestBlock::genesis(&addrs);
        let backend = Arc::new(MockBackend::new(addrs[index], addrs, genesis));

        let config = bft_traits::Config {
            request_timeout: 600_000,
            ..bft_traits::Config::basic()
        };
        let mut core =
            crate::engine::Core::new(backend.clone(), config, Arc::new(signers[index].clone()));
        core.start().await.expect("engine starts");
        core.process_pending().await;

        Self {
            core,
            backend,
            signers,
        }
    }

    pub fn genesis(&self) -> TestBlock {
        TestBlock::genesis(&addresses_of(&self.signers))
    }

    /// The certificate every node announces at height 1, round 0.
    pub fn bootstrap_qc(&self) -> QuorumCert {
        crate::engine::proposal_to_qc(&self.genesis())
    }

    /// Inject a wire payload and drain the resulting event cascade.
    pub async fn deliver(&mut self, payload: Bytes) {
        self.backend
            .event_mux()
            .post(bft_traits::CoreEvent::Message { payload });
        self.core.process_pending().await;
    }

    /// Post a proposal request and drain.
    pub async fn request(&mut self, proposal: TestBlock) {
        self.backend
            .event_mux()
            .post(bft_traits::CoreEvent::Request { proposal });
        self.core.process_pending().await;
    }

    /// Fire the round-change timer by hand and drain.
    pub async fn timeout(&mut self) {
        self.core.handle_event(bft_traits::CoreEvent::Timeout).await;
        self.core.process_pending().await;
    }
}
