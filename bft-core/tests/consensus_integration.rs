// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! End-to-end protocol runs against a single engine, with the other
//! validators played by hand-signed messages.

use alloy_rlp::encode;

use bft_core::engine::State;
use bft_core::testing::{
    make_qc, vote_payload, MockBackend, SentKind, TestBlock, TestNode,
};
use bft_traits::extra::BftExtra;
use bft_traits::{Backend, MsgType, NewViewMsg, Proposal, Signer, View, Vote};

fn new_view_payload(node: &TestNode, from: usize, view: View) -> alloy_primitives::Bytes {
    let data = NewViewMsg {
        view,
        prepare_qc: node.bootstrap_qc(),
    };
    bft_core::testing::signed_payload(&node.signers[from], MsgType::NewView, encode(&data).into())
}

async fn feed_new_views(node: &mut TestNode, from: &[usize], view: View) {
    for &index in from {
        let payload = new_view_payload(node, index, view);
        node.deliver(payload).await;
    }
}

async fn feed_votes(node: &mut TestNode, code: MsgType, from: &[usize], vote: &Vote) {
    for &index in from {
        let payload = vote_payload(&node.signers[index], code, vote);
        node.deliver(payload).await;
    }
}

/// Four validators, height 1, round 0: the leader collects the full vote
/// pipeline and commits a block carrying three committed seals.
#[tokio::test]
async fn test_happy_path_leader_commits() {
    let mut node = TestNode::start(4, 0).await;
    let view = View::new(1, 0);

    assert_eq!(node.core.current_view(), Some(view));
    assert!(node.core.is_proposer());
    // The leader already collected its own announcement.
    assert_eq!(node.core.current_state(), Some(State::AcceptRequest));

    feed_new_views(&mut node, &[1, 2], view).await;
    assert_eq!(node.core.current_state(), Some(State::HighQC));

    let block = TestBlock::next(&node.genesis());
    node.request(block.clone()).await;

    // Broadcasting Prepare loops back, so the leader voted for itself.
    assert_eq!(node.core.current_state(), Some(State::PrepareVote));
    assert!(node.core.is_current_proposal(block.hash()));

    let vote = Vote::new(view, block.hash());
    feed_votes(&mut node, MsgType::PrepareVote, &[1, 2], &vote).await;
    // Quorum reached: PreCommit went out, the leader locked and voted.
    assert_eq!(node.core.current_state(), Some(State::PreCommitVote));

    feed_votes(&mut node, MsgType::PreCommitVote, &[1, 2], &vote).await;
    assert_eq!(node.core.current_state(), Some(State::CommitVote));

    feed_votes(&mut node, MsgType::CommitVote, &[1, 2], &vote).await;
    assert_eq!(node.core.current_state(), Some(State::Committed));

    let committed = node.backend.committed();
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].hash(), block.hash());
    let extra = BftExtra::decode_extra(&committed[0].extra).unwrap();
    assert_eq!(extra.committed_seal.len(), 3);

    let codes: Vec<MsgType> = node
        .backend
        .sent_codes()
        .into_iter()
        .filter(|(kind, _)| *kind == SentKind::Broadcast)
        .map(|(_, code)| code)
        .collect();
    assert_eq!(
        codes,
        vec![
            MsgType::Prepare,
            MsgType::PreCommit,
            MsgType::Commit,
            MsgType::Decide
        ]
    );
}

/// After the chain head moves, everyone advances to height 2 and the
/// rotation hands the lead to the next validator.
#[tokio::test]
async fn test_chain_head_advances_the_height() {
    let mut node = TestNode::start(4, 0).await;
    let view = View::new(1, 0);

    feed_new_views(&mut node, &[1, 2], view).await;
    let block = TestBlock::next(&node.genesis());
    node.request(block.clone()).await;

    let vote = Vote::new(view, block.hash());
    feed_votes(&mut node, MsgType::PrepareVote, &[1, 2], &vote).await;
    feed_votes(&mut node, MsgType::PreCommitVote, &[1, 2], &vote).await;
    feed_votes(&mut node, MsgType::CommitVote, &[1, 2], &vote).await;

    let sealed = node.backend.committed().pop().unwrap();
    node.backend.push_chain(sealed.clone(), node.signers[0].address());
    node.core
        .handle_event(bft_traits::CoreEvent::FinalCommitted {
            number: sealed.number,
            hash: sealed.hash(),
        })
        .await;
    node.core.process_pending().await;

    assert_eq!(node.core.current_view(), Some(View::new(2, 0)));
    // Round robin: the previous proposer hands over to the next address.
    assert!(!node.core.is_proposer());
    assert_eq!(node.core.current_state(), Some(State::NewView));
}

/// A single validator is its own quorum and commits without any peer
/// traffic beyond self-posts.
#[tokio::test]
async fn test_single_validator_commits_alone() {
    let mut node = TestNode::start(1, 0).await;

    assert!(node.core.is_proposer());
    assert_eq!(node.core.current_state(), Some(State::HighQC));

    let block = TestBlock::next(&node.genesis());
    node.request(block.clone()).await;

    assert_eq!(node.core.current_state(), Some(State::Committed));
    let committed = node.backend.committed();
    assert_eq!(committed.len(), 1);
    let extra = BftExtra::decode_extra(&committed[0].extra).unwrap();
    assert_eq!(extra.committed_seal.len(), 1);
}

/// A replica follows the leader's messages through all phases and inserts
/// the sealed block on Decide.
#[tokio::test]
async fn test_replica_follows_and_commits() {
    let mut node = TestNode::start(4, 1).await;
    let view = View::new(1, 0);
    let leader = 0;

    assert!(!node.core.is_proposer());
    assert_eq!(node.core.current_state(), Some(State::NewView));

    let block = TestBlock::next(&node.genesis());
    let prepare = bft_traits::PrepareMsg::encode_proposal(view, &block, node.bootstrap_qc());
    let payload = bft_core::testing::signed_payload(
        &node.signers[leader],
        MsgType::Prepare,
        encode(&prepare).into(),
    );
    node.deliver(payload).await;
    assert_eq!(node.core.current_state(), Some(State::PrepareVote));

    let qc_signers: Vec<&bft_traits::KeySigner> =
        [0usize, 2, 3].iter().map(|i| &node.signers[*i]).collect();
    let qc = make_qc(view, block.hash(), block.extra.clone(), &qc_signers);

    let payload = bft_core::testing::signed_payload(
        &node.signers[leader],
        MsgType::PreCommit,
        encode(&qc).into(),
    );
    node.deliver(payload).await;
    assert_eq!(node.core.current_state(), Some(State::PreCommitVote));

    let payload = bft_core::testing::signed_payload(
        &node.signers[leader],
        MsgType::Commit,
        encode(&qc).into(),
    );
    node.deliver(payload).await;
    assert_eq!(node.core.current_state(), Some(State::CommitVote));

    // The decide certificate carries the sealed extra.
    let sealed = {
        let mut extra = BftExtra::decode_extra(&block.extra).unwrap();
        extra.committed_seal = qc.seals.clone();
        extra.encode_extra(&[])
    };
    let decide = bft_traits::QuorumCert {
        extra: sealed.into(),
        ..qc
    };
    let payload = bft_core::testing::signed_payload(
        &node.signers[leader],
        MsgType::Decide,
        encode(&decide).into(),
    );
    node.deliver(payload).await;

    assert_eq!(node.core.current_state(), Some(State::Committed));
    let committed = node.backend.committed();
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].hash(), block.hash());
    let extra = BftExtra::decode_extra(&committed[0].extra).unwrap();
    assert_eq!(extra.committed_seal.len(), 3);

    // Every phase answered with a unicast vote to the leader.
    let unicasts: Vec<MsgType> = node
        .backend
        .sent_codes()
        .into_iter()
        .filter(|(kind, _)| *kind == SentKind::Unicast)
        .map(|(_, code)| code)
        .collect();
    assert_eq!(
        unicasts,
        vec![
            MsgType::NewView,
            MsgType::PrepareVote,
            MsgType::PreCommitVote,
            MsgType::CommitVote
        ]
    );
}

/// A validator re-sending votes cannot inflate the tally: the set keeps one
/// message per signer, so quorum still needs three distinct voters.
#[tokio::test]
async fn test_double_vote_does_not_reach_quorum() {
    let mut node = TestNode::start(4, 0).await;
    let view = View::new(1, 0);

    feed_new_views(&mut node, &[1, 2], view).await;
    let block = TestBlock::next(&node.genesis());
    node.request(block.clone()).await;
    assert_eq!(node.core.current_state(), Some(State::PrepareVote));

    // Validator 2 votes twice; together with the leader that is still only
    // two distinct signers.
    let vote = Vote::new(view, block.hash());
    feed_votes(&mut node, MsgType::PrepareVote, &[2, 2], &vote).await;
    assert_eq!(node.core.current_state(), Some(State::PrepareVote));

    // A conflicting digest from a validator is dropped outright.
    let conflicting = Vote::new(view, TestBlock::build(1, block.hash(), &[]).hash());
    feed_votes(&mut node, MsgType::PrepareVote, &[3], &conflicting).await;
    assert_eq!(node.core.current_state(), Some(State::PrepareVote));

    // The third distinct honest vote completes the quorum.
    feed_votes(&mut node, MsgType::PrepareVote, &[1], &vote).await;
    assert_eq!(node.core.current_state(), Some(State::PreCommitVote));
}

/// Payloads from outside the validator set are rejected before dispatch.
#[tokio::test]
async fn test_unknown_sender_is_dropped() {
    let mut node = TestNode::start(4, 0).await;
    let outsider = bft_traits::KeySigner::from_seed(99);
    assert!(!node
        .backend
        .validators(1)
        .contains(bft_traits::Signer::address(&outsider)));

    let data = NewViewMsg {
        view: View::new(1, 0),
        prepare_qc: node.bootstrap_qc(),
    };
    let payload =
        bft_core::testing::signed_payload(&outsider, MsgType::NewView, encode(&data).into());
    node.deliver(payload).await;

    // Nothing was collected from the outsider.
    assert_eq!(node.core.current_state(), Some(State::AcceptRequest));
}

// Exercise the narrow engine handle the node would hold.
#[tokio::test]
async fn test_core_engine_contract() {
    use bft_traits::CoreEngine;

    let signers = bft_core::testing::sorted_signers(1);
    let addrs = bft_core::testing::addresses_of(&signers);
    let genesis = TestBlock::genesis(&addrs);
    let backend = std::sync::Arc::new(MockBackend::new(addrs[0], addrs.clone(), genesis));
    let mut core = bft_core::engine::Core::new(
        backend.clone(),
        bft_traits::Config::basic(),
        std::sync::Arc::new(signers[0].clone()),
    );

    assert!(!core.is_running());
    CoreEngine::start(&mut core).await.unwrap();
    assert!(core.is_running());
    assert!(CoreEngine::is_proposer(&core));
    assert!(!CoreEngine::is_current_proposal(&core, alloy_primitives::B256::ZERO));

    CoreEngine::stop(&mut core).await.unwrap();
    assert!(!core.is_running());

    // A stopped engine can subscribe and start again.
    CoreEngine::start(&mut core).await.unwrap();
    assert!(core.is_running());
}
