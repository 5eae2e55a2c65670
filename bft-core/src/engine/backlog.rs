// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Buffer for messages that arrived ahead of the local view.

use alloy_primitives::Address;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use bft_traits::{Message, View};

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    view: View,
    msg: Message,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.view
            .cmp(&other.view)
            .then_with(|| self.msg.code.cmp(&other.msg.code))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-sender min-heaps of future-view messages, keyed by view.
///
/// Only messages whose view is strictly ahead of the current one belong
/// here; current-view messages with unmet state preconditions are dropped
/// at the handler instead.
#[derive(Default)]
pub struct Backlog {
    queues: HashMap<Address, BinaryHeap<Reverse<Entry>>>,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, view: View, msg: Message, src: Address) {
        self.queues
            .entry(src)
            .or_default()
            .push(Reverse(Entry { view, msg }));
    }

    /// Pop every message that is no longer in the future. Messages at
    /// exactly the current view are returned for re-injection; messages
    /// that fell behind it are dropped.
    pub fn release(&mut self, current: View) -> Vec<(Message, Address)> {
        let mut released = Vec::new();
        for (src, queue) in self.queues.iter_mut() {
            while let Some(Reverse(head)) = queue.peek() {
                if head.view > current {
                    break;
                }
                let Reverse(entry) = queue.pop().expect("peeked entry");
                if entry.view == current {
                    released.push((entry.msg, *src));
                }
            }
        }
        self.queues.retain(|_, queue| !queue.is_empty());
        released
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
