// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Per-round message accumulator, one per phase.

use alloy_primitives::Address;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use bft_traits::{ConsensusError, Message, ValidatorSet};

/// Accumulates at most one message per validator, bound to the validator-set
/// snapshot of its round.
///
/// Inserting again for the same address overwrites the previous message
/// (last write wins), so a validator re-sending after a reconnect never
/// inflates [`MessageSet::size`].
pub struct MessageSet {
    val_set: Arc<ValidatorSet>,
    msgs: Mutex<HashMap<Address, Message>>,
}

impl MessageSet {
    pub fn new(val_set: Arc<ValidatorSet>) -> Self {
        Self {
            val_set,
            msgs: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a message, rejecting senders outside the validator set.
    pub fn add(&self, msg: Message) -> Result<(), ConsensusError> {
        if !self.val_set.contains(msg.address) {
            return Err(ConsensusError::UnauthorizedAddress);
        }
        self.msgs
            .lock()
            .expect("message set poisoned")
            .insert(msg.address, msg);
        Ok(())
    }

    /// Number of distinct signers collected so far.
    pub fn size(&self) -> usize {
        self.msgs.lock().expect("message set poisoned").len()
    }

    pub fn get(&self, address: Address) -> Option<Message> {
        self.msgs
            .lock()
            .expect("message set poisoned")
            .get(&address)
            .cloned()
    }

    pub fn values(&self) -> Vec<Message> {
        self.msgs
            .lock()
            .expect("message set poisoned")
            .values()
            .cloned()
            .collect()
    }
}

impl fmt::Display for MessageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.msgs.lock().expect("message set poisoned");
        let addresses: Vec<String> = guard.keys().map(|a| a.to_string()).collect();
        write!(f, "[{}]", addresses.join(", "))
    }
}
