// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Persisted validator-set history.
//!
//! Epochs form a singly-linked list keyed by start height and walked back to
//! genesis through `last_epoch_start_height`. The store keeps the full
//! history in memory; the database only needs point lookups under two key
//! families:
//!
//! - `current_epoch_height` -> big-endian `u64`
//! - `epoch/<height>` -> JSON of the epoch record

use alloy_primitives::Address;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use bft_traits::extra::BftExtra;
use bft_traits::{LeaderPolicy, ValidatorSet};

const CURRENT_EPOCH_HEIGHT_KEY: &[u8] = b"current_epoch_height";

fn epoch_key(height: u64) -> Vec<u8> {
    format!("epoch/{height}").into_bytes()
}

/// Minimal key/value contract the store persists through.
pub trait KvDb: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
}

/// In-memory [`KvDb`], used by tests and tooling.
#[derive(Default)]
pub struct MemoryDb {
    inner: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvDb for MemoryDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().expect("db poisoned").get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .expect("db poisoned")
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

/// A contiguous height range governed by one validator set. Immutable once
/// persisted.
#[derive(Clone, Debug)]
pub struct Epoch {
    pub start_height: u64,
    pub val_set: ValidatorSet,
    pub last_epoch_start_height: u64,
}

#[derive(Serialize, Deserialize)]
struct EpochJson {
    start_height: u64,
    validators: Vec<Address>,
    last_epoch_start_height: u64,
}

impl Epoch {
    fn to_json(&self) -> Result<Vec<u8>> {
        let json = EpochJson {
            start_height: self.start_height,
            validators: self.val_set.address_list().to_vec(),
            last_epoch_start_height: self.last_epoch_start_height,
        };
        Ok(serde_json::to_vec(&json)?)
    }

    fn from_json(blob: &[u8], policy: LeaderPolicy) -> Result<Self> {
        let json: EpochJson = serde_json::from_slice(blob)?;
        Ok(Self {
            start_height: json.start_height,
            val_set: ValidatorSet::new(json.validators, policy),
            last_epoch_start_height: json.last_epoch_start_height,
        })
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{start_height: {}, last_start_height: {}, val_set: {}, size: {}}}",
            self.start_height,
            self.last_epoch_start_height,
            self.val_set,
            self.val_set.size()
        )
    }
}

/// Epoch history with its persistence. Owned by the backend; created at
/// engine start and torn down with it.
///
/// `max_start_height` is monotone non-decreasing for the lifetime of the
/// store and always equals the largest persisted start height.
pub struct EpochStore<D: KvDb> {
    db: Arc<D>,
    policy: LeaderPolicy,
    epochs: HashMap<u64, Epoch>,
    max_start_height: u64,
}

impl<D: KvDb> EpochStore<D> {
    /// Persist the genesis epoch from the genesis header's extra-data.
    /// Called once when the chain database is initialized.
    pub fn store_genesis(db: &D, genesis_extra: &[u8], policy: LeaderPolicy) -> Result<()> {
        let extra = BftExtra::decode_extra(genesis_extra)
            .map_err(|e| anyhow!("genesis extra-data: {e}"))?;
        let epoch = Epoch {
            start_height: 0,
            val_set: ValidatorSet::new(extra.validators, policy),
            last_epoch_start_height: 0,
        };
        db.put(&epoch_key(0), &epoch.to_json()?)?;
        db.put(CURRENT_EPOCH_HEIGHT_KEY, &0u64.to_be_bytes())
    }

    /// Load the whole epoch chain. A failure here is fatal to the caller:
    /// consensus cannot run without a validator set.
    pub fn load(db: Arc<D>, policy: LeaderPolicy) -> Result<Self> {
        let mut store = Self {
            db,
            policy,
            epochs: HashMap::new(),
            max_start_height: 0,
        };

        let current = store.read_current()?;
        info!(epoch = %current, "loaded current epoch");
        store.max_start_height = current.start_height;
        let mut cursor = current.last_epoch_start_height;
        store.epochs.insert(current.start_height, current);

        while cursor > 0 {
            let epoch = store.read_epoch(cursor)?;
            cursor = epoch.last_epoch_start_height;
        }
        if !store.epochs.contains_key(&0) {
            store.read_epoch(0)?;
        }
        Ok(store)
    }

    /// The validator set whose epoch contains `height`.
    pub fn validators(&self, height: u64) -> ValidatorSet {
        let mut start = self.max_start_height;
        while height < start {
            match self.epochs.get(&start) {
                Some(epoch) if height >= epoch.start_height => break,
                Some(epoch) => start = epoch.last_epoch_start_height,
                None => break,
            }
        }
        self.epochs
            .get(&start)
            .map(|epoch| epoch.val_set.clone())
            .unwrap_or_else(|| ValidatorSet::new(Vec::new(), self.policy))
    }

    /// Record an epoch change as `header` is inserted: when the parent's
    /// extra carries a validator list and the header starts a new range, a
    /// fresh epoch is persisted under the header's number.
    pub fn update_epoch(&mut self, parent_extra: &[u8], header_number: u64) -> Result<()> {
        if header_number <= self.max_start_height || header_number == 1 {
            return Ok(());
        }
        let extra = BftExtra::decode_extra(parent_extra)
            .map_err(|e| anyhow!("parent extra-data: {e}"))?;
        if extra.validators.is_empty() {
            return Ok(());
        }
        self.save_epoch(header_number, extra.validators)
    }

    /// Programmatic epoch insertion, bypassing header extraction.
    pub fn change_epoch(&mut self, height: u64, validators: Vec<Address>) -> Result<()> {
        self.save_epoch(height, validators)
    }

    pub fn max_start_height(&self) -> u64 {
        self.max_start_height
    }

    /// One line per known epoch, for debug surfaces.
    pub fn dump(&self) -> String {
        let mut heights: Vec<u64> = self.epochs.keys().copied().collect();
        heights.sort_unstable();
        heights
            .iter()
            .filter_map(|h| self.epochs.get(h))
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn save_epoch(&mut self, height: u64, validators: Vec<Address>) -> Result<()> {
        if self.epochs.contains_key(&height) {
            return Ok(());
        }
        if self.max_start_height == height {
            warn!(height, "epoch already persisted at this height");
            return Ok(());
        }

        let epoch = Epoch {
            start_height: height,
            val_set: ValidatorSet::new(validators, self.policy),
            last_epoch_start_height: self.max_start_height,
        };
        self.db.put(&epoch_key(height), &epoch.to_json()?)?;
        self.db.put(CURRENT_EPOCH_HEIGHT_KEY, &height.to_be_bytes())?;

        info!(epoch = %epoch, "saved epoch");
        self.epochs.insert(height, epoch);
        self.max_start_height = height;
        Ok(())
    }

    fn read_current(&self) -> Result<Epoch> {
        let blob = self
            .db
            .get(CURRENT_EPOCH_HEIGHT_KEY)?
            .context("no current epoch height")?;
        let bytes: [u8; 8] = blob
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("malformed current epoch height"))?;
        self.read_raw(u64::from_be_bytes(bytes))
    }

    fn read_epoch(&mut self, height: u64) -> Result<Epoch> {
        let epoch = self.read_raw(height)?;
        info!(epoch = %epoch, "read epoch");
        if epoch.start_height > self.max_start_height {
            self.max_start_height = epoch.start_height;
        }
        self.epochs.insert(epoch.start_height, epoch.clone());
        Ok(epoch)
    }

    fn read_raw(&self, height: u64) -> Result<Epoch> {
        let blob = self
            .db
            .get(&epoch_key(height))?
            .with_context(|| format!("no epoch record at height {height}"))?;
        Epoch::from_json(&blob, self.policy)
    }
}
