// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::validator::LeaderPolicy;

/// Tunables of the consensus engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base round timeout in milliseconds. Round `r > 0` waits an extra
    /// `2^r` seconds on top of this.
    pub request_timeout: u64,

    /// Minimum spacing between consecutive blocks. Seconds for the basic
    /// profile, milliseconds for the event-driven one.
    pub block_period: u64,

    /// Proposer selection policy.
    pub leader_policy: LeaderPolicy,

    /// Blocks per validator-set checkpoint. 0 disables periodic rotation.
    pub epoch: u64,
}

impl Config {
    /// Defaults of the timer-driven profile.
    pub fn basic() -> Self {
        Self {
            request_timeout: 6000,
            block_period: 3,
            leader_policy: LeaderPolicy::RoundRobin,
            epoch: 30_000,
        }
    }

    /// Defaults of the event-driven profile.
    pub fn event_driven() -> Self {
        Self {
            request_timeout: 4000,
            block_period: 2000,
            leader_policy: LeaderPolicy::RoundRobin,
            epoch: 0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::basic()
    }
}
