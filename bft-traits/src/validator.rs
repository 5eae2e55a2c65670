// Copyright (c) Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Ordered validator sets, proposer selection and quorum math.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::warn;

use crate::error::ConsensusError;

/// Proposer selection policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderPolicy {
    #[default]
    RoundRobin,
    Sticky,
    Vrf,
}

/// Pluggable proposer selector: given the set, the previous proposer and the
/// round, pick the proposer for the round.
pub type ProposerSelector = fn(&ValidatorSet, Address, u64) -> Option<Address>;

/// An ordered set of unique validator addresses.
///
/// Addresses are sorted lexicographically at construction and after every
/// mutation, so the proposer rotation is identical on every node. A set is
/// an immutable snapshot once handed to a round; `Clone` yields a fresh
/// owned instance.
#[derive(Clone, Debug)]
pub struct ValidatorSet {
    validators: Vec<Address>,
    policy: LeaderPolicy,
    proposer: Address,
    selector: ProposerSelector,
}

impl ValidatorSet {
    pub fn new(mut addresses: Vec<Address>, policy: LeaderPolicy) -> Self {
        addresses.sort();
        addresses.dedup();
        let proposer = addresses.first().copied().unwrap_or(Address::ZERO);
        let selector = match policy {
            LeaderPolicy::RoundRobin => round_robin_selector,
            LeaderPolicy::Sticky => sticky_selector,
            LeaderPolicy::Vrf => vrf_selector,
        };
        Self {
            validators: addresses,
            policy,
            proposer,
            selector,
        }
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Sorted member addresses.
    pub fn address_list(&self) -> &[Address] {
        &self.validators
    }

    /// Maximum tolerated faulty validators: `ceil(n/3) - 1`.
    pub fn f(&self) -> usize {
        ((self.size() + 2) / 3).saturating_sub(1)
    }

    /// Quorum threshold: `ceil(2n/3)`.
    pub fn q(&self) -> usize {
        (2 * self.size() + 2) / 3
    }

    pub fn policy(&self) -> LeaderPolicy {
        self.policy
    }

    pub fn get_by_index(&self, index: u64) -> Option<Address> {
        self.validators.get(index as usize).copied()
    }

    /// Index of the validator with the given address.
    pub fn get_by_address(&self, address: Address) -> Option<usize> {
        self.validators.iter().position(|v| *v == address)
    }

    pub fn contains(&self, address: Address) -> bool {
        self.get_by_address(address).is_some()
    }

    pub fn proposer(&self) -> Address {
        self.proposer
    }

    pub fn is_proposer(&self, address: Address) -> bool {
        self.proposer == address
    }

    /// Elect the proposer for `round`, rotating from `last_proposer`.
    pub fn calc_proposer(&mut self, last_proposer: Address, round: u64) {
        match (self.selector)(self, last_proposer, round) {
            Some(proposer) => self.proposer = proposer,
            None => warn!(policy = ?self.policy, "selector returned no proposer, keeping current"),
        }
    }

    /// Directly select the proposer by index.
    pub fn calc_proposer_by_index(&mut self, index: u64) {
        if self.is_empty() {
            return;
        }
        let index = if index > 1 {
            (index - 1) % self.size() as u64
        } else {
            0
        };
        self.proposer = self.validators[index as usize];
    }

    /// Insert a validator, keeping the order. Returns false on duplicates.
    pub fn add_validator(&mut self, address: Address) -> bool {
        if self.contains(address) {
            return false;
        }
        self.validators.push(address);
        self.validators.sort();
        true
    }

    /// Remove a validator. Returns false when absent.
    pub fn remove_validator(&mut self, address: Address) -> bool {
        match self.get_by_address(address) {
            Some(index) => {
                self.validators.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of the given addresses that are members of this set.
    pub fn participants_count(&self, list: &[Address]) -> usize {
        list.iter().filter(|a| self.contains(**a)).count()
    }

    /// Validate a committer list: every address a member, all distinct, and
    /// at least `q()` of them.
    pub fn check_quorum(&self, committers: &[Address]) -> Result<(), ConsensusError> {
        let mut seen = HashSet::with_capacity(committers.len());
        for committer in committers {
            if !self.contains(*committer) {
                return Err(ConsensusError::UnauthorizedAddress);
            }
            if !seen.insert(*committer) {
                return Err(ConsensusError::InvalidQuorumCert(format!(
                    "duplicate committer {committer}"
                )));
            }
        }
        if committers.len() < self.q() {
            return Err(ConsensusError::QuorumNotReached {
                got: committers.len(),
                want: self.q(),
            });
        }
        Ok(())
    }

    /// True when both sets hold exactly the same participants.
    pub fn same_participants(&self, other: &ValidatorSet) -> bool {
        self.size() == other.size() && self.participants_count(other.address_list()) == self.size()
    }
}

impl fmt::Display for ValidatorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.validators.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "]")
    }
}

fn seed_of(val_set: &ValidatorSet, proposer: Address, round: u64) -> u64 {
    let offset = val_set.get_by_address(proposer).unwrap_or(0) as u64;
    offset + round
}

fn round_robin_selector(
    val_set: &ValidatorSet,
    last_proposer: Address,
    round: u64,
) -> Option<Address> {
    if val_set.is_empty() {
        return None;
    }
    let seed = if last_proposer.is_zero() {
        round
    } else {
        seed_of(val_set, last_proposer, round) + 1
    };
    val_set.get_by_index(seed % val_set.size() as u64)
}

fn sticky_selector(
    val_set: &ValidatorSet,
    last_proposer: Address,
    round: u64,
) -> Option<Address> {
    if val_set.is_empty() {
        return None;
    }
    let seed = if last_proposer.is_zero() {
        round
    } else {
        seed_of(val_set, last_proposer, round)
    };
    val_set.get_by_index(seed % val_set.size() as u64)
}

// TODO: wire a real VRF before the policy is enabled in any deployment.
fn vrf_selector(_val_set: &ValidatorSet, _last_proposer: Address, _round: u64) -> Option<Address> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn set_of(n: u8) -> ValidatorSet {
        ValidatorSet::new((1..=n).map(addr).collect(), LeaderPolicy::RoundRobin)
    }

    #[test]
    fn test_construction_sorts_and_dedups() {
        let set = ValidatorSet::new(
            vec![addr(3), addr(1), addr(2), addr(1)],
            LeaderPolicy::RoundRobin,
        );
        assert_eq!(set.address_list(), &[addr(1), addr(2), addr(3)]);
        assert_eq!(set.proposer(), addr(1));
    }

    #[test]
    fn test_quorum_math() {
        for (n, f, q) in [(1usize, 0usize, 1usize), (4, 1, 3), (7, 2, 5), (10, 3, 7)] {
            let set = set_of(n as u8);
            assert_eq!(set.size(), n);
            assert_eq!(set.f(), f, "F() for n={n}");
            assert_eq!(set.q(), q, "Q() for n={n}");
        }
    }

    #[test]
    fn test_round_robin_rotation() {
        let mut set = set_of(4);

        // No previous proposer: round picks directly.
        set.calc_proposer(Address::ZERO, 0);
        assert_eq!(set.proposer(), addr(1));
        set.calc_proposer(Address::ZERO, 2);
        assert_eq!(set.proposer(), addr(3));

        // Rotation advances past the previous proposer.
        set.calc_proposer(addr(1), 0);
        assert_eq!(set.proposer(), addr(2));
        set.calc_proposer(addr(4), 0);
        assert_eq!(set.proposer(), addr(1));
        set.calc_proposer(addr(2), 1);
        assert_eq!(set.proposer(), addr(4));
    }

    #[test]
    fn test_sticky_keeps_proposer_at_round_zero() {
        let mut set = ValidatorSet::new((1..=4).map(addr).collect(), LeaderPolicy::Sticky);
        set.calc_proposer(addr(2), 0);
        assert_eq!(set.proposer(), addr(2));
        set.calc_proposer(addr(2), 1);
        assert_eq!(set.proposer(), addr(3));
    }

    #[test]
    fn test_vrf_is_stubbed() {
        let mut set = ValidatorSet::new((1..=4).map(addr).collect(), LeaderPolicy::Vrf);
        let before = set.proposer();
        set.calc_proposer(addr(2), 1);
        assert_eq!(set.proposer(), before);
    }

    #[test]
    fn test_calc_proposer_by_index() {
        let mut set = set_of(4);
        set.calc_proposer_by_index(0);
        assert_eq!(set.proposer(), addr(1));
        set.calc_proposer_by_index(3);
        assert_eq!(set.proposer(), addr(3));
        set.calc_proposer_by_index(5);
        assert_eq!(set.proposer(), addr(1));
    }

    #[test]
    fn test_add_remove_keep_order() {
        let mut set = ValidatorSet::new(vec![addr(1), addr(3)], LeaderPolicy::RoundRobin);
        assert!(set.add_validator(addr(2)));
        assert!(!set.add_validator(addr(2)));
        assert_eq!(set.address_list(), &[addr(1), addr(2), addr(3)]);

        assert!(set.remove_validator(addr(1)));
        assert!(!set.remove_validator(addr(9)));
        assert_eq!(set.address_list(), &[addr(2), addr(3)]);
    }

    #[test]
    fn test_clone_preserves_members_and_policy() {
        let set = ValidatorSet::new((1..=4).map(addr).collect(), LeaderPolicy::Sticky);
        let copy = set.clone();
        assert_eq!(copy.address_list(), set.address_list());
        assert_eq!(copy.policy(), set.policy());
        assert!(copy.same_participants(&set));
    }

    #[test]
    fn test_check_quorum() {
        let set = set_of(4);

        assert!(set.check_quorum(&[addr(1), addr(2), addr(3)]).is_ok());
        assert!(set.check_quorum(&[addr(1), addr(2), addr(3), addr(4)]).is_ok());

        // Below threshold.
        assert!(matches!(
            set.check_quorum(&[addr(1), addr(2)]),
            Err(ConsensusError::QuorumNotReached { got: 2, want: 3 })
        ));
        // Non-member.
        assert!(matches!(
            set.check_quorum(&[addr(1), addr(2), addr(9)]),
            Err(ConsensusError::UnauthorizedAddress)
        ));
        // Duplicate.
        assert!(set.check_quorum(&[addr(1), addr(2), addr(2)]).is_err());
    }

    #[test]
    fn test_single_validator_quorum() {
        let set = set_of(1);
        assert!(set.check_quorum(&[addr(1)]).is_ok());
        assert!(set.check_quorum(&[]).is_err());
    }

    #[test]
    fn test_same_participants_ignores_order_of_construction() {
        let a = ValidatorSet::new(vec![addr(1), addr(2)], LeaderPolicy::RoundRobin);
        let b = ValidatorSet::new(vec![addr(2), addr(1)], LeaderPolicy::Sticky);
        let c = ValidatorSet::new(vec![addr(2), addr(3)], LeaderPolicy::RoundRobin);

        assert!(a.same_participants(&b));
        assert!(!a.same_participants(&c));
    }
}
