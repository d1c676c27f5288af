//! Stake ledger and pool aggregation.
//!
//! A `RoundBook` owns everything the engine knows about one round: the
//! round header, a dense arena of stakes with stable indices, one
//! `OutcomePool` per category, and the consensus state. The `Engine`
//! guards each book with its own mutex so all mutations of a round are
//! serialized while different rounds proceed independently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::consensus::ConsensusState;
use crate::types::{
    Amount, OutcomeCategory, OutcomePool, ParticipantId, Round, RoundId, RoundState, Stake,
    WagerError,
};

/// Per-round owned state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundBook {
    pub round: Round,
    /// Stake arena; indices are stable for the life of the round.
    pub stakes: Vec<Stake>,
    /// Participant → arena index.
    pub by_participant: HashMap<ParticipantId, usize>,
    /// Indexed by `OutcomeCategory::index()`.
    pub pools: [OutcomePool; 4],
    pub consensus: ConsensusState,
    /// Number of stakes whose claim has been settled.
    pub claims_settled: usize,
    /// Fees retained from settled claims.
    pub fees_collected: Amount,
    /// Set after a conservation violation; blocks further mutation.
    pub frozen: bool,
}

impl RoundBook {
    pub fn new(id: RoundId, resolution_time: DateTime<Utc>, lock_time: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            round: Round {
                id,
                resolution_time,
                lock_time,
                state: RoundState::Open,
                outcome: None,
                total_staked: 0,
                total_matched: 0,
                created_at: now,
                locked_at: None,
                finalized_at: None,
                cancelled_at: None,
                reopened_at: None,
            },
            stakes: Vec::new(),
            by_participant: HashMap::new(),
            pools: Default::default(),
            consensus: ConsensusState::default(),
            claims_settled: 0,
            fees_collected: 0,
            frozen: false,
        }
    }

    pub fn id(&self) -> RoundId {
        self.round.id
    }

    pub fn pool(&self, category: OutcomeCategory) -> &OutcomePool {
        &self.pools[category.index()]
    }

    pub fn pool_mut(&mut self, category: OutcomeCategory) -> &mut OutcomePool {
        &mut self.pools[category.index()]
    }

    pub fn stake_of(&self, participant: &str) -> Option<&Stake> {
        self.by_participant.get(participant).map(|&i| &self.stakes[i])
    }

    pub fn stake_index(&self, participant: &str) -> Result<usize, WagerError> {
        self.by_participant
            .get(participant)
            .copied()
            .ok_or_else(|| WagerError::StakeNotFound {
                round: self.round.id,
                participant: participant.to_string(),
            })
    }

    /// Refuse any mutation on a frozen round.
    pub fn ensure_mutable(&self) -> Result<(), WagerError> {
        if self.frozen {
            Err(WagerError::RoundFrozen(self.round.id))
        } else {
            Ok(())
        }
    }

    /// Append a stake to the arena and its pool.
    ///
    /// Callers have already checked the lifecycle gates; this only
    /// enforces the one-stake-per-participant rule and the totals.
    pub fn record_stake(
        &mut self,
        participant: &str,
        category: OutcomeCategory,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> Result<usize, WagerError> {
        if self.by_participant.contains_key(participant) {
            return Err(WagerError::DuplicateStake {
                round: self.round.id,
                participant: participant.to_string(),
            });
        }
        let pool_total = self
            .pool(category)
            .staked
            .checked_add(amount)
            .ok_or_else(|| self.overflow("pool staked total"))?;
        let round_total = self
            .round
            .total_staked
            .checked_add(amount)
            .ok_or_else(|| self.overflow("round staked total"))?;

        let index = self.stakes.len();
        self.stakes.push(Stake {
            round_id: self.round.id,
            participant: participant.to_string(),
            category,
            amount,
            matched: 0,
            claimed: false,
            created_at: now,
        });
        self.by_participant.insert(participant.to_string(), index);

        let pool = self.pool_mut(category);
        pool.staked = pool_total;
        pool.stakes.push(index);
        self.round.total_staked = round_total;
        Ok(index)
    }

    /// Re-derive the round's matched total from its pools.
    pub fn refresh_totals(&mut self) {
        self.round.total_matched = self.pools.iter().map(|p| p.matched).sum();
    }

    /// Matched totals per category, in pool order.
    pub fn matched_snapshot(&self) -> Vec<(OutcomeCategory, Amount)> {
        OutcomeCategory::ALL
            .iter()
            .map(|c| (*c, self.pool(*c).matched))
            .collect()
    }

    /// Sum of individual matched amounts within one pool.
    pub fn apportioned(&self, category: OutcomeCategory) -> Amount {
        self.pool(category)
            .stakes
            .iter()
            .map(|&i| self.stakes[i].matched)
            .sum()
    }

    fn overflow(&self, what: &str) -> WagerError {
        WagerError::ConservationViolation {
            round: self.round.id,
            detail: format!("{what} overflow"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
