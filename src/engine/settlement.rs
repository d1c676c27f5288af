//! Settlement calculator.
//!
//! Computes what each participant is owed once a round is FINALIZED or
//! CANCELLED, and records the claim exactly once. Winners get their
//! matched stake back plus a proportional share of the opposing pool,
//! less the fee; the unmatched portion of every stake is refunded
//! whatever the outcome. All arithmetic is integer, with the fee applied
//! through an exact decimal rate.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;

use super::ledger::RoundBook;
use crate::types::{Amount, RoundId, RoundState, Settlement, WagerError};

/// `floor(gross * fee_rate)`.
pub fn fee_for(gross: Amount, fee_rate: Decimal) -> Option<Amount> {
    Decimal::from(gross)
        .checked_mul(fee_rate)?
        .floor()
        .to_u64()
}

/// What the stake at `index` is owed, without recording anything.
pub fn quote(
    book: &RoundBook,
    index: usize,
    fee_rate: Decimal,
    high_threshold: u32,
) -> Result<Settlement, WagerError> {
    let round_id = book.id();
    let stake = &book.stakes[index];

    match book.round.state {
        RoundState::Cancelled => Ok(Settlement {
            payout: 0,
            fee: 0,
            refund: stake.amount,
            won: false,
        }),
        RoundState::Finalized => {
            let outcome = book.round.outcome.ok_or_else(|| WagerError::ConservationViolation {
                round: round_id,
                detail: "finalized round has no outcome".into(),
            })?;
            let refund = stake.unmatched();
            let won = stake.category.is_satisfied_by(outcome, high_threshold);
            if !won || stake.matched == 0 {
                return Ok(Settlement {
                    payout: 0,
                    fee: 0,
                    refund,
                    won,
                });
            }

            let winning_pool = book.pool(stake.category).matched as u128;
            let losing_pool = book.pool(stake.category.complement()).matched as u128;
            let share = stake.matched as u128 * losing_pool / winning_pool;
            let gross = Amount::try_from(stake.matched as u128 + share).map_err(|_| {
                WagerError::ConservationViolation {
                    round: round_id,
                    detail: "gross payout overflow".into(),
                }
            })?;
            let fee = fee_for(gross, fee_rate).ok_or_else(|| WagerError::ConservationViolation {
                round: round_id,
                detail: format!("fee overflow on gross {gross}"),
            })?;
            Ok(Settlement {
                payout: gross - fee,
                fee,
                refund,
                won,
            })
        }
        RoundState::Open | RoundState::Locked => {
            Err(WagerError::RoundNotFinalizedOrCancelled(round_id))
        }
    }
}

/// Compute and record a participant's settlement.
///
/// The claimed flag is set here, under the round lock, before any value
/// leaves the engine. A second call fails with `AlreadyClaimed`.
pub fn settle(
    book: &mut RoundBook,
    participant: &str,
    fee_rate: Decimal,
    high_threshold: u32,
) -> Result<Settlement, WagerError> {
    book.ensure_mutable()?;
    if !book.round.state.is_settleable() {
        return Err(WagerError::RoundNotFinalizedOrCancelled(book.id()));
    }
    let index = book.stake_index(participant)?;
    if book.stakes[index].claimed {
        return Err(WagerError::AlreadyClaimed {
            round: book.id(),
            participant: participant.to_string(),
        });
    }

    let settlement = quote(book, index, fee_rate, high_threshold)?;

    book.stakes[index].claimed = true;
    book.claims_settled += 1;
    book.fees_collected += settlement.fee;

    info!(
        round_id = book.id(),
        participant,
        payout = settlement.payout,
        fee = settlement.fee,
        refund = settlement.refund,
        won = settlement.won,
        "Claim settled"
    );
    Ok(settlement)
}

// ---------------------------------------------------------------------------
// Round statement
// ---------------------------------------------------------------------------

/// Settlement totals over every stake of a resolved round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoundStatement {
    pub round_id: RoundId,
    pub total_staked: Amount,
    pub payouts: Amount,
    pub fees: Amount,
    pub refunds: Amount,
    /// Matched value lost by the losing side (already inside `payouts + fees`).
    pub forfeited: Amount,
    pub claims: usize,
    pub claimed: usize,
}

impl RoundStatement {
    /// Whether every unit staked is accounted for exactly once.
    pub fn is_balanced(&self) -> bool {
        self.payouts as u128 + self.fees as u128 + self.refunds as u128
            == self.total_staked as u128
    }
}

/// Quote every stake of a FINALIZED or CANCELLED round.
pub fn statement(
    book: &RoundBook,
    fee_rate: Decimal,
    high_threshold: u32,
) -> Result<RoundStatement, WagerError> {
    let mut st = RoundStatement {
        round_id: book.id(),
        total_staked: book.round.total_staked,
        claims: book.stakes.len(),
        claimed: book.claims_settled,
        ..RoundStatement::default()
    };
    for (index, stake) in book.stakes.iter().enumerate() {
        let s = quote(book, index, fee_rate, high_threshold)?;
        st.payouts += s.payout;
        st.fees += s.fee;
        st.refunds += s.refund;
        if book.round.state == RoundState::Finalized && !s.won {
            st.forfeited += stake.matched;
        }
    }
    Ok(st)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
