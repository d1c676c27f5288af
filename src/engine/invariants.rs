//! Invariant checker for round books.
//!
//! Run after every mutation. Valid input sequences can never trip these
//! checks; if one does, the round is frozen and left for manual
//! inspection instead of carrying on with inconsistent numbers.

use rust_decimal::Decimal;
use tracing::error;

use super::ledger::RoundBook;
use super::settlement;
use crate::types::{Amount, OutcomeCategory, WagerError};

/// Check pool and stake consistency. Returns a description of the first
/// violated invariant.
pub fn check_book(book: &RoundBook) -> Result<(), String> {
    let mut staked_total: Amount = 0;
    let mut matched_total: Amount = 0;

    for category in OutcomeCategory::ALL {
        let pool = book.pool(category);
        if pool.matched > pool.staked {
            return Err(format!(
                "{category} matched {} exceeds staked {}",
                pool.matched, pool.staked
            ));
        }
        let complement = book.pool(category.complement());
        if pool.matched != complement.matched {
            return Err(format!(
                "{category} matched {} differs from {} matched {}",
                pool.matched,
                category.complement(),
                complement.matched
            ));
        }

        let mut staked: Amount = 0;
        let mut apportioned: Amount = 0;
        for &i in &pool.stakes {
            let stake = book.stakes.get(i).ok_or_else(|| format!("{category} references missing stake {i}"))?;
            if stake.category != category {
                return Err(format!("stake {i} filed under {category} but is {}", stake.category));
            }
            if stake.matched > stake.amount {
                return Err(format!(
                    "stake {i} matched {} exceeds amount {}",
                    stake.matched, stake.amount
                ));
            }
            staked += stake.amount;
            apportioned += stake.matched;
        }
        if staked != pool.staked {
            return Err(format!("{category} staked {} but stakes sum to {staked}", pool.staked));
        }
        if apportioned != pool.matched {
            return Err(format!(
                "{category} matched {} but stakes sum to {apportioned}",
                pool.matched
            ));
        }

        staked_total += pool.staked;
        matched_total += pool.matched;
    }

    if staked_total != book.round.total_staked {
        return Err(format!(
            "round staked {} but pools sum to {staked_total}",
            book.round.total_staked
        ));
    }
    if matched_total != book.round.total_matched {
        return Err(format!(
            "round matched {} but pools sum to {matched_total}",
            book.round.total_matched
        ));
    }
    Ok(())
}

/// Check that settling every stake would pay out exactly what was staked.
pub fn check_conservation(book: &RoundBook, fee_rate: Decimal, high_threshold: u32) -> Result<(), String> {
    let st = settlement::statement(book, fee_rate, high_threshold).map_err(|e| e.to_string())?;
    if !st.is_balanced() {
        return Err(format!(
            "payouts {} + fees {} + refunds {} != staked {}",
            st.payouts, st.fees, st.refunds, st.total_staked
        ));
    }
    Ok(())
}

/// Run `check` and freeze the round if it fails.
pub fn enforce(
    book: &mut RoundBook,
    check: impl FnOnce(&RoundBook) -> Result<(), String>,
) -> Result<(), WagerError> {
    match check(book) {
        Ok(()) => Ok(()),
        Err(detail) => {
            book.frozen = true;
            error!(
                round_id = book.id(),
                detail = %detail,
                "Invariant violated; round frozen pending inspection"
            );
            Err(WagerError::ConservationViolation {
                round: book.id(),
                detail,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
