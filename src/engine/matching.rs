//! Matching engine.
//!
//! Keeps the matched totals of each complementary pair (EVEN/ODD,
//! HIGH/LOW) equal, and spreads a pool's matched total across its stakes
//! in proportion to stake size.
//!
//! A stake's matched amount never goes down once assigned. A stake that
//! arrives when nothing new can be matched starts at zero and leaves the
//! existing shares alone. When the pair grows, the new matched total is
//! spread by water-filling: stakes already above the common
//! `matched / staked` level keep what they hold, and the rest share the
//! remainder in proportion to stake size. With no stake above that level
//! (the usual case) this is plain proportional apportionment.
//!
//! Shares are floored first. The leftover units (always fewer than the
//! number of sharing stakes) go one each to the largest fractional
//! remainders, earliest arrival first on ties. That keeps
//! `sum(stake.matched) == pool.matched` exactly, which in turn lets
//! settlement pay winners from the losing pool with no rounding dust.

use tracing::debug;

use super::ledger::RoundBook;
use crate::types::{Amount, OutcomeCategory};

/// What a matching pass changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOutcome {
    pub category: OutcomeCategory,
    pub complement: OutcomeCategory,
    /// Newly matched amount added to both sides.
    pub delta: Amount,
}

/// Run after a new stake lands on `category`.
pub fn rematch(book: &mut RoundBook, category: OutcomeCategory) -> MatchOutcome {
    let complement = category.complement();
    let delta = book
        .pool(category)
        .unmatched()
        .min(book.pool(complement).unmatched());

    if delta == 0 {
        // Existing shares stay as they are; the new stake is unmatched.
        return MatchOutcome {
            category,
            complement,
            delta,
        };
    }

    book.pool_mut(category).matched += delta;
    book.pool_mut(complement).matched += delta;
    apportion(book, complement);
    apportion(book, category);
    book.refresh_totals();

    debug!(
        round_id = book.id(),
        category = %category,
        delta,
        matched = book.pool(category).matched,
        staked = book.pool(category).staked,
        complement_staked = book.pool(complement).staked,
        "Pools rematched"
    );

    MatchOutcome {
        category,
        complement,
        delta,
    }
}

/// Distribute `pool.matched` across the pool's stakes without lowering any
/// stake's current share.
///
/// Requires `pool.matched` to be at least the sum of current shares, which
/// holds because pool totals only grow.
pub fn apportion(book: &mut RoundBook, category: OutcomeCategory) {
    let pool = book.pool(category);
    let mut target = pool.matched as u128;
    let mut sharing_staked = pool.staked as u128;
    if sharing_staked == 0 {
        return;
    }

    // Highest matched/amount ratio first.
    let mut by_ratio: Vec<usize> = pool.stakes.clone();
    by_ratio.sort_by(|&a, &b| {
        let (sa, sb) = (&book.stakes[a], &book.stakes[b]);
        (sb.matched as u128 * sa.amount as u128).cmp(&(sa.matched as u128 * sb.amount as u128))
    });

    // Stakes above the level of whatever is still being shared keep their
    // share. Each one frozen lowers that level, so stop at the first that
    // sits at or below it.
    let mut frozen = 0;
    for &i in &by_ratio {
        let s = &book.stakes[i];
        if sharing_staked == 0 || s.matched as u128 * sharing_staked <= target * s.amount as u128 {
            break;
        }
        target = target.saturating_sub(s.matched as u128);
        sharing_staked -= s.amount as u128;
        frozen += 1;
    }
    if sharing_staked == 0 {
        return;
    }

    let mut sharing: Vec<usize> = by_ratio[frozen..].to_vec();
    // Arena order is arrival order.
    sharing.sort_unstable();

    // (arena index, floored share, remainder)
    let mut shares: Vec<(usize, Amount, u128)> = sharing
        .iter()
        .map(|&i| {
            let numerator = book.stakes[i].amount as u128 * target;
            (i, (numerator / sharing_staked) as Amount, numerator % sharing_staked)
        })
        .collect();

    let assigned: u128 = shares.iter().map(|(_, floor, _)| *floor as u128).sum();
    let leftover = target.saturating_sub(assigned) as usize;

    if leftover > 0 {
        let mut order: Vec<usize> = (0..shares.len()).collect();
        // Stable sort keeps arrival order among equal remainders.
        order.sort_by(|&a, &b| shares[b].2.cmp(&shares[a].2));
        for &pos in order.iter().take(leftover) {
            shares[pos].1 += 1;
        }
    }

    for (i, share, _) in shares {
        book.stakes[i].matched = share;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
