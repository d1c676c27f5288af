//! Round lifecycle controller.
//!
//! OPEN → LOCKED → FINALIZED, or OPEN/LOCKED → CANCELLED. The only
//! backwards edge is a dispute, which returns a FINALIZED round to LOCKED
//! inside its dispute window. Every transition here is a pure function of
//! the book and the supplied `now`; the caller holds the round's lock.

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use super::ledger::RoundBook;
use crate::types::{ConsensusResult, OutcomeValue, RoundState, WagerError};

/// Outcome of a scheduler-driven `finalize_or_cancel` pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Lock time not reached yet.
    NotDue,
    /// Locked, waiting for the draw or for quorum.
    AwaitingOutcome,
    Finalized(ConsensusResult),
    Cancelled,
    /// Already FINALIZED or CANCELLED before this call.
    AlreadyResolved(RoundState),
}

/// A resolution pass may also lock a round that the scheduler missed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionStep {
    pub locked: bool,
    pub resolution: Resolution,
}

/// Gate for `place_stake`.
pub fn ensure_accepting_stakes(book: &RoundBook, now: DateTime<Utc>) -> Result<(), WagerError> {
    if book.round.state != RoundState::Open {
        return Err(WagerError::RoundNotOpen(book.id()));
    }
    if now >= book.round.lock_time {
        return Err(WagerError::PastLockTime(book.id()));
    }
    Ok(())
}

/// OPEN → LOCKED once `now >= lock_time`.
///
/// Returns `Ok(true)` if this call performed the transition and
/// `Ok(false)` if the round had already left OPEN.
pub fn lock(book: &mut RoundBook, now: DateTime<Utc>) -> Result<bool, WagerError> {
    if book.round.state != RoundState::Open {
        return Ok(false);
    }
    if now < book.round.lock_time {
        return Err(WagerError::LockTimeNotReached(book.id()));
    }
    book.round.state = RoundState::Locked;
    book.round.locked_at = Some(now);
    info!(
        round_id = book.id(),
        staked = book.round.total_staked,
        matched = book.round.total_matched,
        stakes = book.stakes.len(),
        "Round locked"
    );
    Ok(true)
}

/// LOCKED → FINALIZED with the agreed outcome.
pub fn finalize(
    book: &mut RoundBook,
    result: &ConsensusResult,
    now: DateTime<Utc>,
) -> Result<(), WagerError> {
    match book.round.state {
        RoundState::Locked => {}
        RoundState::Finalized => return Err(WagerError::RoundAlreadyFinalized(book.id())),
        RoundState::Open | RoundState::Cancelled => {
            return Err(WagerError::RoundNotLocked(book.id()))
        }
    }
    if now < book.round.resolution_time {
        return Err(WagerError::ResolutionPending(book.id()));
    }
    book.round.state = RoundState::Finalized;
    book.round.outcome = Some(result.value);
    book.round.finalized_at = Some(now);
    info!(
        round_id = book.id(),
        outcome = result.value,
        sources = ?result.sources,
        "Round finalized"
    );
    Ok(())
}

/// OPEN/LOCKED → CANCELLED. Cancelling a cancelled round is a no-op.
pub fn cancel(book: &mut RoundBook, now: DateTime<Utc>, reason: &str) -> Result<bool, WagerError> {
    match book.round.state {
        RoundState::Cancelled => return Ok(false),
        RoundState::Finalized => return Err(WagerError::RoundAlreadyFinalized(book.id())),
        RoundState::Open | RoundState::Locked => {}
    }
    book.round.state = RoundState::Cancelled;
    book.round.cancelled_at = Some(now);
    info!(
        round_id = book.id(),
        reason,
        refundable = book.round.total_staked,
        "Round cancelled"
    );
    Ok(true)
}

/// FINALIZED → LOCKED: invalidate the consensus result and all reports.
///
/// Only allowed inside the dispute window and before anyone has claimed,
/// so no settled value ever needs to be clawed back.
pub fn reopen(
    book: &mut RoundBook,
    now: DateTime<Utc>,
    dispute_window: Duration,
) -> Result<OutcomeValue, WagerError> {
    if book.round.state != RoundState::Finalized {
        return Err(WagerError::RoundNotFinalized(book.id()));
    }
    let finalized_at = book.round.finalized_at.unwrap_or(book.round.resolution_time);
    if now >= finalized_at + dispute_window {
        return Err(WagerError::DisputeWindowClosed(book.id()));
    }
    if book.claims_settled > 0 {
        return Err(WagerError::DisputeAfterClaims(book.id()));
    }
    let previous = book.round.outcome.unwrap_or_default();
    book.consensus.clear();
    book.round.state = RoundState::Locked;
    book.round.outcome = None;
    book.round.finalized_at = None;
    book.round.reopened_at = Some(now);
    Ok(previous)
}

/// Instant after which a LOCKED round without quorum is cancelled.
pub fn cancel_deadline(book: &RoundBook, dispute_window: Duration) -> DateTime<Utc> {
    book.round.reopened_at.unwrap_or(book.round.resolution_time) + dispute_window
}

/// Drive a round as far as time and received reports allow.
///
/// Safe to call repeatedly; only the first call that can make progress
/// has any effect.
pub fn finalize_or_cancel(
    book: &mut RoundBook,
    now: DateTime<Utc>,
    quorum: usize,
    dispute_window: Duration,
) -> Result<ResolutionStep, WagerError> {
    let state = book.round.state;
    if state.is_terminal() {
        return Ok(ResolutionStep {
            locked: false,
            resolution: Resolution::AlreadyResolved(state),
        });
    }

    let mut locked = false;
    if state == RoundState::Open {
        if now < book.round.lock_time {
            return Ok(ResolutionStep {
                locked,
                resolution: Resolution::NotDue,
            });
        }
        locked = lock(book, now)?;
    }

    if now < book.round.resolution_time {
        return Ok(ResolutionStep {
            locked,
            resolution: Resolution::AwaitingOutcome,
        });
    }

    let round_id = book.id();
    let agreed = match book.consensus.result.clone() {
        Some(result) => Some(result),
        None => book.consensus.try_conclude(round_id, quorum, now),
    };
    if let Some(result) = agreed {
        finalize(book, &result, now)?;
        return Ok(ResolutionStep {
            locked,
            resolution: Resolution::Finalized(result),
        });
    }

    if now >= cancel_deadline(book, dispute_window) {
        cancel(book, now, "no consensus within dispute window")?;
        return Ok(ResolutionStep {
            locked,
            resolution: Resolution::Cancelled,
        });
    }

    Ok(ResolutionStep {
        locked,
        resolution: Resolution::AwaitingOutcome,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
