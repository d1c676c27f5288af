//! Shared types for the PEERWAGER engine.
//!
//! These types form the data model used across all modules.
//! They are kept free of engine logic so that the ledger, matching,
//! consensus and settlement modules can depend on them without
//! circular references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic round identifier.
pub type RoundId = u64;
/// Opaque participant identity (wallet address, account id, ...).
pub type ParticipantId = String;
/// Identity of an outcome reporting source.
pub type SourceId = String;
/// Value in integer base units.
pub type Amount = u64;
/// A draw result reported by the sources.
pub type OutcomeValue = u32;

// ---------------------------------------------------------------------------
// Outcome categories
// ---------------------------------------------------------------------------

/// A prediction bucket a participant can stake on.
///
/// Combined buckets (EVEN-HIGH and friends) have no complement and are
/// rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OutcomeCategory {
    Even,
    Odd,
    High,
    Low,
}

impl OutcomeCategory {
    /// All known categories, in pool-index order.
    pub const ALL: [OutcomeCategory; 4] = [
        OutcomeCategory::Even,
        OutcomeCategory::Odd,
        OutcomeCategory::High,
        OutcomeCategory::Low,
    ];

    /// The category whose stakes are matched against this one.
    pub fn complement(&self) -> Self {
        match self {
            OutcomeCategory::Even => OutcomeCategory::Odd,
            OutcomeCategory::Odd => OutcomeCategory::Even,
            OutcomeCategory::High => OutcomeCategory::Low,
            OutcomeCategory::Low => OutcomeCategory::High,
        }
    }

    /// Stable slot of this category in a round's pool array.
    pub fn index(&self) -> usize {
        match self {
            OutcomeCategory::Even => 0,
            OutcomeCategory::Odd => 1,
            OutcomeCategory::High => 2,
            OutcomeCategory::Low => 3,
        }
    }

    /// Whether a draw value satisfies this category.
    pub fn is_satisfied_by(&self, value: OutcomeValue, high_threshold: OutcomeValue) -> bool {
        match self {
            OutcomeCategory::Even => value % 2 == 0,
            OutcomeCategory::Odd => value % 2 == 1,
            OutcomeCategory::High => value >= high_threshold,
            OutcomeCategory::Low => value < high_threshold,
        }
    }
}

impl fmt::Display for OutcomeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeCategory::Even => write!(f, "EVEN"),
            OutcomeCategory::Odd => write!(f, "ODD"),
            OutcomeCategory::High => write!(f, "HIGH"),
            OutcomeCategory::Low => write!(f, "LOW"),
        }
    }
}

/// Parse a category name (case-insensitive).
impl std::str::FromStr for OutcomeCategory {
    type Err = WagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "even" => Ok(OutcomeCategory::Even),
            "odd" => Ok(OutcomeCategory::Odd),
            "high" => Ok(OutcomeCategory::High),
            "low" => Ok(OutcomeCategory::Low),
            _ => Err(WagerError::UnsupportedCategory(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Round lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle phase of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundState {
    /// Accepting stakes.
    Open,
    /// No new stakes, matching frozen, awaiting outcome.
    Locked,
    /// Outcome set, claims allowed.
    Finalized,
    /// Round voided, every stake fully refundable.
    Cancelled,
}

impl RoundState {
    /// Whether claims may be settled in this state.
    pub fn is_settleable(&self) -> bool {
        matches!(self, RoundState::Finalized | RoundState::Cancelled)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_settleable()
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundState::Open => write!(f, "OPEN"),
            RoundState::Locked => write!(f, "LOCKED"),
            RoundState::Finalized => write!(f, "FINALIZED"),
            RoundState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// One betting cycle tied to a single draw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub resolution_time: DateTime<Utc>,
    /// `resolution_time` minus the configured lock offset.
    pub lock_time: DateTime<Utc>,
    pub state: RoundState,
    pub outcome: Option<OutcomeValue>,
    pub total_staked: Amount,
    /// Sum of matched totals over every pool.
    pub total_matched: Amount,
    pub created_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Set when a dispute returned the round to LOCKED.
    pub reopened_at: Option<DateTime<Utc>>,
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Round #{} [{}] staked={} matched={} resolves={}",
            self.id,
            self.state,
            self.total_staked,
            self.total_matched,
            self.resolution_time.to_rfc3339(),
        )?;
        if let Some(outcome) = self.outcome {
            write!(f, " outcome={outcome}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stakes & pools
// ---------------------------------------------------------------------------

/// A participant's single wager in a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stake {
    pub round_id: RoundId,
    pub participant: ParticipantId,
    pub category: OutcomeCategory,
    pub amount: Amount,
    /// Portion paired against the complement, always `<= amount`.
    pub matched: Amount,
    pub claimed: bool,
    pub created_at: DateTime<Utc>,
}

impl Stake {
    /// Portion with no opposing counterpart; always refunded.
    pub fn unmatched(&self) -> Amount {
        self.amount - self.matched
    }
}

impl fmt::Display for Stake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} (matched {}){}",
            self.participant,
            self.category,
            self.amount,
            self.matched,
            if self.claimed { " [claimed]" } else { "" },
        )
    }
}

/// Running totals for one category within one round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomePool {
    pub staked: Amount,
    pub matched: Amount,
    /// Arena indices of the stakes in this pool, in arrival order.
    pub stakes: Vec<usize>,
}

impl OutcomePool {
    pub fn unmatched(&self) -> Amount {
        self.staked - self.matched
    }
}

// ---------------------------------------------------------------------------
// Consensus
// ---------------------------------------------------------------------------

/// A single source's claim about a round's draw value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeReport {
    pub round_id: RoundId,
    pub source: SourceId,
    pub value: OutcomeValue,
    pub reported_at: DateTime<Utc>,
}

/// The agreed outcome of a round once quorum is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub round_id: RoundId,
    pub value: OutcomeValue,
    pub sources: Vec<SourceId>,
    pub finalized_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

/// Value owed to one participant for one round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    /// Matched winnings net of fee.
    pub payout: Amount,
    pub fee: Amount,
    /// Unmatched stake (or the full stake on a cancelled round).
    pub refund: Amount,
    pub won: bool,
}

impl Settlement {
    /// Amount to hand to the transfer primitive.
    pub fn total(&self) -> Amount {
        self.payout + self.refund
    }
}

impl fmt::Display for Settlement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "payout={} fee={} refund={} ({})",
            self.payout,
            self.fee,
            self.refund,
            if self.won { "won" } else { "no win" },
        )
    }
}

// ---------------------------------------------------------------------------
// Outbound events
// ---------------------------------------------------------------------------

/// Events consumed by the broadcast / UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    RoundCreated {
        round: RoundId,
        resolution_time: DateTime<Utc>,
        lock_time: DateTime<Utc>,
    },
    PoolUpdated {
        round: RoundId,
        category: OutcomeCategory,
        staked: Amount,
        matched: Amount,
    },
    RoundLocked {
        round: RoundId,
        matched_snapshot: Vec<(OutcomeCategory, Amount)>,
    },
    ReportAccepted {
        round: RoundId,
        source: SourceId,
        value: OutcomeValue,
    },
    RoundFinalized {
        round: RoundId,
        outcome: OutcomeValue,
    },
    RoundCancelled {
        round: RoundId,
    },
    RoundDisputed {
        round: RoundId,
        actor: String,
    },
    Settled {
        round: RoundId,
        participant: ParticipantId,
        payout: Amount,
        refund: Amount,
    },
}

impl EngineEvent {
    /// Round the event belongs to.
    pub fn round(&self) -> RoundId {
        match self {
            EngineEvent::RoundCreated { round, .. }
            | EngineEvent::PoolUpdated { round, .. }
            | EngineEvent::RoundLocked { round, .. }
            | EngineEvent::ReportAccepted { round, .. }
            | EngineEvent::RoundFinalized { round, .. }
            | EngineEvent::RoundCancelled { round }
            | EngineEvent::RoundDisputed { round, .. }
            | EngineEvent::Settled { round, .. } => *round,
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Broad classes of engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; nothing mutated.
    Validation,
    /// Wrong lifecycle phase; nothing mutated, retry once the precondition holds.
    State,
    /// Internal consistency failure; the round is frozen.
    Internal,
}

/// Domain-specific error types for the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WagerError {
    #[error("Round not found: {0}")]
    RoundNotFound(RoundId),

    #[error("No stake for {participant} in round {round}")]
    StakeNotFound { round: RoundId, participant: ParticipantId },

    #[error("Round {0} is not open for stakes")]
    RoundNotOpen(RoundId),

    #[error("Round {0} is past its lock time")]
    PastLockTime(RoundId),

    #[error("{participant} already staked in round {round}")]
    DuplicateStake { round: RoundId, participant: ParticipantId },

    #[error("Stake amount {amount} outside [{min}, {max}]")]
    AmountOutOfBounds { amount: Amount, min: Amount, max: Amount },

    #[error("Unsupported outcome category: {0}")]
    UnsupportedCategory(String),

    #[error("Invalid identity: {0:?}")]
    InvalidIdentity(String),

    #[error("Outcome value {value} outside 0..={max}")]
    InvalidOutcome { value: OutcomeValue, max: OutcomeValue },

    #[error("Resolution time {0} leaves no betting window")]
    InvalidResolutionTime(DateTime<Utc>),

    #[error("Unknown outcome source: {0}")]
    UnknownSource(SourceId),

    #[error("Source {reporter} already reported for round {round}")]
    DuplicateReport { round: RoundId, reporter: SourceId },

    #[error("Round {0} is already finalized")]
    RoundAlreadyFinalized(RoundId),

    #[error("Round {0} is not locked")]
    RoundNotLocked(RoundId),

    #[error("Round {0} has not reached its resolution time")]
    ResolutionPending(RoundId),

    #[error("Round {0} is not finalized")]
    RoundNotFinalized(RoundId),

    #[error("Round {0} has not reached its lock time")]
    LockTimeNotReached(RoundId),

    #[error("Round {0} is neither finalized nor cancelled")]
    RoundNotFinalizedOrCancelled(RoundId),

    #[error("{participant} already claimed round {round}")]
    AlreadyClaimed { round: RoundId, participant: ParticipantId },

    #[error("Dispute window for round {0} has closed")]
    DisputeWindowClosed(RoundId),

    #[error("Round {0} already has settled claims and cannot be disputed")]
    DisputeAfterClaims(RoundId),

    #[error("{0} is not authorised for this action")]
    Unauthorized(String),

    #[error("Round {0} is frozen pending manual inspection")]
    RoundFrozen(RoundId),

    #[error("Conservation violation in round {round}: {detail}")]
    ConservationViolation { round: RoundId, detail: String },
}

impl WagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WagerError::RoundNotFound(_)
            | WagerError::StakeNotFound { .. }
            | WagerError::AmountOutOfBounds { .. }
            | WagerError::UnsupportedCategory(_)
            | WagerError::InvalidIdentity(_)
            | WagerError::InvalidOutcome { .. }
            | WagerError::InvalidResolutionTime(_)
            | WagerError::UnknownSource(_)
            | WagerError::Unauthorized(_) => ErrorKind::Validation,
            WagerError::RoundNotOpen(_)
            | WagerError::PastLockTime(_)
            | WagerError::DuplicateStake { .. }
            | WagerError::DuplicateReport { .. }
            | WagerError::RoundAlreadyFinalized(_)
            | WagerError::RoundNotLocked(_)
            | WagerError::ResolutionPending(_)
            | WagerError::RoundNotFinalized(_)
            | WagerError::LockTimeNotReached(_)
            | WagerError::RoundNotFinalizedOrCancelled(_)
            | WagerError::AlreadyClaimed { .. }
            | WagerError::DisputeWindowClosed(_)
            | WagerError::DisputeAfterClaims(_) => ErrorKind::State,
            WagerError::RoundFrozen(_) | WagerError::ConservationViolation { .. } => {
                ErrorKind::Internal
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
