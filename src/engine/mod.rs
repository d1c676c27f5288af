//! Core engine: the `Engine` service wiring ledger, matching, lifecycle,
//! consensus and settlement behind one async API.
//!
//! Each round lives in its own `RoundBook` behind its own mutex, so every
//! mutation of a round is serialized while different rounds run in
//! parallel. The engine never reads wall time itself (see `Clock`) and
//! holds no timers; the `scheduler` drives the time-gated transitions.

pub mod consensus;
pub mod invariants;
pub mod ledger;
pub mod lifecycle;
pub mod matching;
pub mod scheduler;
pub mod settlement;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::{ConsensusConfig, EngineConfig};
use crate::storage::EngineSnapshot;
use crate::transfer::{TransferGateway, TransferInstruction, TransferReceipt};
use crate::types::{
    Amount, ConsensusResult, EngineEvent, OutcomeCategory, OutcomeReport, OutcomeValue,
    ParticipantId, Round, RoundId, RoundState, Settlement, Stake, WagerError,
};

use ledger::RoundBook;
use lifecycle::{Resolution, ResolutionStep};
use settlement::RoundStatement;

/// Capacity of the outbound event channel. Slow subscribers lag rather
/// than block the engine.
const EVENT_CAPACITY: usize = 1024;

type RoundHandle = Arc<Mutex<RoundBook>>;

// ---------------------------------------------------------------------------
// Read models and receipts
// ---------------------------------------------------------------------------

/// One pool as seen from outside the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolView {
    pub category: OutcomeCategory,
    pub staked: Amount,
    pub matched: Amount,
    pub stakes: usize,
}

/// Read-only snapshot of a round.
#[derive(Debug, Clone, Serialize)]
pub struct RoundView {
    pub round: Round,
    pub pools: Vec<PoolView>,
    pub stakes: Vec<Stake>,
    pub reports: Vec<OutcomeReport>,
    pub consensus: Option<ConsensusResult>,
    pub claims_settled: usize,
    pub fees_collected: Amount,
    pub frozen: bool,
}

impl RoundView {
    fn of(book: &RoundBook) -> Self {
        Self {
            round: book.round.clone(),
            pools: OutcomeCategory::ALL
                .iter()
                .map(|&category| {
                    let pool = book.pool(category);
                    PoolView {
                        category,
                        staked: pool.staked,
                        matched: pool.matched,
                        stakes: pool.stakes.len(),
                    }
                })
                .collect(),
            stakes: book.stakes.clone(),
            reports: book.consensus.reports.clone(),
            consensus: book.consensus.result.clone(),
            claims_settled: book.claims_settled,
            fees_collected: book.fees_collected,
            frozen: book.frozen,
        }
    }

    pub fn pool(&self, category: OutcomeCategory) -> Option<&PoolView> {
        self.pools.iter().find(|p| p.category == category)
    }

    pub fn stake(&self, participant: &str) -> Option<&Stake> {
        self.stakes.iter().find(|s| s.participant == participant)
    }
}

/// What happened to the value transfer after a claim was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    Completed(TransferReceipt),
    /// The claim stands; recovering the transfer is the gateway's concern.
    Failed(String),
    /// Nothing owed, so no transfer was requested.
    NothingOwed,
}

/// Result of a successful `settle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettlementReceipt {
    pub round_id: RoundId,
    pub participant: ParticipantId,
    pub settlement: Settlement,
    pub transfer: TransferStatus,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    config: EngineConfig,
    consensus: ConsensusConfig,
    clock: Arc<dyn Clock>,
    gateway: Arc<dyn TransferGateway>,
    rounds: RwLock<BTreeMap<RoundId, RoundHandle>>,
    next_round_id: AtomicU64,
    events: broadcast::Sender<EngineEvent>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        consensus: ConsensusConfig,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn TransferGateway>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            consensus,
            clock,
            gateway,
            rounds: RwLock::new(BTreeMap::new()),
            next_round_id: AtomicU64::new(1),
            events,
        }
    }

    /// Rebuild an engine from a saved snapshot.
    pub fn restore(
        snapshot: EngineSnapshot,
        config: EngineConfig,
        consensus: ConsensusConfig,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn TransferGateway>,
    ) -> Self {
        let highest = snapshot.rounds.iter().map(|b| b.id()).max().unwrap_or(0);
        let next = snapshot.next_round_id.max(highest + 1);
        let rounds: BTreeMap<RoundId, RoundHandle> = snapshot
            .rounds
            .into_iter()
            .map(|book| (book.id(), Arc::new(Mutex::new(book))))
            .collect();
        info!(rounds = rounds.len(), next_round_id = next, "Engine restored from snapshot");

        let engine = Self::new(config, consensus, clock, gateway);
        engine.next_round_id.store(next, Ordering::SeqCst);
        Self {
            rounds: RwLock::new(rounds),
            ..engine
        }
    }

    /// Copy every round for persistence.
    pub async fn snapshot(&self) -> EngineSnapshot {
        let handles: Vec<RoundHandle> = self.rounds.read().await.values().cloned().collect();
        let mut rounds = Vec::with_capacity(handles.len());
        for handle in handles {
            rounds.push(handle.lock().await.clone());
        }
        EngineSnapshot {
            next_round_id: self.next_round_id.load(Ordering::SeqCst),
            saved_at: self.clock.now(),
            rounds,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Subscribe to outbound events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn handle(&self, round: RoundId) -> Result<RoundHandle, WagerError> {
        self.rounds
            .read()
            .await
            .get(&round)
            .cloned()
            .ok_or(WagerError::RoundNotFound(round))
    }

    // -- Inbound operations ----------------------------------------------

    /// Open a new round resolving at `resolution_time`.
    pub async fn create_round(&self, resolution_time: DateTime<Utc>) -> Result<Round, WagerError> {
        let now = self.clock.now();
        let lock_time = resolution_time - self.config.lock_offset();
        if lock_time <= now {
            return Err(WagerError::InvalidResolutionTime(resolution_time));
        }

        let id = self.next_round_id.fetch_add(1, Ordering::SeqCst);
        let book = RoundBook::new(id, resolution_time, lock_time, now);
        let round = book.round.clone();
        self.rounds.write().await.insert(id, Arc::new(Mutex::new(book)));

        info!(
            round_id = id,
            resolution_time = %resolution_time,
            lock_time = %lock_time,
            "Round created"
        );
        self.emit(EngineEvent::RoundCreated {
            round: id,
            resolution_time,
            lock_time,
        });
        Ok(round)
    }

    /// Record a stake and rematch its pair.
    pub async fn place_stake(
        &self,
        round: RoundId,
        participant: &str,
        category: OutcomeCategory,
        amount: Amount,
    ) -> Result<Stake, WagerError> {
        validate_identity(participant)?;
        let handle = self.handle(round).await?;
        let mut book = handle.lock().await;
        book.ensure_mutable()?;

        let now = self.clock.now();
        lifecycle::ensure_accepting_stakes(&book, now)?;
        if book.stake_of(participant).is_some() {
            return Err(WagerError::DuplicateStake {
                round,
                participant: participant.to_string(),
            });
        }
        let (min, max) = (self.config.min_stake, self.config.max_stake);
        if amount < min || amount > max {
            return Err(WagerError::AmountOutOfBounds { amount, min, max });
        }

        let index = book.record_stake(participant, category, amount, now)?;
        let outcome = matching::rematch(&mut book, category);
        invariants::enforce(&mut book, invariants::check_book)?;

        info!(
            round_id = round,
            participant,
            category = %category,
            amount,
            newly_matched = outcome.delta,
            "Stake placed"
        );

        let pool = book.pool(category);
        self.emit(EngineEvent::PoolUpdated {
            round,
            category,
            staked: pool.staked,
            matched: pool.matched,
        });
        if outcome.delta > 0 {
            let other = book.pool(outcome.complement);
            self.emit(EngineEvent::PoolUpdated {
                round,
                category: outcome.complement,
                staked: other.staked,
                matched: other.matched,
            });
        }
        Ok(book.stakes[index].clone())
    }

    /// OPEN → LOCKED. `Ok(false)` if the round had already left OPEN.
    pub async fn lock_round(&self, round: RoundId) -> Result<bool, WagerError> {
        let handle = self.handle(round).await?;
        let mut book = handle.lock().await;
        book.ensure_mutable()?;
        let locked = lifecycle::lock(&mut book, self.clock.now())?;
        if locked {
            self.after_lock(&mut book)?;
        }
        Ok(locked)
    }

    /// Accept an outcome report. Returns the consensus result if this
    /// report completed the quorum and finalized the round.
    pub async fn submit_report(
        &self,
        round: RoundId,
        source: &str,
        value: OutcomeValue,
    ) -> Result<Option<ConsensusResult>, WagerError> {
        if !self.consensus.sources.iter().any(|s| s == source) {
            return Err(WagerError::UnknownSource(source.to_string()));
        }
        if value > self.config.max_outcome {
            return Err(WagerError::InvalidOutcome {
                value,
                max: self.config.max_outcome,
            });
        }

        let handle = self.handle(round).await?;
        let mut book = handle.lock().await;
        book.ensure_mutable()?;

        let now = self.clock.now();
        match book.round.state {
            RoundState::Finalized => return Err(WagerError::RoundAlreadyFinalized(round)),
            RoundState::Cancelled => return Err(WagerError::RoundNotLocked(round)),
            RoundState::Open | RoundState::Locked => {}
        }
        if now < book.round.resolution_time {
            return Err(WagerError::ResolutionPending(round));
        }
        if book.consensus.has_reported(source) {
            return Err(WagerError::DuplicateReport {
                round,
                reporter: source.to_string(),
            });
        }
        // Resolution time is past, so a round the scheduler has not
        // reached yet is locked here first.
        if lifecycle::lock(&mut book, now)? {
            self.after_lock(&mut book)?;
        }

        book.consensus.record(OutcomeReport {
            round_id: round,
            source: source.to_string(),
            value,
            reported_at: now,
        })?;
        info!(round_id = round, source, value, "Outcome report accepted");
        self.emit(EngineEvent::ReportAccepted {
            round,
            source: source.to_string(),
            value,
        });

        let Some(result) = book.consensus.try_conclude(round, self.consensus.quorum, now) else {
            return Ok(None);
        };
        lifecycle::finalize(&mut book, &result, now)?;
        self.after_finalize(&mut book, &result)?;
        Ok(Some(result))
    }

    /// Drive a round as far as time and received reports allow.
    /// Safe to call repeatedly.
    pub async fn finalize_or_cancel(&self, round: RoundId) -> Result<ResolutionStep, WagerError> {
        let handle = self.handle(round).await?;
        let mut book = handle.lock().await;
        book.ensure_mutable()?;

        let step = lifecycle::finalize_or_cancel(
            &mut book,
            self.clock.now(),
            self.consensus.quorum,
            self.config.dispute_window(),
        )?;
        if step.locked {
            self.after_lock(&mut book)?;
        }
        match &step.resolution {
            Resolution::Finalized(result) => self.after_finalize(&mut book, result)?,
            Resolution::Cancelled => self.emit(EngineEvent::RoundCancelled { round }),
            Resolution::NotDue | Resolution::AwaitingOutcome | Resolution::AlreadyResolved(_) => {}
        }
        Ok(step)
    }

    /// Operator cancellation. `Ok(false)` if the round was already cancelled.
    pub async fn cancel_round(&self, round: RoundId, reason: &str) -> Result<bool, WagerError> {
        let handle = self.handle(round).await?;
        let mut book = handle.lock().await;
        book.ensure_mutable()?;
        let cancelled = lifecycle::cancel(&mut book, self.clock.now(), reason)?;
        if cancelled {
            self.emit(EngineEvent::RoundCancelled { round });
        }
        Ok(cancelled)
    }

    /// Invalidate a finalized outcome and return the round to LOCKED.
    pub async fn dispute_outcome(&self, round: RoundId, actor: &str) -> Result<(), WagerError> {
        if !self.consensus.dispute_authorities.iter().any(|a| a == actor) {
            return Err(WagerError::Unauthorized(actor.to_string()));
        }
        let handle = self.handle(round).await?;
        let mut book = handle.lock().await;
        book.ensure_mutable()?;

        let previous = lifecycle::reopen(&mut book, self.clock.now(), self.config.dispute_window())?;
        warn!(
            round_id = round,
            actor,
            previous_outcome = previous,
            "Outcome disputed; round reopened for fresh reports"
        );
        self.emit(EngineEvent::RoundDisputed {
            round,
            actor: actor.to_string(),
        });
        Ok(())
    }

    /// Settle one participant's claim and hand the amount to the gateway.
    ///
    /// The claim is recorded under the round lock before the transfer is
    /// requested; the lock is released before awaiting the gateway.
    pub async fn settle(&self, round: RoundId, participant: &str) -> Result<SettlementReceipt, WagerError> {
        let settlement = {
            let handle = self.handle(round).await?;
            let mut book = handle.lock().await;
            settlement::settle(
                &mut book,
                participant,
                self.config.fee_rate,
                self.config.high_threshold,
            )?
        };

        self.emit(EngineEvent::Settled {
            round,
            participant: participant.to_string(),
            payout: settlement.payout,
            refund: settlement.refund,
        });

        let instruction = TransferInstruction {
            round_id: round,
            participant: participant.to_string(),
            amount: settlement.total(),
        };
        let transfer = if instruction.amount == 0 {
            TransferStatus::NothingOwed
        } else {
            match self.gateway.transfer(&instruction).await {
                Ok(receipt) => TransferStatus::Completed(receipt),
                Err(e) => {
                    warn!(
                        round_id = round,
                        participant,
                        amount = instruction.amount,
                        error = %e,
                        "Transfer failed; claim remains recorded"
                    );
                    TransferStatus::Failed(e.to_string())
                }
            }
        };

        Ok(SettlementReceipt {
            round_id: round,
            participant: participant.to_string(),
            settlement,
            transfer,
        })
    }

    // -- Queries ---------------------------------------------------------

    /// Preview what `settle` would return, without recording anything.
    pub async fn quote(&self, round: RoundId, participant: &str) -> Result<Settlement, WagerError> {
        let handle = self.handle(round).await?;
        let book = handle.lock().await;
        let index = book.stake_index(participant)?;
        settlement::quote(&book, index, self.config.fee_rate, self.config.high_threshold)
    }

    pub async fn round_view(&self, round: RoundId) -> Result<RoundView, WagerError> {
        let handle = self.handle(round).await?;
        let book = handle.lock().await;
        Ok(RoundView::of(&book))
    }

    /// Every round header, in id order.
    pub async fn list_rounds(&self) -> Vec<Round> {
        let handles: Vec<RoundHandle> = self.rounds.read().await.values().cloned().collect();
        let mut rounds = Vec::with_capacity(handles.len());
        for handle in handles {
            rounds.push(handle.lock().await.round.clone());
        }
        rounds
    }

    /// Ids of rounds the scheduler still has to drive: not terminal and
    /// not frozen.
    pub async fn pending_rounds(&self) -> Vec<RoundId> {
        let handles: Vec<RoundHandle> = self.rounds.read().await.values().cloned().collect();
        let mut pending = Vec::new();
        for handle in handles {
            let book = handle.lock().await;
            if !book.round.state.is_terminal() && !book.frozen {
                pending.push(book.id());
            }
        }
        pending
    }

    /// Settlement accounting over every stake of a resolved round.
    pub async fn round_statement(&self, round: RoundId) -> Result<RoundStatement, WagerError> {
        let handle = self.handle(round).await?;
        let book = handle.lock().await;
        settlement::statement(&book, self.config.fee_rate, self.config.high_threshold)
    }

    // -- Transition side effects -------------------------------------------

    fn after_lock(&self, book: &mut RoundBook) -> Result<(), WagerError> {
        invariants::enforce(book, invariants::check_book)?;
        self.emit(EngineEvent::RoundLocked {
            round: book.id(),
            matched_snapshot: book.matched_snapshot(),
        });
        Ok(())
    }

    fn after_finalize(&self, book: &mut RoundBook, result: &ConsensusResult) -> Result<(), WagerError> {
        let (fee_rate, threshold) = (self.config.fee_rate, self.config.high_threshold);
        invariants::enforce(book, |b| invariants::check_conservation(b, fee_rate, threshold))?;
        self.emit(EngineEvent::RoundFinalized {
            round: book.id(),
            outcome: result.value,
        });
        Ok(())
    }
}

/// Participant identities are non-empty, printable and free of whitespace.
fn validate_identity(participant: &str) -> Result<(), WagerError> {
    let well_formed = !participant.is_empty()
        && participant.chars().count() <= 128
        && participant.chars().all(|c| !c.is_whitespace() && !c.is_control());
    if well_formed {
        Ok(())
    } else {
        Err(WagerError::InvalidIdentity(participant.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
