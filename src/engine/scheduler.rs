//! Periodic driver for the time-gated transitions.
//!
//! The engine holds no timers. Each `tick` asks every unresolved round to
//! advance as far as the clock allows (lock, finalize, or cancel after
//! the dispute window) and, when enabled, opens the next draw so there is
//! always a round accepting stakes.

use chrono::Duration;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

use super::lifecycle::Resolution;
use super::Engine;
use crate::config::SchedulerConfig;
use crate::types::{OutcomeValue, RoundId, RoundState, WagerError};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub created: Option<RoundId>,
    pub locked: Vec<RoundId>,
    pub finalized: Vec<(RoundId, OutcomeValue)>,
    pub cancelled: Vec<RoundId>,
    pub failed: Vec<(RoundId, WagerError)>,
}

impl TickReport {
    pub fn is_quiet(&self) -> bool {
        self.created.is_none()
            && self.locked.is_empty()
            && self.finalized.is_empty()
            && self.cancelled.is_empty()
            && self.failed.is_empty()
    }
}

pub struct Scheduler {
    engine: Arc<Engine>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, config: SchedulerConfig) -> Self {
        Self { engine, config }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Advance every unresolved round, then top up the draw schedule.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let pending = self.engine.pending_rounds().await;
        let steps = join_all(pending.into_iter().map(|id| {
            let engine = Arc::clone(&self.engine);
            async move { (id, engine.finalize_or_cancel(id).await) }
        }))
        .await;

        for (id, step) in steps {
            match step {
                Ok(step) => {
                    if step.locked {
                        report.locked.push(id);
                    }
                    match step.resolution {
                        Resolution::Finalized(result) => report.finalized.push((id, result.value)),
                        Resolution::Cancelled => report.cancelled.push(id),
                        Resolution::NotDue
                        | Resolution::AwaitingOutcome
                        | Resolution::AlreadyResolved(_) => {}
                    }
                }
                Err(e) => {
                    warn!(round_id = id, error = %e, "Scheduler could not advance round");
                    report.failed.push((id, e));
                }
            }
        }

        if self.config.auto_create_rounds {
            match self.ensure_open_round().await {
                Ok(created) => report.created = created,
                Err(e) => warn!(error = %e, "Could not open next draw"),
            }
        }

        if !report.is_quiet() {
            info!(
                created = ?report.created,
                locked = report.locked.len(),
                finalized = report.finalized.len(),
                cancelled = report.cancelled.len(),
                failed = report.failed.len(),
                "Scheduler tick"
            );
        }
        report
    }

    /// Create the next draw unless a round is still accepting stakes.
    ///
    /// Draws follow the latest scheduled one at `draw_interval_secs`
    /// spacing; if that slot's lock time has already passed, the next
    /// draw is placed one interval from now.
    async fn ensure_open_round(&self) -> Result<Option<RoundId>, WagerError> {
        let now = self.engine.now();
        let rounds = self.engine.list_rounds().await;
        let accepting = rounds
            .iter()
            .any(|r| r.state == RoundState::Open && r.lock_time > now);
        if accepting {
            return Ok(None);
        }

        let interval = Duration::seconds(self.config.draw_interval_secs);
        let lock_offset = self.engine.config().lock_offset();
        let mut resolution_time = rounds
            .iter()
            .map(|r| r.resolution_time)
            .max()
            .map(|latest| latest + interval)
            .unwrap_or(now + interval);
        if resolution_time - lock_offset <= now {
            resolution_time = now + interval;
        }

        let round = self.engine.create_round(resolution_time).await?;
        Ok(Some(round.id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
