//! Consensus aggregator.
//!
//! Collects one report per source per round and finalizes the first
//! value whose supporters reach the configured quorum. This is a bounded
//! N-source vote, not Byzantine agreement: sources are registered in
//! configuration and trusted to report honestly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{ConsensusResult, OutcomeReport, OutcomeValue, RoundId, SourceId, WagerError};

/// Reports received for a round and the result, once agreed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusState {
    pub reports: Vec<OutcomeReport>,
    pub result: Option<ConsensusResult>,
}

impl ConsensusState {
    pub fn has_reported(&self, source: &str) -> bool {
        self.reports.iter().any(|r| r.source == source)
    }

    /// Append a report. Rejects a second report from the same source.
    pub fn record(&mut self, report: OutcomeReport) -> Result<(), WagerError> {
        if self.has_reported(&report.source) {
            return Err(WagerError::DuplicateReport {
                round: report.round_id,
                reporter: report.source,
            });
        }
        self.reports.push(report);
        Ok(())
    }

    /// Count supporters per reported value, in value order.
    pub fn tally(&self) -> BTreeMap<OutcomeValue, Vec<SourceId>> {
        let mut counts: BTreeMap<OutcomeValue, Vec<SourceId>> = BTreeMap::new();
        for report in &self.reports {
            counts.entry(report.value).or_default().push(report.source.clone());
        }
        counts
    }

    /// The value that has reached `quorum`, if any.
    ///
    /// With a strict-majority quorum at most one value can qualify; should
    /// a misconfiguration allow two, the one with more supporters wins and
    /// the lower value breaks a tie.
    pub fn quorum_value(&self, quorum: usize) -> Option<(OutcomeValue, Vec<SourceId>)> {
        self.tally()
            .into_iter()
            .filter(|(_, sources)| sources.len() >= quorum)
            .fold(None, |best: Option<(OutcomeValue, Vec<SourceId>)>, candidate| match best {
                Some(b) if b.1.len() >= candidate.1.len() => Some(b),
                _ => Some(candidate),
            })
    }

    /// Produce the consensus result if quorum is met and none exists yet.
    pub fn try_conclude(
        &mut self,
        round_id: RoundId,
        quorum: usize,
        now: DateTime<Utc>,
    ) -> Option<ConsensusResult> {
        if self.result.is_some() {
            return None;
        }
        let (value, sources) = self.quorum_value(quorum)?;
        let result = ConsensusResult {
            round_id,
            value,
            sources,
            finalized_at: now,
        };
        self.result = Some(result.clone());
        Some(result)
    }

    /// Drop every report and the agreed result (dispute reopening).
    pub fn clear(&mut self) {
        self.reports.clear();
        self.result = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
