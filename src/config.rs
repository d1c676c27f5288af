//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every section has defaults so a partial file is enough; the loaded
//! configuration is validated before the engine sees it.

use anyhow::{bail, Context, Result};
use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fs;

use crate::types::{Amount, OutcomeValue, SourceId};

/// Upper bound for any configured span, in seconds (one year).
pub const MAX_SPAN_SECS: i64 = 366 * 24 * 60 * 60;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Stake bounds, timing gates, fee and outcome rules.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub min_stake: Amount,
    pub max_stake: Amount,
    /// Seconds between lock time and resolution time.
    pub lock_offset_secs: i64,
    /// Fraction of gross winnings retained as fee.
    pub fee_rate: Decimal,
    /// Seconds after finalization (or after a dispute reopening) during
    /// which the outcome may still change.
    pub dispute_window_secs: i64,
    /// Draw values at or above this are HIGH.
    pub high_threshold: OutcomeValue,
    /// Largest valid draw value.
    pub max_outcome: OutcomeValue,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_stake: 1,
            max_stake: 1_000_000,
            lock_offset_secs: 15 * 60,
            fee_rate: dec!(0.02),
            dispute_window_secs: 60 * 60,
            high_threshold: 50,
            max_outcome: 99,
        }
    }
}

impl EngineConfig {
    pub fn lock_offset(&self) -> Duration {
        Duration::seconds(self.lock_offset_secs)
    }

    pub fn dispute_window(&self) -> Duration {
        Duration::seconds(self.dispute_window_secs)
    }
}

/// Outcome sources and the voting rule applied to them.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Registered result sources; reports from anyone else are rejected.
    pub sources: Vec<SourceId>,
    /// Number of agreeing reports required to finalize.
    pub quorum: usize,
    /// Identities allowed to invalidate a finalized outcome.
    pub dispute_authorities: Vec<String>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            sources: vec!["source-a".into(), "source-b".into(), "source-c".into()],
            quorum: 2,
            dispute_authorities: vec!["operator".into()],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_secs: u64,
    /// Spacing between consecutive draws when rounds are auto-created.
    pub draw_interval_secs: i64,
    pub auto_create_rounds: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            draw_interval_secs: 60 * 60,
            auto_create_rounds: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub state_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: "peerwager_state.json".into(),
        }
    }
}

impl AppConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Invalid config file: {path}"))?;
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        let e = &self.engine;
        if e.min_stake == 0 {
            bail!("engine.min_stake must be at least 1");
        }
        if e.min_stake > e.max_stake {
            bail!("engine.min_stake ({}) exceeds engine.max_stake ({})", e.min_stake, e.max_stake);
        }
        check_span("engine.lock_offset_secs", e.lock_offset_secs)?;
        if e.fee_rate < Decimal::ZERO || e.fee_rate >= Decimal::ONE {
            bail!("engine.fee_rate must be in [0, 1), got {}", e.fee_rate);
        }
        check_span("engine.dispute_window_secs", e.dispute_window_secs)?;
        if e.high_threshold == 0 || e.high_threshold > e.max_outcome {
            bail!("engine.high_threshold must be in 1..={}", e.max_outcome);
        }

        let c = &self.consensus;
        if c.quorum == 0 {
            bail!("consensus.quorum must be at least 1");
        }
        if c.quorum > c.sources.len() {
            bail!(
                "consensus.quorum ({}) exceeds the number of sources ({})",
                c.quorum,
                c.sources.len()
            );
        }
        // Two different values must never both be able to reach quorum.
        if c.quorum * 2 <= c.sources.len() {
            bail!(
                "consensus.quorum ({}) must be a strict majority of {} sources",
                c.quorum,
                c.sources.len()
            );
        }
        let mut unique = c.sources.clone();
        unique.sort();
        unique.dedup();
        if unique.len() != c.sources.len() {
            bail!("consensus.sources contains duplicates");
        }

        if self.scheduler.tick_secs == 0 {
            bail!("scheduler.tick_secs must be positive");
        }
        check_span("scheduler.draw_interval_secs", self.scheduler.draw_interval_secs)?;
        if self.scheduler.draw_interval_secs <= e.lock_offset_secs {
            bail!("scheduler.draw_interval_secs must exceed engine.lock_offset_secs");
        }
        Ok(())
    }

    /// Valid but risky settings worth flagging at startup.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.consensus.quorum == self.consensus.sources.len() {
            warnings.push(
                "Quorum requires every source; one silent source will cancel every round".to_string(),
            );
        }
        warnings
    }
}

fn check_span(name: &str, secs: i64) -> Result<()> {
    if secs <= 0 || secs > MAX_SPAN_SECS {
        bail!("{name} must be in 1..={MAX_SPAN_SECS}, got {secs}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
