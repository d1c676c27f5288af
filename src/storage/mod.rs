//! Persistence layer.
//!
//! Saves and loads an engine snapshot to/from a JSON file. A snapshot is
//! every round book plus the next round id, enough to restart the engine
//! with all stakes, reports and claims intact.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::engine::ledger::RoundBook;
use crate::types::RoundId;

/// Default snapshot file path.
const DEFAULT_STATE_FILE: &str = "peerwager_state.json";

/// Everything needed to rebuild an `Engine`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub next_round_id: RoundId,
    pub saved_at: DateTime<Utc>,
    pub rounds: Vec<RoundBook>,
}

/// Save an engine snapshot to a JSON file.
pub fn save_snapshot(snapshot: &EngineSnapshot, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    let json = serde_json::to_string_pretty(snapshot)
        .context("Failed to serialise engine snapshot")?;

    std::fs::write(path, &json)
        .with_context(|| format!("Failed to write snapshot to {path}"))?;

    debug!(path, rounds = snapshot.rounds.len(), "Snapshot saved");
    Ok(())
}

/// Load an engine snapshot from a JSON file.
/// Returns None if the file doesn't exist (fresh start).
pub fn load_snapshot(path: Option<&str>) -> Result<Option<EngineSnapshot>> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);

    if !Path::new(path).exists() {
        info!(path, "No saved snapshot found, starting fresh");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshot from {path}"))?;

    let snapshot: EngineSnapshot = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse snapshot from {path}"))?;

    info!(
        path,
        rounds = snapshot.rounds.len(),
        next_round_id = snapshot.next_round_id,
        saved_at = %snapshot.saved_at,
        "Snapshot loaded from disk"
    );

    Ok(Some(snapshot))
}

/// Delete the snapshot file (for testing or reset).
pub fn delete_snapshot(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to delete snapshot file {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
