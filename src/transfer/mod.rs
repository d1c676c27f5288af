//! Value transfer hand-off.
//!
//! Moving currency to a participant is delegated to an external ledger.
//! The engine records the claim first and only then asks a
//! `TransferGateway` to move the value; recovering a failed transfer is
//! the gateway operator's job, never a reason to re-open the claim.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::types::{Amount, ParticipantId, RoundId};

/// Instruction to pay a participant for one settled claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInstruction {
    pub round_id: RoundId,
    pub participant: ParticipantId,
    /// Payout plus refund.
    pub amount: Amount,
}

impl fmt::Display for TransferInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "round #{} → {} ({} units)",
            self.round_id, self.participant, self.amount
        )
    }
}

/// Receipt returned by the gateway after a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transfer_id: String,
    pub round_id: RoundId,
    pub participant: ParticipantId,
    pub amount: Amount,
    pub timestamp: DateTime<Utc>,
}

impl TransferReceipt {
    /// Create a dry-run receipt (no real value moved).
    pub fn dry_run(instruction: &TransferInstruction) -> Self {
        Self {
            transfer_id: format!("dry-run-{}", uuid::Uuid::new_v4()),
            round_id: instruction.round_id,
            participant: instruction.participant.clone(),
            amount: instruction.amount,
            timestamp: Utc::now(),
        }
    }
}

/// External value-transfer primitive.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransferGateway: Send + Sync {
    /// Move `instruction.amount` to the participant.
    async fn transfer(&self, instruction: &TransferInstruction) -> Result<TransferReceipt>;

    /// Gateway name for logging.
    fn name(&self) -> &str;
}

/// Gateway that logs instead of moving value.
#[derive(Debug, Clone, Default)]
pub struct DryRunGateway;

#[async_trait]
impl TransferGateway for DryRunGateway {
    async fn transfer(&self, instruction: &TransferInstruction) -> Result<TransferReceipt> {
        if instruction.participant.trim().is_empty() {
            bail!("Transfer has no recipient");
        }
        let receipt = TransferReceipt::dry_run(instruction);
        info!(
            transfer_id = %receipt.transfer_id,
            round_id = instruction.round_id,
            participant = %instruction.participant,
            amount = instruction.amount,
            "[DRY RUN] Would transfer"
        );
        Ok(receipt)
    }

    fn name(&self) -> &str {
        "dry-run"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
