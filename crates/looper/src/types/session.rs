use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::Position;
use super::settlement::SettlementId;

/// Leverage loop state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Idle,
    Iterating,
    /// LTV reached the tolerance band below the target.
    Converged,
    /// Remaining headroom fell below the minimum floor. Normal terminal state.
    HaltedHeadroom,
    HaltedError,
    /// Loop budget spent before convergence.
    MaxLoopsReached,
    /// Cancellation observed at the top of an iteration.
    Cancelled,
}

impl LoopStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::HaltedError)
    }
}

/// Outcome of a best-effort compensating action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompensationOutcome {
    Repaid {
        asset: String,
        #[serde(with = "rust_decimal::serde::str")]
        amount: Decimal,
        settlement_id: SettlementId,
    },
    /// Compensation itself failed; funds sit uncommitted in the wallet.
    Failed {
        asset: String,
        #[serde(with = "rust_decimal::serde::str")]
        amount: Decimal,
        reason: String,
    },
}

/// Ephemeral run state for one loop invocation. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSession {
    pub status: LoopStatus,
    pub loops_completed: u32,
    #[serde(with = "rust_decimal::serde::str")]
    pub target_ltv: Decimal,
    /// Borrow-asset units borrowed across all iterations.
    #[serde(with = "rust_decimal::serde::str")]
    pub total_borrowed: Decimal,
    /// Collateral units redeposited across all iterations.
    #[serde(with = "rust_decimal::serde::str")]
    pub total_redeposited: Decimal,
    pub settlement_ids: Vec<SettlementId>,
    pub compensation: Option<CompensationOutcome>,
    pub error: Option<String>,
}

impl LoopSession {
    pub fn new(target_ltv: Decimal) -> Self {
        Self {
            status: LoopStatus::Idle,
            loops_completed: 0,
            target_ltv,
            total_borrowed: Decimal::ZERO,
            total_redeposited: Decimal::ZERO,
            settlement_ids: Vec::new(),
            compensation: None,
            error: None,
        }
    }

    pub(crate) fn halt(&mut self, status: LoopStatus) {
        self.status = status;
    }

    pub(crate) fn halt_with_error(&mut self, error: impl Into<String>) {
        self.status = LoopStatus::HaltedError;
        self.error = Some(error.into());
    }
}

/// Final report of a loop run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopReport {
    pub success: bool,
    pub dry_run: bool,
    pub session: LoopSession,
    pub final_position: Position,
    #[serde(with = "rust_decimal::serde::str")]
    pub leverage: Decimal,
    /// `leverage × collateral_yield − (leverage − 1) × borrow_cost`.
    #[serde(with = "rust_decimal::serde::str")]
    pub estimated_apy: Decimal,
}

/// Unwind state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnwindStatus {
    Idle,
    Iterating,
    /// Borrow below the dust floor.
    Done,
    /// Loop collateral below dust while borrow remains.
    CollateralExhausted,
    MaxIterationsReached,
    Failed,
    Cancelled,
}

/// Ephemeral run state for one unwind invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnwindSession {
    pub status: UnwindStatus,
    pub iterations: u32,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_withdrawn: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_converted: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_repaid: Decimal,
    pub settlement_ids: Vec<SettlementId>,
    pub error: Option<String>,
}

impl UnwindSession {
    pub fn new() -> Self {
        Self {
            status: UnwindStatus::Idle,
            iterations: 0,
            total_withdrawn: Decimal::ZERO,
            total_converted: Decimal::ZERO,
            total_repaid: Decimal::ZERO,
            settlement_ids: Vec::new(),
            error: None,
        }
    }

    pub(crate) fn fail(&mut self, error: impl Into<String>) {
        self.status = UnwindStatus::Failed;
        self.error = Some(error.into());
    }
}

impl Default for UnwindSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Final report of an unwind run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnwindReport {
    pub success: bool,
    pub dry_run: bool,
    pub session: UnwindSession,
    pub final_position: Position,
}
