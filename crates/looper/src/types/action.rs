use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::health::SafetyRejection;
use super::settlement::SettlementId;

/// Requested amount for withdraw / repay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Amount {
    Exact(Decimal),
    /// Everything deposited (withdraw) or everything outstanding (repay).
    Max,
}

/// Public mutating operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Deposit,
    Withdraw,
    Borrow,
    Repay,
    RepayAndWithdraw,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdraw => "withdraw",
            Self::Borrow => "borrow",
            Self::Repay => "repay",
            Self::RepayAndWithdraw => "repay_and_withdraw",
        }
    }
}

/// One asset movement of an action (token units).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

/// Expected, control-flow failures of a public operation.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionFailure {
    #[error("safety rejection: {}", .0.reason)]
    Rejected(SafetyRejection),

    #[error("insufficient funds: {asset} requested {requested}, available {available}")]
    InsufficientFunds {
        asset: String,
        requested: Decimal,
        available: Decimal,
    },

    #[error("settlement {id} failed: {reason}")]
    SettlementFailed { id: String, reason: String },

    /// The outcome is unknown; re-read the position before retrying.
    #[error("settlement {id} expired without a terminal status")]
    SettlementExpired { id: String },

    #[error("invalid amount: {reason}")]
    InvalidAmount { reason: String },

    /// A read or signing step failed before anything was submitted.
    #[error("{reason}")]
    Unavailable { reason: String },
}

/// Uniform `{success, ...fields, error?}` result of a public operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub kind: ActionKind,
    pub legs: Vec<Leg>,
    pub settlement_id: Option<SettlementId>,
    pub dry_run: bool,
    pub failure: Option<ActionFailure>,
}

impl ActionResult {
    pub fn ok(kind: ActionKind, legs: Vec<Leg>, settlement_id: SettlementId) -> Self {
        Self {
            success: true,
            kind,
            legs,
            settlement_id: Some(settlement_id),
            dry_run: false,
            failure: None,
        }
    }

    /// Success with nothing to do (e.g. repay max with no outstanding borrow).
    pub fn noop(kind: ActionKind, asset: &str) -> Self {
        Self {
            success: true,
            kind,
            legs: vec![Leg {
                asset: asset.to_string(),
                amount: Decimal::ZERO,
            }],
            settlement_id: None,
            dry_run: false,
            failure: None,
        }
    }

    pub fn dry_run(kind: ActionKind, legs: Vec<Leg>) -> Self {
        Self {
            success: true,
            kind,
            legs,
            settlement_id: Some(SettlementId::dry_run()),
            dry_run: true,
            failure: None,
        }
    }

    pub fn failed(kind: ActionKind, legs: Vec<Leg>, failure: ActionFailure) -> Self {
        Self {
            success: false,
            kind,
            legs,
            settlement_id: None,
            dry_run: false,
            failure: Some(failure),
        }
    }

    /// Amount of the first leg (the repaid / withdrawn / borrowed amount).
    pub fn amount(&self) -> Decimal {
        self.legs.first().map_or(Decimal::ZERO, |l| l.amount)
    }

    pub fn error(&self) -> Option<String> {
        self.failure.as_ref().map(ToString::to_string)
    }
}

pub fn leg(asset: &str, amount: Decimal) -> Leg {
    Leg {
        asset: asset.to_string(),
        amount,
    }
}
