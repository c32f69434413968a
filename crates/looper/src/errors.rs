use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{ActionFailure, SafetyRejection};

/// Typed error hierarchy for the position engine.
///
/// Library-internal errors use specific variants; application code wraps with
/// `anyhow::Context` for propagation. Only [`LooperError::Config`] escapes the
/// public mutating operations of `PositionManager` as an `Err`; everything
/// else is folded into an `ActionResult`.
#[derive(Error, Debug)]
pub enum LooperError {
    // -- Configuration ------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),

    // -- Safety -------------------------------------------------------------
    #[error("safety rejection: {reason} (ltv {ltv}, cap {cap})")]
    SafetyRejected {
        ltv: Decimal,
        cap: Decimal,
        reason: String,
    },

    // -- Settlement ---------------------------------------------------------
    #[error("settlement {id} failed: {reason}")]
    SettlementFailed { id: String, reason: String },

    #[error("settlement {id} expired before a terminal status (height {current_height} > {expiry_height})")]
    SettlementExpired {
        id: String,
        expiry_height: u64,
        current_height: u64,
    },

    // -- Reads --------------------------------------------------------------
    #[error("transient read failure: {0}")]
    TransientRead(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("signing failed: {0}")]
    Signing(String),

    // -- Forwarded errors ---------------------------------------------------
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LooperError {
    /// Whether the outcome of the failed action is genuinely unknown and the
    /// caller must re-read the position before assuming nothing happened.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::SettlementExpired { .. })
    }

    /// Fold an expected failure into the structured [`ActionFailure`] carried
    /// by an `ActionResult`. Configuration errors are fatal and come back as
    /// `Err`.
    pub fn into_failure(self) -> Result<ActionFailure, LooperError> {
        match self {
            Self::Config(_) => Err(self),
            Self::SafetyRejected { ltv, cap, reason } => {
                Ok(ActionFailure::Rejected(SafetyRejection { ltv, cap, reason }))
            }
            Self::SettlementFailed { id, reason } => {
                Ok(ActionFailure::SettlementFailed { id, reason })
            }
            Self::SettlementExpired { id, .. } => Ok(ActionFailure::SettlementExpired { id }),
            other => Ok(ActionFailure::Unavailable {
                reason: other.to_string(),
            }),
        }
    }
}
