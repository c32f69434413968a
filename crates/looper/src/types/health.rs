use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// LTV risk classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    /// Comfortably below the effective borrow cap.
    Safe,
    /// Within 90% of the effective cap.
    Watch,
    /// Above the effective cap.
    Warning,
    /// Above the hard LTV ceiling, regardless of configured caps.
    Critical,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Watch => "watch",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Result of the safety policy over one position snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub safe: bool,
    #[serde(with = "rust_decimal::serde::str")]
    pub ltv: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub health_factor: Decimal,
    /// Effective cap: `min(reserve safe LTV, global cap)`.
    #[serde(with = "rust_decimal::serde::str")]
    pub cap: Decimal,
    pub tier: RiskTier,
    pub reason: Option<String>,
}

/// Structured refusal: the computed LTV and the cap it violated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyRejection {
    #[serde(with = "rust_decimal::serde::str")]
    pub ltv: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub cap: Decimal,
    pub reason: String,
}
