//! Safety policy: deterministic LTV checks over a position snapshot.
//!
//! Nothing here reads the ledger or mutates state. Callers must hand in a
//! snapshot fetched immediately before the decision it guards; a snapshot
//! can be stale by the time a settlement lands, so this reduces risk but is
//! not a race-free guarantee.
//!
//! All refusals are `Err(LooperError::SafetyRejected)` carrying the computed
//! LTV and the cap it violated.

use std::collections::HashMap;

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::PositionConfig;
use crate::constants::{HARD_LTV_CEILING, WATCH_RATIO};
use crate::errors::LooperError;
use crate::types::{Position, Reserve, RiskTier, SafetyVerdict};

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// `min(reserve safe LTV, global cap)`.
pub fn effective_cap(reserve: &Reserve, global_cap: Decimal) -> Decimal {
    reserve.safe_borrow_ltv.min(global_cap)
}

/// Classify `ltv` against the hard ceiling and `cap`.
///
/// - `> 0.70` → Critical
/// - `> cap` → Warning
/// - `>= cap × 0.9` → Watch
/// - otherwise → Safe
pub fn determine_tier(ltv: Decimal, cap: Decimal) -> RiskTier {
    if ltv > HARD_LTV_CEILING {
        RiskTier::Critical
    } else if ltv > cap {
        RiskTier::Warning
    } else if ltv >= cap * WATCH_RATIO {
        RiskTier::Watch
    } else {
        RiskTier::Safe
    }
}

/// Safety verdict for `position` when borrowing against `reserve`.
pub fn check_safety(position: &Position, reserve: &Reserve, global_cap: Decimal) -> SafetyVerdict {
    let cap = effective_cap(reserve, global_cap);
    let ltv = position.ltv;
    let tier = determine_tier(ltv, cap);

    let reason = match tier {
        RiskTier::Critical => Some(format!(
            "ltv {ltv} exceeds hard ceiling {HARD_LTV_CEILING}"
        )),
        RiskTier::Warning => Some(format!(
            "ltv {ltv} exceeds effective cap {cap} for {}",
            reserve.symbol
        )),
        RiskTier::Watch | RiskTier::Safe => None,
    };

    SafetyVerdict {
        safe: reason.is_none(),
        ltv,
        health_factor: position.health_factor,
        cap,
        tier,
        reason,
    }
}

/// LTV after adding `deposit_delta` and `borrow_delta` (USD, may be negative).
///
/// Returns `None` when no collateral would remain against outstanding debt.
pub fn project_ltv(position: &Position, deposit_delta: Decimal, borrow_delta: Decimal) -> Option<Decimal> {
    let deposit = position.deposit_value + deposit_delta;
    let borrow = (position.borrow_value + borrow_delta).max(Decimal::ZERO);
    if borrow.is_zero() {
        return Some(Decimal::ZERO);
    }
    if deposit <= Decimal::ZERO {
        return None;
    }
    Some(borrow / deposit)
}

// ---------------------------------------------------------------------------
// SafetyPolicy
// ---------------------------------------------------------------------------

/// Config-bound wrapper around the pure checks.
pub struct SafetyPolicy {
    reserves: HashMap<String, Reserve>,
    global_cap: Decimal,
    borrow_enabled: bool,
}

impl SafetyPolicy {
    pub fn new(reserves: HashMap<String, Reserve>, positions: &PositionConfig) -> Self {
        info!(
            global_cap = %positions.global_borrow_cap,
            hard_ceiling = %HARD_LTV_CEILING,
            borrow_enabled = positions.borrow_enabled,
            "SafetyPolicy initialized"
        );
        Self {
            reserves,
            global_cap: positions.global_borrow_cap,
            borrow_enabled: positions.borrow_enabled,
        }
    }

    fn reserve(&self, asset: &str) -> Result<&Reserve, LooperError> {
        self.reserves
            .get(asset)
            .ok_or_else(|| LooperError::Config(format!("unknown reserve '{asset}'")))
    }

    /// Effective borrow cap for `asset`.
    pub fn cap_for(&self, asset: &str) -> Result<Decimal, LooperError> {
        Ok(effective_cap(self.reserve(asset)?, self.global_cap))
    }

    pub fn check_safety(&self, position: &Position, asset: &str) -> Result<SafetyVerdict, LooperError> {
        Ok(check_safety(position, self.reserve(asset)?, self.global_cap))
    }

    /// Refuse a borrow of `additional_value` USD of `asset` whose projected
    /// LTV would exceed the effective cap or the hard ceiling.
    pub fn check_borrow(
        &self,
        position: &Position,
        asset: &str,
        additional_value: Decimal,
    ) -> Result<(), LooperError> {
        let cap = self.cap_for(asset)?;
        if !self.borrow_enabled {
            return Err(LooperError::SafetyRejected {
                ltv: position.ltv,
                cap,
                reason: "borrowing is disabled".into(),
            });
        }
        self.check_projection(position, Decimal::ZERO, additional_value, cap)
    }

    /// Refuse a withdrawal of `removed_value` USD of collateral (optionally
    /// alongside a repay of `repaid_value` USD) that would push LTV past the
    /// tightest cap among the outstanding borrows.
    pub fn check_withdraw(
        &self,
        position: &Position,
        removed_value: Decimal,
        repaid_value: Decimal,
    ) -> Result<(), LooperError> {
        let mut cap = HARD_LTV_CEILING;
        for entry in &position.borrows {
            cap = cap.min(self.cap_for(&entry.asset)?);
        }
        self.check_projection(position, -removed_value, -repaid_value, cap)
    }

    fn check_projection(
        &self,
        position: &Position,
        deposit_delta: Decimal,
        borrow_delta: Decimal,
        cap: Decimal,
    ) -> Result<(), LooperError> {
        let limit = cap.min(HARD_LTV_CEILING);
        let reject = |ltv: Decimal, reason: String| {
            warn!(%ltv, %cap, %reason, "safety rejection");
            Err(LooperError::SafetyRejected { ltv, cap, reason })
        };

        match project_ltv(position, deposit_delta, borrow_delta) {
            None => reject(
                Decimal::MAX,
                "no collateral would remain against outstanding borrow".into(),
            ),
            Some(ltv) if ltv > limit => reject(
                ltv,
                format!("projected ltv {} exceeds cap {limit}", ltv.round_dp(4)),
            ),
            Some(_) => Ok(()),
        }
    }
}
