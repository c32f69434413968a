use anyhow::{bail, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::types::LooperConfig;
use crate::constants::HARD_LTV_CEILING;

/// Validate invariants across the merged config that serde alone cannot enforce.
///
/// Called automatically by [`super::load_config`]. All problems are collected
/// and reported together.
pub fn validate_config(config: &LooperConfig) -> Result<()> {
    let mut errors: Vec<String> = Vec::new();

    validate_market_config(config, &mut errors);
    validate_positions_config(config, &mut errors);
    validate_loop_policy(config, &mut errors);
    validate_unwind_policy(config, &mut errors);
    validate_timing_config(config, &mut errors);
    validate_live_mode_requirements(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        let msg = format!(
            "Configuration validation failed ({} error{}):\n  - {}",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" },
            errors.join("\n  - ")
        );
        bail!("{msg}");
    }
}

// ---------------------------------------------------------------------------
// Market config
// ---------------------------------------------------------------------------

fn validate_market_config(config: &LooperConfig, errors: &mut Vec<String>) {
    let market = &config.market;

    if market.lending_market.is_empty() {
        errors.push("market: lending_market is empty".into());
    }

    if market.reserves.is_empty() {
        errors.push("market.reserves: must have at least one reserve".into());
    }

    for (name, reserve) in &market.reserves {
        if reserve.symbol != *name {
            errors.push(format!(
                "market.reserves.{name}: symbol '{}' does not match its key",
                reserve.symbol
            ));
        }
        if reserve.address.is_empty() {
            errors.push(format!("market.reserves.{name}: address is empty"));
        }
        if reserve.decimals > 18 {
            errors.push(format!(
                "market.reserves.{name}: decimals ({}) exceeds 18",
                reserve.decimals
            ));
        }
        // The conservative ceiling must sit below the liquidation point.
        if reserve.safe_borrow_ltv <= Decimal::ZERO
            || reserve.safe_borrow_ltv >= reserve.liquidation_threshold
        {
            errors.push(format!(
                "market.reserves.{name}: safe_borrow_ltv ({}) must be in (0, liquidation_threshold ({}))",
                reserve.safe_borrow_ltv, reserve.liquidation_threshold
            ));
        }
        if reserve.liquidation_threshold > dec!(1) {
            errors.push(format!(
                "market.reserves.{name}: liquidation_threshold ({}) exceeds 1",
                reserve.liquidation_threshold
            ));
        }
    }

    for (name, rates) in &market.fallback_rates {
        if rates.supply_apy < Decimal::ZERO || rates.borrow_apy < Decimal::ZERO {
            errors.push(format!("market.fallback_rates.{name}: rates must be >= 0"));
        }
    }
}

// ---------------------------------------------------------------------------
// Positions config
// ---------------------------------------------------------------------------

fn validate_positions_config(config: &LooperConfig, errors: &mut Vec<String>) {
    let pos = &config.positions;

    if pos.global_borrow_cap <= Decimal::ZERO || pos.global_borrow_cap > HARD_LTV_CEILING {
        errors.push(format!(
            "positions: global_borrow_cap ({}) must be in (0, {HARD_LTV_CEILING}]",
            pos.global_borrow_cap
        ));
    }

    for (field, asset) in [
        ("loop_collateral_asset", &pos.loop_collateral_asset),
        ("loop_borrow_asset", &pos.loop_borrow_asset),
    ] {
        if config.reserve(asset).is_none() {
            errors.push(format!(
                "positions: {field} '{asset}' has no entry in market.reserves"
            ));
        }
    }

    if pos.loop_collateral_asset == pos.loop_borrow_asset {
        errors.push("positions: loop_collateral_asset and loop_borrow_asset must differ".into());
    }
}

fn validate_loop_policy(config: &LooperConfig, errors: &mut Vec<String>) {
    let lp = &config.positions.leverage_loop;

    if lp.default_target_ltv <= Decimal::ZERO || lp.default_target_ltv > HARD_LTV_CEILING {
        errors.push(format!(
            "positions.leverage_loop: default_target_ltv ({}) must be in (0, {HARD_LTV_CEILING}]",
            lp.default_target_ltv
        ));
    }
    if lp.max_loops == 0 {
        errors.push("positions.leverage_loop: max_loops must be > 0".into());
    }
    if lp.headroom_haircut <= Decimal::ZERO || lp.headroom_haircut > dec!(1) {
        errors.push(format!(
            "positions.leverage_loop: headroom_haircut ({}) must be in (0, 1]",
            lp.headroom_haircut
        ));
    }
    if lp.convergence_tolerance <= Decimal::ZERO || lp.convergence_tolerance > dec!(1) {
        errors.push(format!(
            "positions.leverage_loop: convergence_tolerance ({}) must be in (0, 1]",
            lp.convergence_tolerance
        ));
    }
    if lp.min_headroom_usd < Decimal::ZERO {
        errors.push(format!(
            "positions.leverage_loop: min_headroom_usd ({}) must be >= 0",
            lp.min_headroom_usd
        ));
    }
}

fn validate_unwind_policy(config: &LooperConfig, errors: &mut Vec<String>) {
    let up = &config.positions.unwind;

    if up.max_iterations == 0 {
        errors.push("positions.unwind: max_iterations must be > 0".into());
    }
    // A full withdrawal would spike LTV on the outstanding borrow.
    if up.withdraw_fraction <= Decimal::ZERO || up.withdraw_fraction >= dec!(1) {
        errors.push(format!(
            "positions.unwind: withdraw_fraction ({}) must be in (0, 1)",
            up.withdraw_fraction
        ));
    }
    if up.unstake_slippage < Decimal::ZERO || up.unstake_slippage >= dec!(0.05) {
        errors.push(format!(
            "positions.unwind: unstake_slippage ({}) must be in [0, 0.05)",
            up.unstake_slippage
        ));
    }
    if up.borrow_dust < Decimal::ZERO || up.collateral_dust < Decimal::ZERO {
        errors.push("positions.unwind: dust floors must be >= 0".into());
    }
}

// ---------------------------------------------------------------------------
// Timing config
// ---------------------------------------------------------------------------

fn validate_timing_config(config: &LooperConfig, errors: &mut Vec<String>) {
    let t = &config.timing;

    if t.confirmation.poll_interval_ms == 0 {
        errors.push("timing.confirmation: poll_interval_ms must be > 0".into());
    }
    if t.confirmation.max_attempts == 0 {
        errors.push("timing.confirmation: max_attempts must be > 0".into());
    }
    if t.market.request_timeout_ms == 0 {
        errors.push("timing.market: request_timeout_ms must be > 0".into());
    }
}

// ---------------------------------------------------------------------------
// Live mode requirements
// ---------------------------------------------------------------------------

fn validate_live_mode_requirements(config: &LooperConfig, errors: &mut Vec<String>) {
    if config.positions.dry_run {
        return;
    }

    if std::env::var("WALLET_PRIVATE_KEY")
        .ok()
        .filter(|v| !v.is_empty())
        .is_none()
    {
        errors.push("live mode: WALLET_PRIVATE_KEY env var is required when dry_run=false".into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{MARKET_JSON, POSITIONS_JSON};
    use crate::config::{AppConfig, LoggingConfig, TimingConfig};

    fn base_config() -> LooperConfig {
        LooperConfig {
            app: AppConfig {
                logging: LoggingConfig {
                    log_dir: "logs".into(),
                    file_name: "looper.log".into(),
                },
            },
            market: serde_json::from_str(MARKET_JSON).unwrap(),
            positions: serde_json::from_str(POSITIONS_JSON).unwrap(),
            timing: serde_json::from_str::<TimingConfig>(
                r#"{
                    "confirmation": { "poll_interval_ms": 1500, "max_attempts": 30 },
                    "market": { "request_timeout_ms": 5000, "rate_cache_ttl_seconds": 300 }
                }"#,
            )
            .unwrap(),
        }
    }

    #[test]
    fn test_base_config_is_valid() {
        assert!(validate_config(&base_config()).is_ok());
    }

    #[test]
    fn test_rejects_full_withdraw_fraction() {
        let mut config = base_config();
        config.positions.unwind.withdraw_fraction = dec!(1);
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("withdraw_fraction"), "got: {err}");
    }

    #[test]
    fn test_rejects_global_cap_above_hard_ceiling() {
        let mut config = base_config();
        config.positions.global_borrow_cap = dec!(0.75);
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("global_borrow_cap"), "got: {err}");
    }

    #[test]
    fn test_rejects_unknown_loop_asset() {
        let mut config = base_config();
        config.positions.loop_borrow_asset = "DOGE".into();
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("loop_borrow_asset 'DOGE'"), "got: {err}");
    }

    #[test]
    fn test_collects_multiple_errors() {
        let mut config = base_config();
        config.timing.confirmation.max_attempts = 0;
        config.positions.leverage_loop.headroom_haircut = Decimal::ZERO;
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("2 errors"), "got: {err}");
    }

    #[test]
    fn test_rejects_safe_ltv_above_liquidation() {
        let mut config = base_config();
        if let Some(r) = config.market.reserves.get_mut("USDC") {
            r.safe_borrow_ltv = dec!(0.90);
        }
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("market.reserves.USDC"), "got: {err}");
    }
}
