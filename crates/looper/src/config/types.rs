use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;

use crate::constants;
use crate::types::{AssetRates, Reserve};

// ---------------------------------------------------------------------------
// Top-level aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LooperConfig {
    pub app: AppConfig,
    pub market: MarketConfig,
    pub positions: PositionConfig,
    pub timing: TimingConfig,
}

impl LooperConfig {
    /// Look up a reserve by symbol.
    pub fn reserve(&self, symbol: &str) -> Option<&Reserve> {
        self.market.reserves.get(symbol)
    }

    /// Copy of this config for executing against the in-memory rehearsal
    /// ledger. Dry run is lifted since nothing leaves the process, so every
    /// operation runs through composition, signing and settlement.
    pub fn rehearsal(&self) -> Self {
        let mut config = self.clone();
        config.positions.dry_run = false;
        config
    }
}

// ---------------------------------------------------------------------------
// app.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub log_dir: String,
    #[serde(default = "default_log_file")]
    pub file_name: String,
}

fn default_log_file() -> String {
    "looper.log".into()
}

// ---------------------------------------------------------------------------
// market.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MarketConfig {
    /// Lending market identifier on the ledger.
    pub lending_market: String,
    /// Base URL of the reserve metrics API. Empty disables live rates.
    pub api_url: String,
    pub reserves: HashMap<String, Reserve>,
    /// Conservative rates used when the metrics API is unreachable.
    pub fallback_rates: HashMap<String, AssetRates>,
    /// Native staking yield of the loop collateral, on top of its supply APY.
    #[serde(with = "rust_decimal::serde::str")]
    pub collateral_staking_apy: Decimal,
}

// ---------------------------------------------------------------------------
// positions.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PositionConfig {
    pub dry_run: bool,
    /// Global borrow LTV cap applied on top of each reserve's safe LTV.
    #[serde(with = "rust_decimal::serde::str")]
    pub global_borrow_cap: Decimal,
    pub borrow_enabled: bool,
    pub loop_enabled: bool,
    /// Yield-bearing collateral asset produced by staking (e.g. an LST).
    pub loop_collateral_asset: String,
    /// Asset borrowed and staked each iteration.
    pub loop_borrow_asset: String,
    pub leverage_loop: LoopPolicy,
    pub unwind: UnwindPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoopPolicy {
    #[serde(with = "rust_decimal::serde::str")]
    pub default_target_ltv: Decimal,
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
    /// Fraction of computed headroom actually borrowed (drift haircut).
    #[serde(with = "rust_decimal::serde::str", default = "default_haircut")]
    pub headroom_haircut: Decimal,
    /// Converged once `ltv >= target * convergence_tolerance`.
    #[serde(with = "rust_decimal::serde::str", default = "default_tolerance")]
    pub convergence_tolerance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub min_headroom_usd: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnwindPolicy {
    #[serde(default = "default_unwind_iterations")]
    pub max_iterations: u32,
    /// Fraction of remaining collateral withdrawn per iteration. Must be < 1.
    #[serde(with = "rust_decimal::serde::str", default = "default_withdraw_fraction")]
    pub withdraw_fraction: Decimal,
    /// Accepted instant-unstake slippage (fraction).
    #[serde(with = "rust_decimal::serde::str", default = "default_unstake_slippage")]
    pub unstake_slippage: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub borrow_dust: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub collateral_dust: Decimal,
}

// ---------------------------------------------------------------------------
// timing.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    pub confirmation: ConfirmationTiming,
    pub market: MarketTiming,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmationTiming {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketTiming {
    pub request_timeout_ms: u64,
    pub rate_cache_ttl_seconds: u64,
}

// ---------------------------------------------------------------------------
// Serde defaults
// ---------------------------------------------------------------------------

fn default_max_loops() -> u32 {
    constants::DEFAULT_MAX_LOOPS
}

fn default_haircut() -> Decimal {
    constants::DEFAULT_HEADROOM_HAIRCUT
}

fn default_tolerance() -> Decimal {
    constants::DEFAULT_CONVERGENCE_TOLERANCE
}

fn default_unwind_iterations() -> u32 {
    constants::DEFAULT_UNWIND_ITERATIONS
}

fn default_withdraw_fraction() -> Decimal {
    constants::DEFAULT_WITHDRAW_FRACTION
}

fn default_unstake_slippage() -> Decimal {
    constants::DEFAULT_UNSTAKE_SLIPPAGE
}

fn default_poll_interval_ms() -> u64 {
    constants::DEFAULT_POLL_INTERVAL_MS
}

fn default_max_attempts() -> u32 {
    constants::DEFAULT_MAX_CONFIRM_ATTEMPTS
}
