pub mod types;
pub mod validate;

pub use types::*;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Load and merge all config JSON files into a single [`LooperConfig`],
/// then apply environment variable overrides and validate.
///
/// Expected directory layout:
/// ```text
/// config/
///   app.json
///   market.json
///   positions.json
///   timing.json
/// ```
///
/// # Environment variable overrides
///
/// | Env Var               | Config Field                         |
/// |-----------------------|--------------------------------------|
/// | `LOOPER_DRY_RUN`      | `positions.dry_run`                  |
/// | `GLOBAL_BORROW_CAP`   | `positions.global_borrow_cap`        |
/// | `MAX_LOOPS`           | `positions.leverage_loop.max_loops`  |
/// | `MARKET_API_URL`      | `market.api_url`                     |
pub fn load_config(config_dir: &Path) -> Result<LooperConfig> {
    let read = |name: &str| -> Result<String> {
        let path = config_dir.join(name);
        std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))
    };

    let app: AppConfig = serde_json::from_str(&read("app.json")?).context("parsing app.json")?;

    let market: MarketConfig =
        serde_json::from_str(&read("market.json")?).context("parsing market.json")?;

    let positions: PositionConfig =
        serde_json::from_str(&read("positions.json")?).context("parsing positions.json")?;

    let timing: TimingConfig =
        serde_json::from_str(&read("timing.json")?).context("parsing timing.json")?;

    let mut config = LooperConfig {
        app,
        market,
        positions,
        timing,
    };

    apply_env_overrides(&mut config);
    validate::validate_config(&config)?;

    Ok(config)
}

// ---------------------------------------------------------------------------
// Environment variable overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides to the loaded config.
///
/// Only non-empty env vars take effect. Parse failures are skipped (the JSON
/// value remains).
fn apply_env_overrides(config: &mut LooperConfig) {
    if let Some(val) = env_bool("LOOPER_DRY_RUN") {
        info!(dry_run = val, "env override: LOOPER_DRY_RUN");
        config.positions.dry_run = val;
    }

    if let Some(val) = env_decimal("GLOBAL_BORROW_CAP") {
        info!(%val, "env override: GLOBAL_BORROW_CAP");
        config.positions.global_borrow_cap = val;
    }

    if let Some(val) = env_parse::<u32>("MAX_LOOPS") {
        info!(val, "env override: MAX_LOOPS");
        config.positions.leverage_loop.max_loops = val;
    }

    if let Some(val) = env_string("MARKET_API_URL") {
        info!("env override: MARKET_API_URL");
        config.market.api_url = val;
    }
}

/// Read a non-empty env var as a `String`.
fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Read a non-empty env var as a bool (`true`, `1`, `yes` → true).
fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_decimal(key: &str) -> Option<Decimal> {
    env_string(key).and_then(|v| Decimal::from_str(&v).ok())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serial_test::serial;
    use std::path::PathBuf;

    fn project_config_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("config")
    }

    pub(crate) const MARKET_JSON: &str = r#"{
        "lending_market": "7u3HeHxYDLhnCoErrtycNokbQYbWGzLs6JSDqGAv5PfF",
        "api_url": "",
        "reserves": {
            "SOL": { "symbol": "SOL", "address": "d4A2prbA2whesmvHaL88BH6Ewn5N4bTSU2Ze8P6Bc4Q", "decimals": 9, "safe_borrow_ltv": "0.65", "liquidation_threshold": "0.80", "is_native": true },
            "JITOSOL": { "symbol": "JITOSOL", "address": "EVbyPKrHG6WBfm4dLxLMJpUDY43cCAcHSpV3KYjKsktW", "decimals": 9, "safe_borrow_ltv": "0.60", "liquidation_threshold": "0.75" },
            "USDC": { "symbol": "USDC", "address": "D6q6wuQSrifJKZYpR1M8R4YawnLDtDsMmWM1NbBmgJ59", "decimals": 6, "safe_borrow_ltv": "0.70", "liquidation_threshold": "0.85" }
        },
        "fallback_rates": {
            "SOL": { "supply_apy": "0.03", "borrow_apy": "0.08" },
            "JITOSOL": { "supply_apy": "0.001", "borrow_apy": "0.02" },
            "USDC": { "supply_apy": "0.04", "borrow_apy": "0.09" }
        },
        "collateral_staking_apy": "0.075"
    }"#;

    pub(crate) const POSITIONS_JSON: &str = r#"{
        "dry_run": true,
        "global_borrow_cap": "0.60",
        "borrow_enabled": true,
        "loop_enabled": true,
        "loop_collateral_asset": "JITOSOL",
        "loop_borrow_asset": "SOL",
        "leverage_loop": {
            "default_target_ltv": "0.55",
            "max_loops": 3,
            "headroom_haircut": "0.90",
            "convergence_tolerance": "0.95",
            "min_headroom_usd": "1"
        },
        "unwind": {
            "max_iterations": 6,
            "withdraw_fraction": "0.40",
            "unstake_slippage": "0.001",
            "borrow_dust": "0.0001",
            "collateral_dust": "0.0001"
        }
    }"#;

    /// Write a minimal set of config JSON files to `dir`.
    pub(crate) fn write_test_configs(dir: &Path) {
        std::fs::write(
            dir.join("app.json"),
            r#"{ "logging": { "log_dir": "logs" } }"#,
        )
        .unwrap();
        std::fs::write(dir.join("market.json"), MARKET_JSON).unwrap();
        std::fs::write(dir.join("positions.json"), POSITIONS_JSON).unwrap();
        std::fs::write(
            dir.join("timing.json"),
            r#"{
                "confirmation": { "poll_interval_ms": 1500, "max_attempts": 30 },
                "market": { "request_timeout_ms": 5000, "rate_cache_ttl_seconds": 300 }
            }"#,
        )
        .unwrap();
    }

    /// Remove all looper-related env vars so tests don't interfere.
    fn clean_env() {
        for key in [
            "LOOPER_DRY_RUN",
            "GLOBAL_BORROW_CAP",
            "MAX_LOOPS",
            "MARKET_API_URL",
            "WALLET_PRIVATE_KEY",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_load_real_configs() {
        clean_env();
        let dir = project_config_dir();
        if !dir.exists() {
            eprintln!("skipping, config dir not found at {}", dir.display());
            return;
        }
        std::env::set_var("LOOPER_DRY_RUN", "true");
        let config = load_config(&dir).expect("config should load and validate");
        assert!(config.positions.dry_run);
        assert!(config.reserve(&config.positions.loop_borrow_asset).is_some());
        assert_eq!(
            config.positions.leverage_loop.max_loops,
            crate::constants::DEFAULT_MAX_LOOPS
        );
        assert_eq!(
            config.positions.unwind.max_iterations,
            crate::constants::DEFAULT_UNWIND_ITERATIONS
        );
        assert_eq!(
            config.positions.unwind.unstake_slippage,
            crate::constants::DEFAULT_UNSTAKE_SLIPPAGE
        );
        clean_env();
    }

    #[test]
    #[serial]
    fn test_load_test_configs() {
        clean_env();
        let tmp = tempfile::tempdir().unwrap();
        write_test_configs(tmp.path());
        let config = load_config(tmp.path()).expect("test config should load");
        assert!(config.positions.dry_run);
        assert_eq!(config.positions.global_borrow_cap, dec!(0.60));
        assert_eq!(config.reserve("SOL").map(|r| r.decimals), Some(9));
        assert_eq!(config.timing.confirmation.max_attempts, 30);
        clean_env();
    }

    #[test]
    #[serial]
    fn test_rehearsal_lifts_dry_run_only() {
        clean_env();
        let tmp = tempfile::tempdir().unwrap();
        write_test_configs(tmp.path());
        let config = load_config(tmp.path()).expect("test config should load");

        let rehearsal = config.rehearsal();

        assert!(config.positions.dry_run);
        assert!(!rehearsal.positions.dry_run);
        assert_eq!(
            rehearsal.positions.global_borrow_cap,
            config.positions.global_borrow_cap
        );
        assert_eq!(
            rehearsal.positions.leverage_loop.max_loops,
            config.positions.leverage_loop.max_loops
        );
        assert_eq!(rehearsal.market.reserves.len(), config.market.reserves.len());
        clean_env();
    }

    #[test]
    #[serial]
    fn test_missing_config_file_errors() {
        clean_env();
        let tmp = tempfile::tempdir().unwrap();
        let err = load_config(tmp.path()).unwrap_err();
        assert!(
            err.to_string().contains("failed to read config file"),
            "expected file-not-found error, got: {err}"
        );
    }

    #[test]
    #[serial]
    fn test_env_override_global_cap() {
        clean_env();
        let tmp = tempfile::tempdir().unwrap();
        write_test_configs(tmp.path());
        std::env::set_var("GLOBAL_BORROW_CAP", "0.5");
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.positions.global_borrow_cap, dec!(0.5));
        clean_env();
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_parse_ignored() {
        clean_env();
        let tmp = tempfile::tempdir().unwrap();
        write_test_configs(tmp.path());
        std::env::set_var("MAX_LOOPS", "lots");
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.positions.leverage_loop.max_loops, 3);
        clean_env();
    }

    #[test]
    #[serial]
    fn test_live_mode_rejects_missing_private_key() {
        clean_env();
        let tmp = tempfile::tempdir().unwrap();
        write_test_configs(tmp.path());
        std::env::set_var("LOOPER_DRY_RUN", "false");
        let err = load_config(tmp.path()).unwrap_err();
        assert!(
            err.to_string().contains("WALLET_PRIVATE_KEY"),
            "expected missing-key error, got: {err}"
        );
        clean_env();
    }
}
