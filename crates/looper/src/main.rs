use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use leverage_looper::config::{self, LooperConfig};
use leverage_looper::core::position_manager::PositionManager;
use leverage_looper::execution::market_client::MarketClient;
use leverage_looper::execution::simulated::SimulatedLedger;
use leverage_looper::execution::wallet;
use leverage_looper::logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignore if missing).
    let _ = dotenvy::dotenv();

    let config_dir = std::env::var("BOT_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config"));

    let loaded = config::load_config(&config_dir)?;

    // Hold the guard for the process lifetime.
    let _guard = logging::init_tracing(&loaded.app.logging)?;

    info!(
        lending_market = %loaded.market.lending_market,
        reserves = loaded.market.reserves.len(),
        dry_run = loaded.positions.dry_run,
        "leverage looper starting"
    );

    // The binary only ever settles against the in-memory ledger, so every
    // operation executes regardless of the configured dry run flag.
    let config = Arc::new(loaded.rehearsal());
    info!("rehearsal mode: executing against the in-memory ledger, dry run lifted");

    // -----------------------------------------------------------------------
    // Signer and collaborators
    // -----------------------------------------------------------------------

    // Rehearsal settlements never leave the process: fall back to an
    // ephemeral signer when no key is configured.
    let signer = wallet::load_signer(true)?;
    info!(signer = %signer.address(), "signer initialized");

    // 1. Rehearsal ledger seeded from the environment
    let ledger = Arc::new(init_rehearsal_ledger(&config).await?);

    // 2. Market data client (falls back to the configured table)
    let market = Arc::new(
        MarketClient::new(
            &config.market,
            Duration::from_millis(config.timing.market.request_timeout_ms),
        )
        .context("failed to build market client")?,
    );

    // 3. Position manager
    let manager = PositionManager::new(
        config.clone(),
        ledger.clone(),
        ledger.clone(),
        market,
        signer,
    );

    info!("all components initialized");

    // -----------------------------------------------------------------------
    // Shutdown token
    // -----------------------------------------------------------------------

    let shutdown = CancellationToken::new();
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, cancelling after the current step");
            ctrl_c_token.cancel();
        }
    });

    // -----------------------------------------------------------------------
    // Rehearsal: deposit, loop, report, unwind
    // -----------------------------------------------------------------------

    let collateral = config.positions.loop_collateral_asset.clone();
    let seed = env_decimal("REHEARSAL_DEPOSIT").unwrap_or(dec!(10));

    let deposit = manager
        .deposit(&collateral, seed)
        .await
        .context("deposit failed")?;
    print_json("deposit", &deposit)?;
    if !deposit.success {
        warn!(error = ?deposit.error(), "seed deposit rejected, stopping rehearsal");
        return Ok(());
    }

    let looped = manager
        .run_loop(None, None, None, &shutdown)
        .await
        .context("leverage loop failed")?;
    print_json("loop", &looped)?;

    let health = manager
        .check_ltv_health()
        .await
        .context("health check failed")?;
    print_json("health", &health)?;

    if shutdown.is_cancelled() {
        info!("cancelled before unwind, leaving position open");
        return Ok(());
    }

    let unwound = manager.unwind(&shutdown).await.context("unwind failed")?;
    print_json("unwind", &unwound)?;
    if !unwound.success {
        error!(error = ?unwound.session.error, "unwind did not complete");
    }

    print_json("final_position", &manager.get_position().await)?;

    info!(sends = ledger.send_count().await, "rehearsal complete");
    Ok(())
}

// ---------------------------------------------------------------------------
// Initialization helpers
// ---------------------------------------------------------------------------

/// Build the in-memory market used for rehearsal runs.
///
/// Prices come from `REHEARSAL_PRICE_<ASSET>` (USD), defaulting to 1 for
/// every configured reserve. The wallet is funded with `REHEARSAL_FUNDS`
/// of the loop collateral asset.
async fn init_rehearsal_ledger(config: &LooperConfig) -> Result<SimulatedLedger> {
    let positions = &config.positions;
    let ledger = SimulatedLedger::new(
        config.market.reserves.clone(),
        positions.loop_collateral_asset.clone(),
        positions.loop_borrow_asset.clone(),
    );

    for asset in config.market.reserves.keys() {
        let price = env_decimal(&format!("REHEARSAL_PRICE_{asset}")).unwrap_or(Decimal::ONE);
        ledger.set_price(asset, price).await;
    }
    if let Some(rate) = env_decimal("REHEARSAL_STAKE_RATE") {
        ledger.set_stake_rate(rate).await;
    }

    let funds = env_decimal("REHEARSAL_FUNDS").unwrap_or(dec!(10));
    ledger
        .fund_wallet(&positions.loop_collateral_asset, funds)
        .await
        .context("failed to fund rehearsal wallet")?;

    info!(
        collateral = %positions.loop_collateral_asset,
        borrow = %positions.loop_borrow_asset,
        funds = %funds,
        "rehearsal ledger seeded"
    );
    Ok(ledger)
}

fn env_decimal(key: &str) -> Option<Decimal> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn print_json<T: serde::Serialize>(label: &str, value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value).context("failed to encode report")?;
    println!("== {label} ==\n{body}");
    Ok(())
}
