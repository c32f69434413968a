//! Position manager: the public entry point of the engine.
//!
//! Wires the aggregator, safety policy, composer, settlement engine and the
//! loop/unwind controllers from one [`LooperConfig`], and exposes the
//! mutating operations plus the read-only position and health queries.
//!
//! Every mutating operation:
//! 1. returns a synthetic success when `dry_run` is set, before touching
//!    the ledger
//! 2. validates the amount and reads a fresh position / wallet balance
//! 3. runs the safety projection where the action can raise LTV
//! 4. composes one settlement unit and runs it to a terminal status
//!
//! Expected failures come back as `ActionResult { success: false, .. }`.
//! Only configuration errors are returned as `Err`.

use std::sync::Arc;
use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::loop_controller::LoopController;
use super::pipeline::{LoopAssets, Pipeline};
use super::position_aggregator::PositionAggregator;
use super::safety::SafetyPolicy;
use super::unwind_controller::UnwindController;
use crate::config::LooperConfig;
use crate::constants::HARD_LTV_CEILING;
use crate::errors::LooperError;
use crate::execution::composer::{Composer, Intent};
use crate::execution::ledger::{Ledger, MarketDataSource, StakingConverter};
use crate::execution::market_client::fallback_rates;
use crate::execution::settlement::SettlementEngine;
use crate::types::{
    leg, ActionFailure, ActionKind, ActionResult, Amount, Leg, LoopReport, LoopSession, Position,
    RateCache, Reserve, SafetyVerdict, UnwindReport, UnwindSession, UnwindStatus,
};

pub struct PositionManager {
    config: Arc<LooperConfig>,
    ledger: Arc<dyn Ledger>,
    pipeline: Pipeline,
    looper: LoopController,
    unwinder: UnwindController,
}

impl PositionManager {
    pub fn new(
        config: Arc<LooperConfig>,
        ledger: Arc<dyn Ledger>,
        staking: Arc<dyn StakingConverter>,
        market: Arc<dyn MarketDataSource>,
        signer: PrivateKeySigner,
    ) -> Self {
        let reserves = config.market.reserves.clone();
        let engine = Arc::new(SettlementEngine::new(
            ledger.clone(),
            signer,
            &config.timing.confirmation,
        ));
        let aggregator = Arc::new(PositionAggregator::new(
            ledger.clone(),
            market,
            reserves.clone(),
            fallback_rates(&config.market.fallback_rates),
            engine.owner(),
            RateCache::new(Duration::from_secs(config.timing.market.rate_cache_ttl_seconds)),
        ));

        let pipeline = Pipeline {
            aggregator,
            safety: Arc::new(SafetyPolicy::new(reserves.clone(), &config.positions)),
            composer: Arc::new(Composer::new(reserves)),
            engine,
            staking,
        };

        let assets = LoopAssets {
            collateral: config.positions.loop_collateral_asset.clone(),
            borrow: config.positions.loop_borrow_asset.clone(),
        };
        let looper = LoopController::new(
            pipeline.clone(),
            config.positions.leverage_loop.clone(),
            assets.clone(),
            config.market.collateral_staking_apy,
        );
        let unwinder =
            UnwindController::new(pipeline.clone(), config.positions.unwind.clone(), assets);

        info!(
            owner = %pipeline.aggregator.owner(),
            dry_run = config.positions.dry_run,
            borrow_enabled = config.positions.borrow_enabled,
            loop_enabled = config.positions.loop_enabled,
            "PositionManager initialized"
        );

        Self {
            config,
            ledger,
            pipeline,
            looper,
            unwinder,
        }
    }

    fn is_dry_run(&self) -> bool {
        self.config.positions.dry_run
    }

    fn owner(&self) -> &str {
        self.pipeline.aggregator.owner()
    }

    // -----------------------------------------------------------------------
    // Read-only queries
    // -----------------------------------------------------------------------

    /// Fresh snapshot; empty (never an error) when no obligation exists.
    pub async fn get_position(&self) -> Position {
        self.pipeline.aggregator.get_position().await
    }

    /// Safety verdict of the current position against the loop borrow asset.
    pub async fn check_ltv_health(&self) -> Result<SafetyVerdict, LooperError> {
        let position = self.get_position().await;
        let verdict = self
            .pipeline
            .safety
            .check_safety(&position, &self.config.positions.loop_borrow_asset)?;
        if !verdict.safe {
            warn!(
                ltv = %verdict.ltv,
                cap = %verdict.cap,
                tier = verdict.tier.as_str(),
                reason = verdict.reason.as_deref().unwrap_or_default(),
                "position outside safe LTV"
            );
        }
        Ok(verdict)
    }

    // -----------------------------------------------------------------------
    // Single-unit actions
    // -----------------------------------------------------------------------

    pub async fn deposit(&self, asset: &str, amount: Decimal) -> Result<ActionResult, LooperError> {
        let kind = ActionKind::Deposit;
        let legs = vec![leg(asset, amount)];
        if self.is_dry_run() {
            return Ok(self.dry_run(kind, legs));
        }
        let result = self.try_deposit(asset, amount).await;
        self.fold(kind, legs, result)
    }

    async fn try_deposit(&self, asset: &str, amount: Decimal) -> Result<ActionResult, LooperError> {
        let kind = ActionKind::Deposit;
        if let Some(failure) = invalid_amount(amount) {
            return Ok(ActionResult::failed(kind, vec![leg(asset, amount)], failure));
        }
        let amount = self.pipeline.composer.quantize(asset, amount)?;
        let legs = vec![leg(asset, amount)];

        let available = self.wallet_units(asset).await?;
        if amount > available {
            return Ok(ActionResult::failed(
                kind,
                legs,
                insufficient(asset, amount, available),
            ));
        }

        let outcome = self
            .pipeline
            .execute(&Intent::Deposit {
                asset: asset.to_string(),
                amount,
            })
            .await?;
        info!(%asset, %amount, settlement_id = %outcome.id, "deposit confirmed");
        Ok(ActionResult::ok(kind, legs, outcome.id))
    }

    pub async fn withdraw(&self, asset: &str, amount: Amount) -> Result<ActionResult, LooperError> {
        let kind = ActionKind::Withdraw;
        let legs = vec![leg(asset, requested(amount))];
        if self.is_dry_run() {
            return Ok(self.dry_run(kind, legs));
        }
        let result = self.try_withdraw(asset, amount).await;
        self.fold(kind, legs, result)
    }

    async fn try_withdraw(&self, asset: &str, amount: Amount) -> Result<ActionResult, LooperError> {
        let kind = ActionKind::Withdraw;
        if let Amount::Exact(v) = amount {
            if let Some(failure) = invalid_amount(v) {
                return Ok(ActionResult::failed(kind, vec![leg(asset, v)], failure));
            }
        }
        self.reserve(asset)?;

        let position = self.get_position().await;
        let deposited = position.deposited_amount(asset);
        let units = match amount {
            Amount::Max if deposited.is_zero() => {
                info!(%asset, "nothing deposited, withdraw max is a no-op");
                return Ok(ActionResult::noop(kind, asset));
            }
            Amount::Max => deposited,
            Amount::Exact(v) => self.pipeline.composer.quantize(asset, v)?,
        };
        let legs = vec![leg(asset, units)];
        if units > deposited {
            return Ok(ActionResult::failed(
                kind,
                legs,
                insufficient(asset, units, deposited),
            ));
        }

        let removed_value = units * self.withdraw_price(&position, asset).await?;
        self.pipeline
            .safety
            .check_withdraw(&position, removed_value, Decimal::ZERO)?;

        let outcome = self
            .pipeline
            .execute(&Intent::Withdraw {
                asset: asset.to_string(),
                amount: match amount {
                    Amount::Max => Amount::Max,
                    Amount::Exact(_) => Amount::Exact(units),
                },
            })
            .await?;
        info!(%asset, amount = %units, settlement_id = %outcome.id, "withdraw confirmed");
        Ok(ActionResult::ok(kind, legs, outcome.id))
    }

    pub async fn borrow(&self, asset: &str, amount: Decimal) -> Result<ActionResult, LooperError> {
        let kind = ActionKind::Borrow;
        let legs = vec![leg(asset, amount)];
        if self.is_dry_run() {
            return Ok(self.dry_run(kind, legs));
        }
        let result = self.try_borrow(asset, amount).await;
        self.fold(kind, legs, result)
    }

    async fn try_borrow(&self, asset: &str, amount: Decimal) -> Result<ActionResult, LooperError> {
        let kind = ActionKind::Borrow;
        if let Some(failure) = invalid_amount(amount) {
            return Ok(ActionResult::failed(kind, vec![leg(asset, amount)], failure));
        }
        let amount = self.pipeline.composer.quantize(asset, amount)?;
        let legs = vec![leg(asset, amount)];

        let price = self.ledger.oracle_price(asset).await?;
        let position = self.get_position().await;
        self.pipeline
            .safety
            .check_borrow(&position, asset, amount * price)?;

        let outcome = self
            .pipeline
            .execute(&Intent::Borrow {
                asset: asset.to_string(),
                amount,
            })
            .await?;
        info!(%asset, %amount, settlement_id = %outcome.id, "borrow confirmed");
        Ok(ActionResult::ok(kind, legs, outcome.id))
    }

    pub async fn repay(&self, asset: &str, amount: Amount) -> Result<ActionResult, LooperError> {
        let kind = ActionKind::Repay;
        let legs = vec![leg(asset, requested(amount))];
        if self.is_dry_run() {
            return Ok(self.dry_run(kind, legs));
        }
        let result = self.try_repay(asset, amount).await;
        self.fold(kind, legs, result)
    }

    async fn try_repay(&self, asset: &str, amount: Amount) -> Result<ActionResult, LooperError> {
        let kind = ActionKind::Repay;
        if let Amount::Exact(v) = amount {
            if let Some(failure) = invalid_amount(v) {
                return Ok(ActionResult::failed(kind, vec![leg(asset, v)], failure));
            }
        }
        self.reserve(asset)?;

        let position = self.get_position().await;
        let owed = position.borrowed_amount(asset);
        if owed.is_zero() {
            info!(%asset, "no outstanding borrow, repay is a no-op");
            return Ok(ActionResult::noop(kind, asset));
        }

        let (units, op_amount) = match amount {
            Amount::Max => (owed, Amount::Max),
            Amount::Exact(v) => {
                let v = self.pipeline.composer.quantize(asset, v)?.min(owed);
                (v, Amount::Exact(v))
            }
        };
        let legs = vec![leg(asset, units)];

        let available = self.wallet_units(asset).await?;
        if units > available {
            return Ok(ActionResult::failed(
                kind,
                legs,
                insufficient(asset, units, available),
            ));
        }

        let outcome = self
            .pipeline
            .execute(&Intent::Repay {
                asset: asset.to_string(),
                amount: op_amount,
            })
            .await?;
        info!(%asset, amount = %units, settlement_id = %outcome.id, "repay confirmed");
        Ok(ActionResult::ok(kind, legs, outcome.id))
    }

    /// Repay and withdraw in one settlement unit, the withdrawal valued
    /// against the post-repay debt.
    pub async fn repay_and_withdraw(
        &self,
        repay_asset: &str,
        repay_amount: Amount,
        withdraw_asset: &str,
        withdraw_amount: Amount,
    ) -> Result<ActionResult, LooperError> {
        let kind = ActionKind::RepayAndWithdraw;
        let legs = vec![
            leg(repay_asset, requested(repay_amount)),
            leg(withdraw_asset, requested(withdraw_amount)),
        ];
        if self.is_dry_run() {
            return Ok(self.dry_run(kind, legs));
        }
        let result = self
            .try_repay_and_withdraw(repay_asset, repay_amount, withdraw_asset, withdraw_amount)
            .await;
        self.fold(kind, legs, result)
    }

    async fn try_repay_and_withdraw(
        &self,
        repay_asset: &str,
        repay_amount: Amount,
        withdraw_asset: &str,
        withdraw_amount: Amount,
    ) -> Result<ActionResult, LooperError> {
        let kind = ActionKind::RepayAndWithdraw;
        for (asset, amount) in [(repay_asset, repay_amount), (withdraw_asset, withdraw_amount)] {
            if let Amount::Exact(v) = amount {
                if let Some(failure) = invalid_amount(v) {
                    return Ok(ActionResult::failed(kind, vec![leg(asset, v)], failure));
                }
            }
            self.reserve(asset)?;
        }

        let position = self.get_position().await;
        let owed = position.borrowed_amount(repay_asset);
        let deposited = position.deposited_amount(withdraw_asset);

        let repay_units = match repay_amount {
            Amount::Max => owed,
            Amount::Exact(v) => self.pipeline.composer.quantize(repay_asset, v)?.min(owed),
        };
        let withdraw_units = match withdraw_amount {
            Amount::Max => deposited,
            Amount::Exact(v) => self.pipeline.composer.quantize(withdraw_asset, v)?,
        };
        let legs = vec![leg(repay_asset, repay_units), leg(withdraw_asset, withdraw_units)];

        if withdraw_units.is_zero() || withdraw_units > deposited {
            return Ok(ActionResult::failed(
                kind,
                legs,
                insufficient(withdraw_asset, withdraw_units, deposited),
            ));
        }
        let available = self.wallet_units(repay_asset).await?;
        if repay_units > available {
            return Ok(ActionResult::failed(
                kind,
                legs,
                insufficient(repay_asset, repay_units, available),
            ));
        }

        // An unpriced repay leg only understates the relief, so zero is safe.
        let repay_price = self.price(&position, repay_asset).await.unwrap_or_default();
        let withdraw_price = self.withdraw_price(&position, withdraw_asset).await?;
        let repaid_value = repay_units * repay_price;
        let removed_value = withdraw_units * withdraw_price;
        self.pipeline
            .safety
            .check_withdraw(&position, removed_value, repaid_value)?;

        let outcome = self
            .pipeline
            .execute(&Intent::RepayAndWithdraw {
                repay_asset: repay_asset.to_string(),
                repay_amount: match repay_amount {
                    Amount::Max => Amount::Max,
                    Amount::Exact(_) => Amount::Exact(repay_units),
                },
                withdraw_asset: withdraw_asset.to_string(),
                withdraw_amount: match withdraw_amount {
                    Amount::Max => Amount::Max,
                    Amount::Exact(_) => Amount::Exact(withdraw_units),
                },
            })
            .await?;
        info!(
            %repay_asset,
            repaid = %repay_units,
            %withdraw_asset,
            withdrawn = %withdraw_units,
            settlement_id = %outcome.id,
            "repay and withdraw confirmed"
        );
        Ok(ActionResult::ok(kind, legs, outcome.id))
    }

    // -----------------------------------------------------------------------
    // Loop / unwind
    // -----------------------------------------------------------------------

    /// Leverage loop toward `target_ltv` (default from config).
    ///
    /// `price_hint` is the borrow asset's USD price; the reserve oracle is
    /// read when none is given.
    pub async fn run_loop(
        &self,
        target_ltv: Option<Decimal>,
        max_loops: Option<u32>,
        price_hint: Option<Decimal>,
        cancel: &CancellationToken,
    ) -> Result<LoopReport, LooperError> {
        let policy = &self.config.positions.leverage_loop;
        let target = target_ltv.unwrap_or(policy.default_target_ltv);
        let max_loops = max_loops.unwrap_or(policy.max_loops);

        if self.is_dry_run() {
            info!(%target, max_loops, "dry run: leverage loop skipped");
            return Ok(LoopReport {
                success: true,
                dry_run: true,
                session: LoopSession::new(target),
                final_position: Position::empty(),
                leverage: Decimal::ONE,
                estimated_apy: Decimal::ZERO,
            });
        }

        if !self.config.positions.loop_enabled {
            return Ok(self.halted_loop(target, "leverage loop is disabled").await);
        }

        let price = match price_hint {
            Some(p) => p,
            None => {
                let asset = &self.config.positions.loop_borrow_asset;
                match self.ledger.oracle_price(asset).await {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, %asset, "no price for loop borrow asset");
                        return Ok(self.halted_loop(target, &e.to_string()).await);
                    }
                }
            }
        };

        self.looper.run(target, max_loops, price, cancel).await
    }

    pub async fn unwind(&self, cancel: &CancellationToken) -> Result<UnwindReport, LooperError> {
        if self.is_dry_run() {
            info!("dry run: unwind skipped");
            return Ok(UnwindReport {
                success: true,
                dry_run: true,
                session: UnwindSession::new(),
                final_position: Position::empty(),
            });
        }
        let report = self.unwinder.run(cancel).await?;
        if report.session.status == UnwindStatus::Failed {
            warn!(
                error = report.session.error.as_deref().unwrap_or_default(),
                "unwind stopped early, re-read the position before retrying"
            );
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn dry_run(&self, kind: ActionKind, legs: Vec<Leg>) -> ActionResult {
        info!(kind = kind.as_str(), ?legs, "dry run: no settlement submitted");
        ActionResult::dry_run(kind, legs)
    }

    /// Fold an error into a failed result; configuration errors propagate.
    fn fold(
        &self,
        kind: ActionKind,
        legs: Vec<Leg>,
        result: Result<ActionResult, LooperError>,
    ) -> Result<ActionResult, LooperError> {
        match result {
            Ok(r) => Ok(r),
            Err(e) => {
                let ambiguous = e.is_ambiguous();
                let failure = e.into_failure()?;
                warn!(kind = kind.as_str(), %failure, ambiguous, "action failed");
                Ok(ActionResult::failed(kind, legs, failure))
            }
        }
    }

    fn reserve(&self, asset: &str) -> Result<&Reserve, LooperError> {
        self.config
            .reserve(asset)
            .ok_or_else(|| LooperError::Config(format!("unknown reserve '{asset}'")))
    }

    async fn wallet_units(&self, asset: &str) -> Result<Decimal, LooperError> {
        let reserve = self.reserve(asset)?;
        let raw = self.ledger.wallet_balance(self.owner(), asset).await?;
        Ok(reserve.from_raw(raw))
    }

    /// Entry price of `asset`, falling back to the reserve oracle when the
    /// obligation left the entry unvalued.
    async fn price(&self, position: &Position, asset: &str) -> Option<Decimal> {
        if let Some(price) = entry_price(position, asset) {
            return Some(price);
        }
        match self.ledger.oracle_price(asset).await {
            Ok(price) if price > Decimal::ZERO => Some(price),
            Ok(price) => {
                warn!(%asset, %price, "non-positive oracle price");
                None
            }
            Err(e) => {
                warn!(%asset, error = %e, "oracle price unavailable");
                None
            }
        }
    }

    /// Price used to value collateral leaving the obligation. Refuses when
    /// neither the entry nor the oracle can price it.
    async fn withdraw_price(
        &self,
        position: &Position,
        asset: &str,
    ) -> Result<Decimal, LooperError> {
        self.price(position, asset)
            .await
            .ok_or_else(|| LooperError::SafetyRejected {
                ltv: position.ltv,
                cap: HARD_LTV_CEILING,
                reason: format!("cannot value {asset} withdrawal: no entry or oracle price"),
            })
    }

    async fn halted_loop(&self, target: Decimal, reason: &str) -> LoopReport {
        let mut session = LoopSession::new(target);
        session.halt_with_error(reason);
        let final_position = self.get_position().await;
        LoopReport {
            success: false,
            dry_run: false,
            leverage: final_position.leverage(),
            session,
            final_position,
            estimated_apy: Decimal::ZERO,
        }
    }
}

fn invalid_amount(amount: Decimal) -> Option<ActionFailure> {
    (amount <= Decimal::ZERO).then(|| ActionFailure::InvalidAmount {
        reason: format!("amount must be positive, got {amount}"),
    })
}

fn insufficient(asset: &str, requested: Decimal, available: Decimal) -> ActionFailure {
    ActionFailure::InsufficientFunds {
        asset: asset.to_string(),
        requested,
        available,
    }
}

/// Requested token units; "max" is resolved against the position later.
fn requested(amount: Amount) -> Decimal {
    match amount {
        Amount::Exact(v) => v,
        Amount::Max => Decimal::ZERO,
    }
}

/// USD per token unit of `asset` as valued in `position`, when the entry
/// carries a value.
fn entry_price(position: &Position, asset: &str) -> Option<Decimal> {
    position
        .deposit(asset)
        .or_else(|| position.borrow(asset))
        .filter(|e| !e.amount.is_zero() && e.value_usd > Decimal::ZERO)
        .map(|e| e.value_usd / e.amount)
}
