//! Leverage loop controller.
//!
//! Each iteration re-reads the position, borrows a haircut share of the
//! remaining headroom below the target LTV, stakes the borrowed asset into
//! yield-bearing collateral and redeposits it. Iterations are strictly
//! sequential: iteration N's settlements reach a terminal status before
//! iteration N+1 reads the position.
//!
//! The target is clamped to the effective borrow cap up front, and every
//! borrow satisfies `borrow + h <= deposit × target`, so the projected LTV
//! can never pass the target regardless of what staking returns.

use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pipeline::{LoopAssets, Pipeline};
use crate::config::LoopPolicy;
use crate::constants::UNKNOWN_ASSET_BORROW_APY;
use crate::errors::LooperError;
use crate::execution::composer::Intent;
use crate::types::{Amount, CompensationOutcome, LoopReport, LoopSession, LoopStatus, Position};

/// Borrowable USD before `target` LTV, after the drift haircut.
///
/// `max(0, deposit × target − borrow) × haircut`
pub fn compute_headroom(
    deposit_value: Decimal,
    borrow_value: Decimal,
    target_ltv: Decimal,
    haircut: Decimal,
) -> Decimal {
    (deposit_value * target_ltv - borrow_value).max(Decimal::ZERO) * haircut
}

/// `leverage × collateral_yield − (leverage − 1) × borrow_cost`
pub fn blended_apy(leverage: Decimal, collateral_yield: Decimal, borrow_cost: Decimal) -> Decimal {
    leverage * collateral_yield - (leverage - Decimal::ONE) * borrow_cost
}

pub struct LoopController {
    pipeline: Pipeline,
    policy: LoopPolicy,
    assets: LoopAssets,
    /// Native staking yield of the collateral, on top of its supply APY.
    staking_apy: Decimal,
}

impl LoopController {
    pub fn new(
        pipeline: Pipeline,
        policy: LoopPolicy,
        assets: LoopAssets,
        staking_apy: Decimal,
    ) -> Self {
        info!(
            collateral = %assets.collateral,
            borrow = %assets.borrow,
            haircut = %policy.headroom_haircut,
            tolerance = %policy.convergence_tolerance,
            min_headroom_usd = %policy.min_headroom_usd,
            "LoopController initialized"
        );
        Self {
            pipeline,
            policy,
            assets,
            staking_apy,
        }
    }

    /// Run up to `max_loops` iterations toward `target_ltv`.
    ///
    /// `price_hint` is the USD price of one unit of the borrow asset used to
    /// size each borrow. Only configuration errors are returned as `Err`;
    /// every other failure halts the session in `HaltedError`.
    pub async fn run(
        &self,
        target_ltv: Decimal,
        max_loops: u32,
        price_hint: Decimal,
        cancel: &CancellationToken,
    ) -> Result<LoopReport, LooperError> {
        let cap = self.pipeline.safety.cap_for(&self.assets.borrow)?;
        let target = target_ltv.min(cap);
        if target < target_ltv {
            warn!(requested = %target_ltv, %cap, "target ltv clamped to effective borrow cap");
        }

        let mut session = LoopSession::new(target);
        let floor = target * self.policy.convergence_tolerance;

        if target <= Decimal::ZERO {
            session.halt_with_error(format!("target ltv must be positive, got {target}"));
        } else if price_hint <= Decimal::ZERO {
            session.halt_with_error(format!("price hint must be positive, got {price_hint}"));
        } else {
            session.status = LoopStatus::Iterating;
            info!(%target, max_loops, %price_hint, "leverage loop starting");
        }

        let mut iteration = 0;
        while session.status == LoopStatus::Iterating && iteration < max_loops {
            iteration += 1;

            if cancel.is_cancelled() {
                info!(iteration, "leverage loop cancelled");
                session.halt(LoopStatus::Cancelled);
                break;
            }

            let position = self.pipeline.aggregator.get_position().await;
            if position.ltv >= floor {
                info!(iteration, ltv = %position.ltv, %floor, "leverage loop converged");
                session.halt(LoopStatus::Converged);
                break;
            }

            let headroom = compute_headroom(
                position.deposit_value,
                position.borrow_value,
                target,
                self.policy.headroom_haircut,
            );
            if headroom < self.policy.min_headroom_usd {
                info!(
                    iteration,
                    headroom = %headroom.round_dp(2),
                    min = %self.policy.min_headroom_usd,
                    "headroom below floor, halting"
                );
                session.halt(LoopStatus::HaltedHeadroom);
                break;
            }

            match self.iterate(&position, headroom, price_hint, &mut session).await {
                Ok(()) => {}
                Err(e @ LooperError::Config(_)) => return Err(e),
                Err(e) => {
                    error!(iteration, error = %e, "leverage loop iteration failed");
                    session.halt_with_error(e.to_string());
                }
            }
        }

        let final_position = self.pipeline.aggregator.get_position().await;
        if session.status == LoopStatus::Iterating {
            session.halt(if final_position.ltv >= floor {
                LoopStatus::Converged
            } else {
                LoopStatus::MaxLoopsReached
            });
        }

        let leverage = final_position.leverage();
        let estimated_apy = self.estimate_apy(leverage).await;

        info!(
            status = ?session.status,
            loops = session.loops_completed,
            ltv = %final_position.ltv,
            leverage = %leverage.round_dp(3),
            estimated_apy = %estimated_apy.round_dp(4),
            "leverage loop finished"
        );

        Ok(LoopReport {
            success: !session.status.is_error(),
            dry_run: false,
            session,
            final_position,
            leverage,
            estimated_apy,
        })
    }

    /// Borrow, stake, redeposit.
    async fn iterate(
        &self,
        position: &Position,
        headroom: Decimal,
        price: Decimal,
        session: &mut LoopSession,
    ) -> Result<(), LooperError> {
        let borrow_asset = &self.assets.borrow;
        let amount = self.pipeline.composer.quantize(borrow_asset, headroom / price)?;
        if amount.is_zero() {
            return Err(LooperError::Ledger(format!(
                "headroom {headroom} rounds to zero {borrow_asset}"
            )));
        }

        // Sized at the hint, checked at no less than the oracle so an
        // understated hint cannot push the position past its cap.
        let oracle = self.pipeline.aggregator.oracle_price(borrow_asset).await?;
        let check_price = price.max(oracle);
        if check_price > price {
            debug!(hint = %price, %oracle, "price hint below oracle, checking at oracle");
        }
        self.pipeline
            .safety
            .check_borrow(position, borrow_asset, amount * check_price)?;

        let borrowed = self
            .pipeline
            .execute(&Intent::Borrow {
                asset: borrow_asset.clone(),
                amount,
            })
            .await?;
        session.settlement_ids.push(borrowed.id);
        session.total_borrowed += amount;

        let staked = match self.pipeline.staking.stake(amount).await {
            Ok(conversion) => conversion,
            Err(e) => {
                warn!(error = %e, %amount, "stake failed, repaying borrowed funds");
                session.compensation = Some(self.compensate(amount).await);
                return Err(e);
            }
        };
        session.settlement_ids.push(staked.settlement_id);

        let deposited = self
            .pipeline
            .execute(&Intent::Deposit {
                asset: self.assets.collateral.clone(),
                amount: staked.received,
            })
            .await?;
        session.settlement_ids.push(deposited.id);
        session.total_redeposited += staked.received;
        session.loops_completed += 1;

        info!(
            iteration = session.loops_completed,
            borrowed = %amount,
            redeposited = %staked.received,
            headroom = %headroom.round_dp(2),
            "loop iteration complete"
        );
        Ok(())
    }

    /// Best-effort repay of a borrow whose stake failed.
    async fn compensate(&self, amount: Decimal) -> CompensationOutcome {
        let asset = self.assets.borrow.clone();
        let repay = Intent::Repay {
            asset: asset.clone(),
            amount: Amount::Exact(amount),
        };

        match self.pipeline.execute(&repay).await {
            Ok(outcome) => {
                info!(%asset, %amount, settlement_id = %outcome.id, "compensating repay confirmed");
                CompensationOutcome::Repaid {
                    asset,
                    amount,
                    settlement_id: outcome.id,
                }
            }
            Err(e) => {
                error!(
                    %asset,
                    %amount,
                    error = %e,
                    "compensating repay failed, borrowed funds left in wallet"
                );
                CompensationOutcome::Failed {
                    asset,
                    amount,
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn estimate_apy(&self, leverage: Decimal) -> Decimal {
        let rates = self.pipeline.aggregator.market_rates().await;
        let collateral_yield = rates
            .get(&self.assets.collateral)
            .map_or(Decimal::ZERO, |r| r.supply_apy)
            + self.staking_apy;
        let borrow_cost = rates
            .get(&self.assets.borrow)
            .map_or(UNKNOWN_ASSET_BORROW_APY, |r| r.borrow_apy);
        blended_apy(leverage, collateral_yield, borrow_cost)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{ConfirmationTiming, PositionConfig, UnwindPolicy};
    use crate::core::position_aggregator::PositionAggregator;
    use crate::core::safety::SafetyPolicy;
    use crate::execution::composer::tests::reserves;
    use crate::execution::composer::Composer;
    use crate::execution::ledger::{Conversion, MarketDataSource, StakingConverter};
    use crate::execution::settlement::SettlementEngine;
    use crate::execution::simulated::tests::market;
    use crate::execution::simulated::SimulatedLedger;
    use crate::types::{AssetRates, MarketRates, RateCache};
    use alloy::signers::local::PrivateKeySigner;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;

    pub(crate) struct StaticRates;

    #[async_trait]
    impl MarketDataSource for StaticRates {
        async fn fetch_rates(&self) -> Result<MarketRates, LooperError> {
            let mut rates = MarketRates::new();
            rates.insert(
                "JITOSOL".into(),
                AssetRates {
                    supply_apy: dec!(0.001),
                    borrow_apy: dec!(0.02),
                },
            );
            rates.insert(
                "SOL".into(),
                AssetRates {
                    supply_apy: dec!(0.03),
                    borrow_apy: dec!(0.05),
                },
            );
            Ok(rates)
        }
    }

    pub(crate) fn position_config(global_cap: Decimal) -> PositionConfig {
        PositionConfig {
            dry_run: false,
            global_borrow_cap: global_cap,
            borrow_enabled: true,
            loop_enabled: true,
            loop_collateral_asset: "JITOSOL".into(),
            loop_borrow_asset: "SOL".into(),
            leverage_loop: LoopPolicy {
                default_target_ltv: dec!(0.55),
                max_loops: 3,
                headroom_haircut: dec!(0.90),
                convergence_tolerance: dec!(0.95),
                min_headroom_usd: dec!(1),
            },
            unwind: UnwindPolicy {
                max_iterations: 6,
                withdraw_fraction: dec!(0.40),
                unstake_slippage: dec!(0.001),
                borrow_dust: dec!(0.001),
                collateral_dust: dec!(0.001),
            },
        }
    }

    pub(crate) fn assets() -> LoopAssets {
        LoopAssets {
            collateral: "JITOSOL".into(),
            borrow: "SOL".into(),
        }
    }

    /// Simulated market wired through the real aggregator, safety policy,
    /// composer and settlement engine.
    pub(crate) async fn rig(global_cap: Decimal) -> (Arc<SimulatedLedger>, Pipeline) {
        let ledger = Arc::new(market().await);
        let engine = Arc::new(SettlementEngine::new(
            ledger.clone(),
            PrivateKeySigner::random(),
            &ConfirmationTiming {
                poll_interval_ms: 100,
                max_attempts: 5,
            },
        ));
        let aggregator = Arc::new(PositionAggregator::new(
            ledger.clone(),
            Arc::new(StaticRates),
            reserves(),
            MarketRates::new(),
            engine.owner(),
            RateCache::new(Duration::from_secs(300)),
        ));
        let pipeline = Pipeline {
            aggregator,
            safety: Arc::new(SafetyPolicy::new(reserves(), &position_config(global_cap))),
            composer: Arc::new(Composer::new(reserves())),
            engine,
            staking: ledger.clone(),
        };
        (ledger, pipeline)
    }

    fn controller(pipeline: Pipeline) -> LoopController {
        LoopController::new(
            pipeline,
            position_config(dec!(0.60)).leverage_loop,
            assets(),
            dec!(0.07),
        )
    }

    /// Stake always fails; the next settlement after it fails too.
    struct BrokenStakePool {
        ledger: Arc<SimulatedLedger>,
    }

    #[async_trait]
    impl StakingConverter for BrokenStakePool {
        async fn stake(&self, _amount: Decimal) -> Result<Conversion, LooperError> {
            self.ledger.fail_next_settlement("repay instruction rejected").await;
            Err(LooperError::Ledger("stake pool paused".into()))
        }

        async fn instant_unstake(
            &self,
            amount: Decimal,
            max_slippage: Decimal,
        ) -> Result<Conversion, LooperError> {
            self.ledger.instant_unstake(amount, max_slippage).await
        }
    }

    // -----------------------------------------------------------------------
    // Pure helpers
    // -----------------------------------------------------------------------

    #[test]
    fn test_first_iteration_headroom() {
        // $100 deposited, nothing borrowed, target 0.65, 10% haircut.
        assert_eq!(
            compute_headroom(dec!(100), Decimal::ZERO, dec!(0.65), dec!(0.90)),
            dec!(58.50)
        );
    }

    #[test]
    fn test_headroom_never_negative() {
        assert_eq!(
            compute_headroom(dec!(100), dec!(70), dec!(0.60), dec!(0.90)),
            Decimal::ZERO
        );
    }

    #[test]
    fn test_blended_apy() {
        // 3x at 8% collateral yield, 5% borrow cost: 24% − 10%.
        assert_eq!(blended_apy(dec!(3), dec!(0.08), dec!(0.05)), dec!(0.14));
        assert_eq!(blended_apy(Decimal::ONE, dec!(0.08), dec!(0.05)), dec!(0.08));
    }

    proptest! {
        #[test]
        fn headroom_within_haircut_of_instantaneous(
            deposit in 0u64..10_000_000u64,
            borrow in 0u64..10_000_000u64,
            target_bps in 1u32..7000u32,
        ) {
            let deposit = Decimal::from(deposit);
            let borrow = Decimal::from(borrow);
            let target = Decimal::from(target_bps) / dec!(10000);
            let h = compute_headroom(deposit, borrow, target, dec!(0.90));
            let instantaneous = (target * deposit - borrow).max(Decimal::ZERO);
            prop_assert!(h <= instantaneous * dec!(0.90));
            prop_assert!(borrow + h <= deposit * target || h.is_zero());
        }
    }

    // -----------------------------------------------------------------------
    // run
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_first_borrow_is_haircut_headroom() {
        let (ledger, pipeline) = rig(dec!(0.65)).await;
        ledger.set_price("JITOSOL", dec!(100)).await;
        ledger.seed_deposit("JITOSOL", dec!(1)).await.unwrap();

        let report = LoopController::new(
            pipeline,
            position_config(dec!(0.65)).leverage_loop,
            assets(),
            dec!(0.07),
        )
        .run(dec!(0.65), 1, dec!(100), &CancellationToken::new())
        .await
        .unwrap();

        // $58.50 of headroom at $100/SOL.
        assert_eq!(ledger.borrowed("SOL").await, dec!(0.585));
        assert_eq!(report.session.total_borrowed, dec!(0.585));
        assert_eq!(report.session.total_redeposited, dec!(0.5265));
        assert_eq!(report.session.status, LoopStatus::MaxLoopsReached);
        assert_eq!(report.session.settlement_ids.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_without_overshoot() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();

        let report = controller(pipeline)
            .run(dec!(0.60), 10, dec!(100), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.session.status, LoopStatus::Converged);
        let ltv = report.final_position.ltv;
        assert!(ltv <= dec!(0.60), "overshot: {ltv}");
        assert!(ltv >= dec!(0.57), "not converged: {ltv}");
        assert!(report.session.loops_completed <= 10);
        assert!(report.leverage > Decimal::ONE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_spent_before_convergence() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();

        let report = controller(pipeline)
            .run(dec!(0.60), 3, dec!(100), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.session.status, LoopStatus::MaxLoopsReached);
        assert_eq!(report.session.loops_completed, 3);
        assert!(report.final_position.ltv < dec!(0.57));
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_clamped_to_effective_cap() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();

        let report = controller(pipeline)
            .run(dec!(0.90), 10, dec!(100), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.session.target_ltv, dec!(0.60));
        assert!(report.final_position.ltv <= dec!(0.60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_position_halts_on_headroom() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        // $1.10 of collateral: headroom ≈ $0.59, below the $1 floor.
        ledger.seed_deposit("JITOSOL", dec!(0.01)).await.unwrap();

        let report = controller(pipeline)
            .run(dec!(0.60), 3, dec!(100), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.session.status, LoopStatus::HaltedHeadroom);
        assert_eq!(ledger.send_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_borrow_failure_halts_with_error() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();
        ledger.fail_next_settlement("reserve borrow limit reached").await;

        let report = controller(pipeline)
            .run(dec!(0.60), 3, dec!(100), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.session.status, LoopStatus::HaltedError);
        assert!(report
            .session
            .error
            .as_deref()
            .is_some_and(|e| e.contains("borrow limit")));
        assert!(report.session.compensation.is_none());
        assert_eq!(ledger.borrowed("SOL").await, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stake_failure_repays_borrow() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();
        ledger.fail_next_stake().await;

        let report = controller(pipeline)
            .run(dec!(0.60), 3, dec!(100), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.session.status, LoopStatus::HaltedError);
        assert!(matches!(
            report.session.compensation,
            Some(CompensationOutcome::Repaid { ref asset, .. }) if asset == "SOL"
        ));
        assert_eq!(ledger.borrowed("SOL").await, Decimal::ZERO);
        assert_eq!(ledger.wallet("SOL").await, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_compensation_is_reported() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        let pipeline = Pipeline {
            staking: Arc::new(BrokenStakePool {
                ledger: ledger.clone(),
            }),
            ..pipeline
        };
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();

        let report = controller(pipeline)
            .run(dec!(0.60), 3, dec!(100), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.session.status, LoopStatus::HaltedError);
        match report.session.compensation {
            Some(CompensationOutcome::Failed { amount, reason, .. }) => {
                assert!(reason.contains("repay instruction rejected"));
                // Borrowed funds sit in the wallet, debt unchanged.
                assert_eq!(ledger.borrowed("SOL").await, amount);
                assert_eq!(ledger.wallet("SOL").await, amount);
            }
            other => panic!("expected failed compensation, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_first_iteration() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = controller(pipeline)
            .run(dec!(0.60), 3, dec!(100), &cancel)
            .await
            .unwrap();

        assert_eq!(report.session.status, LoopStatus::Cancelled);
        assert_eq!(ledger.send_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_understated_price_hint_is_checked_at_oracle() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        // $1100 of collateral, SOL oracle at $100.
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();

        // At $80 the loop sizes 7.425 SOL: $594 at the hint, $742.50 (0.675
        // ltv) at the oracle.
        let report = controller(pipeline)
            .run(dec!(0.60), 3, dec!(80), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.session.status, LoopStatus::HaltedError);
        assert!(report
            .session
            .error
            .as_deref()
            .is_some_and(|e| e.contains("safety rejection")));
        assert_eq!(ledger.send_count().await, 0);
        assert_eq!(ledger.borrowed("SOL").await, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overstated_price_hint_borrows_conservatively() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();

        let report = controller(pipeline)
            .run(dec!(0.60), 1, dec!(120), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.success);
        // $594 / $120 = 4.95 SOL, worth $495 at the oracle.
        assert_eq!(ledger.borrowed("SOL").await, dec!(4.95));
        assert!(report.final_position.ltv <= dec!(0.60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_positive_price_hint_halts() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();

        let report = controller(pipeline)
            .run(dec!(0.60), 3, Decimal::ZERO, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.session.status, LoopStatus::HaltedError);
        assert_eq!(ledger.send_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimated_apy_uses_live_rates_and_staking_yield() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();

        let report = controller(pipeline)
            .run(dec!(0.60), 2, dec!(100), &CancellationToken::new())
            .await
            .unwrap();

        let expected = blended_apy(report.leverage, dec!(0.001) + dec!(0.07), dec!(0.05));
        assert_eq!(report.estimated_apy, expected);
    }
}
