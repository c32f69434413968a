//! Unwind controller: mirrored de-leverage of a looped position.
//!
//! Each iteration withdraws a fixed fraction of the remaining collateral,
//! instant-unstakes it back into the borrow asset and repays as much of the
//! borrow as the conversion returned. Completed sub-steps stay committed when
//! a later one fails; the session records how far it got.

use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::pipeline::{LoopAssets, Pipeline};
use crate::config::UnwindPolicy;
use crate::errors::LooperError;
use crate::execution::composer::Intent;
use crate::types::{Amount, Position, UnwindReport, UnwindSession, UnwindStatus};

pub struct UnwindController {
    pipeline: Pipeline,
    policy: UnwindPolicy,
    assets: LoopAssets,
}

impl UnwindController {
    pub fn new(pipeline: Pipeline, policy: UnwindPolicy, assets: LoopAssets) -> Self {
        info!(
            collateral = %assets.collateral,
            borrow = %assets.borrow,
            withdraw_fraction = %policy.withdraw_fraction,
            max_iterations = policy.max_iterations,
            "UnwindController initialized"
        );
        Self {
            pipeline,
            policy,
            assets,
        }
    }

    /// Unwind until the borrow is below dust, collateral runs out, the
    /// iteration budget is spent or a step fails.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<UnwindReport, LooperError> {
        let mut session = UnwindSession::new();
        session.status = UnwindStatus::Iterating;

        for iteration in 1..=self.policy.max_iterations {
            if cancel.is_cancelled() {
                info!(iteration, "unwind cancelled");
                session.status = UnwindStatus::Cancelled;
                break;
            }

            let position = self.pipeline.aggregator.get_position().await;
            let owed = position.borrowed_amount(&self.assets.borrow);
            if owed < self.policy.borrow_dust {
                info!(iteration, %owed, "borrow below dust, unwind done");
                session.status = UnwindStatus::Done;
                break;
            }

            let collateral = position.deposited_amount(&self.assets.collateral);
            if collateral < self.policy.collateral_dust {
                info!(iteration, %collateral, %owed, "collateral exhausted with borrow outstanding");
                session.status = UnwindStatus::CollateralExhausted;
                break;
            }

            match self.iterate(&position, &mut session).await {
                Ok(()) => session.iterations += 1,
                Err(e @ LooperError::Config(_)) => return Err(e),
                Err(e) => {
                    error!(iteration, error = %e, "unwind iteration failed");
                    session.fail(e.to_string());
                    break;
                }
            }
        }

        let final_position = self.pipeline.aggregator.get_position().await;
        if session.status == UnwindStatus::Iterating {
            let remaining = final_position.borrowed_amount(&self.assets.borrow);
            session.status = if remaining < self.policy.borrow_dust {
                UnwindStatus::Done
            } else {
                UnwindStatus::MaxIterationsReached
            };
        }

        info!(
            status = ?session.status,
            iterations = session.iterations,
            withdrawn = %session.total_withdrawn,
            repaid = %session.total_repaid,
            ltv = %final_position.ltv,
            "unwind finished"
        );

        Ok(UnwindReport {
            success: session.status != UnwindStatus::Failed,
            dry_run: false,
            session,
            final_position,
        })
    }

    /// Withdraw, unstake, repay.
    async fn iterate(
        &self,
        position: &Position,
        session: &mut UnwindSession,
    ) -> Result<(), LooperError> {
        let collateral = position.deposited_amount(&self.assets.collateral);
        let owed = position.borrowed_amount(&self.assets.borrow);

        let withdraw = self
            .pipeline
            .composer
            .quantize(&self.assets.collateral, collateral * self.policy.withdraw_fraction)?;
        if withdraw.is_zero() {
            return Err(LooperError::Ledger(format!(
                "withdraw fraction of {collateral} {} rounds to zero",
                self.assets.collateral
            )));
        }

        let withdrawn = self
            .pipeline
            .execute(&Intent::Withdraw {
                asset: self.assets.collateral.clone(),
                amount: Amount::Exact(withdraw),
            })
            .await?;
        session.settlement_ids.push(withdrawn.id);
        session.total_withdrawn += withdraw;

        let converted = self
            .pipeline
            .staking
            .instant_unstake(withdraw, self.policy.unstake_slippage)
            .await?;
        session.settlement_ids.push(converted.settlement_id);
        session.total_converted += converted.received;

        // Repaying everything outstanding is sent as "max" so accrued dust
        // does not linger.
        let (repay, amount) = if converted.received >= owed {
            (owed, Amount::Max)
        } else {
            (converted.received, Amount::Exact(converted.received))
        };

        let repaid = self
            .pipeline
            .execute(&Intent::Repay {
                asset: self.assets.borrow.clone(),
                amount,
            })
            .await?;
        session.settlement_ids.push(repaid.id);
        session.total_repaid += repay;

        info!(
            iteration = session.iterations + 1,
            withdrawn = %withdraw,
            converted = %converted.received,
            repaid = %repay,
            "unwind iteration complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loop_controller::tests::{assets, position_config, rig};
    use crate::core::loop_controller::LoopController;
    use rust_decimal_macros::dec;

    fn controller(pipeline: Pipeline) -> UnwindController {
        UnwindController::new(pipeline, position_config(dec!(0.60)).unwind, assets())
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_iteration_withdraws_forty_percent() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        ledger.set_price("JITOSOL", dec!(150)).await;
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();
        ledger.seed_borrow("SOL", dec!(8)).await.unwrap();
        ledger.set_stake_rate(dec!(0.8)).await;

        let mut policy = position_config(dec!(0.60)).unwind;
        policy.max_iterations = 1;
        let report = UnwindController::new(pipeline, policy, assets())
            .run(&CancellationToken::new())
            .await
            .unwrap();

        let s = &report.session;
        assert_eq!(s.total_withdrawn, dec!(4));
        // 4 JITOSOL / 0.8 stake rate, less 0.1% slippage.
        assert_eq!(s.total_converted, dec!(4.995));
        assert_eq!(s.total_repaid, dec!(4.995));
        assert_eq!(ledger.deposited("JITOSOL").await, dec!(6));
        assert_eq!(ledger.borrowed("SOL").await, dec!(3.005));
        assert_eq!(s.status, UnwindStatus::MaxIterationsReached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwinds_to_done_with_strictly_decreasing_amounts() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        ledger.set_price("JITOSOL", dec!(150)).await;
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();
        ledger.seed_borrow("SOL", dec!(8)).await.unwrap();

        let aggregator = pipeline.aggregator.clone();
        let controller = controller(pipeline);

        let mut previous = aggregator.get_position().await;
        let mut steps = 0;
        loop {
            let one = UnwindController {
                policy: UnwindPolicy {
                    max_iterations: 1,
                    ..controller.policy.clone()
                },
                pipeline: controller.pipeline.clone(),
                assets: controller.assets.clone(),
            };
            let report = one.run(&CancellationToken::new()).await.unwrap();
            if report.session.status == UnwindStatus::Done {
                break;
            }
            let current = report.final_position;
            assert!(current.deposited_amount("JITOSOL") < previous.deposited_amount("JITOSOL"));
            assert!(current.borrowed_amount("SOL") < previous.borrowed_amount("SOL"));
            previous = current;
            steps += 1;
            assert!(steps < 6, "unwind did not finish");
        }

        assert_eq!(ledger.borrowed("SOL").await, Decimal::ZERO);
        assert!(ledger.deposited("JITOSOL").await > Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_run_finishes_done() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        ledger.set_price("JITOSOL", dec!(150)).await;
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();
        ledger.seed_borrow("SOL", dec!(8)).await.unwrap();

        let report = controller(pipeline).run(&CancellationToken::new()).await.unwrap();

        assert!(report.success);
        assert_eq!(report.session.status, UnwindStatus::Done);
        assert_eq!(report.final_position.borrow_value, Decimal::ZERO);
        // Last iteration repays the remainder as "max".
        let units = ledger.accepted_units().await;
        let last_repay = units.iter().rev().find(|u| u.label == "repay").unwrap();
        assert!(last_repay.main_ops().any(|op| matches!(
            op,
            crate::types::LedgerOp::Repay {
                amount: crate::types::OpAmount::All,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_then_unwind_round_trip() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();

        let looped = LoopController::new(
            pipeline.clone(),
            position_config(dec!(0.60)).leverage_loop,
            assets(),
            dec!(0.07),
        )
        .run(dec!(0.55), 3, dec!(100), &CancellationToken::new())
        .await
        .unwrap();
        assert!(looped.final_position.borrow_value > Decimal::ZERO);

        let report = controller(pipeline).run(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.session.status, UnwindStatus::Done);
        assert_eq!(ledger.borrowed("SOL").await, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_borrow_is_done_immediately() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();

        let report = controller(pipeline).run(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.session.status, UnwindStatus::Done);
        assert_eq!(report.session.iterations, 0);
        assert_eq!(ledger.send_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_borrow_without_loop_collateral_is_exhausted() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        ledger.seed_deposit("USDC", dec!(5000)).await.unwrap();
        ledger.seed_borrow("SOL", dec!(2)).await.unwrap();

        let report = controller(pipeline).run(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.session.status, UnwindStatus::CollateralExhausted);
        assert!(report.success);
        assert_eq!(ledger.send_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unstake_failure_keeps_withdrawal_committed() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        ledger.set_price("JITOSOL", dec!(150)).await;
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();
        ledger.seed_borrow("SOL", dec!(8)).await.unwrap();
        ledger.fail_next_unstake().await;

        let report = controller(pipeline).run(&CancellationToken::new()).await.unwrap();

        assert!(!report.success);
        assert_eq!(report.session.status, UnwindStatus::Failed);
        assert!(report.session.error.as_deref().is_some_and(|e| e.contains("pool drained")));
        assert_eq!(report.session.total_withdrawn, dec!(4));
        assert_eq!(ledger.wallet("JITOSOL").await, dec!(4));
        assert_eq!(ledger.borrowed("SOL").await, dec!(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_first_iteration() {
        let (ledger, pipeline) = rig(dec!(0.60)).await;
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();
        ledger.seed_borrow("SOL", dec!(1)).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = controller(pipeline).run(&cancel).await.unwrap();

        assert_eq!(report.session.status, UnwindStatus::Cancelled);
        assert_eq!(ledger.send_count().await, 0);
    }
}
