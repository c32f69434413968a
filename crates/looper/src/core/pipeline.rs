//! Shared handles for the loop and unwind controllers.

use std::sync::Arc;

use tracing::debug;

use super::position_aggregator::PositionAggregator;
use super::safety::SafetyPolicy;
use crate::errors::LooperError;
use crate::execution::composer::{Composer, Intent};
use crate::execution::ledger::StakingConverter;
use crate::execution::settlement::SettlementEngine;
use crate::types::Outcome;

/// Everything a controller needs to read, check and settle one step.
#[derive(Clone)]
pub struct Pipeline {
    pub aggregator: Arc<PositionAggregator>,
    pub safety: Arc<SafetyPolicy>,
    pub composer: Arc<Composer>,
    pub engine: Arc<SettlementEngine>,
    pub staking: Arc<dyn StakingConverter>,
}

impl Pipeline {
    /// Compose `intent` into a settlement unit and run it to a terminal
    /// status.
    pub async fn execute(&self, intent: &Intent) -> Result<Outcome, LooperError> {
        let unit = self.composer.compose(intent)?;
        debug!(label = %unit.label, ops = unit.ops.len(), "executing settlement unit");
        self.engine.submit_and_confirm(unit).await
    }
}

/// The asset pair a loop or unwind cycles through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopAssets {
    /// Yield-bearing collateral produced by staking.
    pub collateral: String,
    /// Asset borrowed and staked.
    pub borrow: String,
}
