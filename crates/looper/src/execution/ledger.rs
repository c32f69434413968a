//! Upstream collaborator seams.
//!
//! The lending ledger, the staking converter and the market metrics source
//! are consumed only through these traits. Concrete adapters live next to
//! them: [`super::market_client::MarketClient`] over HTTP and
//! [`super::simulated::SimulatedLedger`] for rehearsal runs and tests.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::errors::LooperError;
use crate::types::{FreshnessToken, MarketRates, SettlementId, SettlementStatus, SignedSettlement};

/// Ledger RPC: settlement submission, status polling and raw state reads.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Most recent checkpoint plus the height after which a submission
    /// referencing it is rejected.
    async fn latest_checkpoint(&self) -> Result<FreshnessToken, LooperError>;

    async fn current_height(&self) -> Result<u64, LooperError>;

    /// Fire-and-forget accept. Returns as soon as the ledger has taken the
    /// submission; the outcome is observed through [`Ledger::status`].
    async fn send(&self, settlement: SignedSettlement) -> Result<SettlementId, LooperError>;

    /// `Ok(None)` while the ledger has no status for `id` yet.
    async fn status(&self, id: &SettlementId) -> Result<Option<SettlementStatus>, LooperError>;

    /// Raw obligation account data for `owner`, as the RPC returns it.
    /// `Ok(None)` when no obligation exists. Shape is normalized by
    /// [`super::normalize::parse_obligation`].
    async fn read_obligation(&self, owner: &str) -> Result<Option<Value>, LooperError>;

    /// Wallet token balance in raw integer units.
    async fn wallet_balance(&self, owner: &str, asset: &str) -> Result<u64, LooperError>;

    /// Reserve oracle price in USD per token unit.
    async fn oracle_price(&self, asset: &str) -> Result<Decimal, LooperError>;
}

/// Result of a staking conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversion {
    /// Token units of the output asset credited to the wallet.
    pub received: Decimal,
    pub settlement_id: SettlementId,
}

/// Converts the borrow asset into the yield-bearing collateral asset and back.
#[async_trait]
pub trait StakingConverter: Send + Sync {
    /// Stake `amount` of the borrow asset, receiving collateral.
    async fn stake(&self, amount: Decimal) -> Result<Conversion, LooperError>;

    /// Instantly unstake `amount` of collateral back into the borrow asset,
    /// accepting at most `max_slippage` (fraction) below the fair rate.
    async fn instant_unstake(
        &self,
        amount: Decimal,
        max_slippage: Decimal,
    ) -> Result<Conversion, LooperError>;
}

/// Read-only market metrics: live supply and borrow rates per reserve.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_rates(&self) -> Result<MarketRates, LooperError>;
}
