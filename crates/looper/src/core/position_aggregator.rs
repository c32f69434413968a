//! Position aggregator: reads the on-ledger obligation and values it.
//!
//! Every call reads the ledger fresh. The only state held here is the market
//! rate cache. Read failures degrade to [`Position::empty`] so health checks
//! stay live through RPC outages.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::constants::UNKNOWN_ASSET_BORROW_APY;
use crate::errors::LooperError;
use crate::execution::ledger::{Ledger, MarketDataSource};
use crate::execution::normalize::{parse_obligation, RawEntry, RawObligation};
use crate::types::{
    compute_health_factor, AssetEntry, AssetRates, MarketRates, Position, RateCache, Reserve,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Deposit,
    Borrow,
}

pub struct PositionAggregator {
    ledger: Arc<dyn Ledger>,
    market: Arc<dyn MarketDataSource>,
    reserves: HashMap<String, Reserve>,
    /// Used whenever the market source errors.
    fallback_rates: MarketRates,
    owner: String,
    rates: Mutex<RateCache>,
}

impl PositionAggregator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        market: Arc<dyn MarketDataSource>,
        reserves: HashMap<String, Reserve>,
        fallback_rates: MarketRates,
        owner: String,
        cache: RateCache,
    ) -> Self {
        info!(
            owner = %owner,
            reserves = reserves.len(),
            rate_ttl_secs = cache.ttl().as_secs(),
            "PositionAggregator initialized"
        );
        Self {
            ledger,
            market,
            reserves,
            fallback_rates,
            owner,
            rates: Mutex::new(cache),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Fresh snapshot of the obligation. Never fails.
    pub async fn get_position(&self) -> Position {
        let mut raw = match self.ledger.read_obligation(&self.owner).await {
            Ok(Some(value)) => match parse_obligation(&value) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(error = %e, "obligation account unparseable, reporting empty position");
                    return Position::empty();
                }
            },
            Ok(None) => {
                debug!(owner = %self.owner, "no obligation on ledger");
                return Position::empty();
            }
            Err(e) => {
                warn!(error = %e, "obligation read failed, reporting empty position");
                return Position::empty();
            }
        };

        self.price_unvalued(&mut raw).await;
        let rates = self.market_rates().await;
        let position = self.value(raw, &rates);

        debug!(
            deposit_value = %position.deposit_value,
            borrow_value = %position.borrow_value,
            ltv = %position.ltv,
            health_factor = %position.health_factor,
            "position fetched"
        );
        position
    }

    /// Oracle price of one unit of `asset`, read fresh from the ledger.
    pub async fn oracle_price(&self, asset: &str) -> Result<Decimal, LooperError> {
        self.ledger.oracle_price(asset).await
    }

    /// Market rates, served from the cache while fresh.
    ///
    /// Source errors yield the fallback table, which is not cached so the
    /// next call retries the source.
    pub async fn market_rates(&self) -> MarketRates {
        let mut cache = self.rates.lock().await;
        if let Some(rates) = cache.get() {
            return rates.clone();
        }

        match self.market.fetch_rates().await {
            Ok(rates) => {
                cache.store(rates.clone());
                rates
            }
            Err(e) => {
                warn!(error = %e, "market rates unavailable, using fallback table");
                self.fallback_rates.clone()
            }
        }
    }

    /// Value entries the account left unvalued at the reserve oracle.
    /// Entries the oracle cannot price stay at zero.
    async fn price_unvalued(&self, raw: &mut RawObligation) {
        for e in raw.deposits.iter_mut().chain(raw.borrows.iter_mut()) {
            let unvalued = e.value_usd.map_or(true, |v| v <= Decimal::ZERO);
            if !unvalued || e.raw_amount == 0 {
                continue;
            }
            let Some(reserve) = self.resolve(&e.reserve) else {
                continue;
            };
            match self.ledger.oracle_price(&reserve.symbol).await {
                Ok(price) => {
                    let value = reserve.from_raw(e.raw_amount) * price;
                    debug!(asset = %reserve.symbol, %value, "entry valued at oracle");
                    e.value_usd = Some(value);
                }
                Err(err) => {
                    warn!(
                        asset = %reserve.symbol,
                        error = %err,
                        "entry left unvalued, oracle unavailable"
                    );
                }
            }
        }
    }

    /// Look a reserve up by symbol, then by ledger address.
    fn resolve(&self, key: &str) -> Option<&Reserve> {
        self.reserves
            .get(key)
            .or_else(|| self.reserves.values().find(|r| r.address == key))
    }

    fn entries(&self, raw: &[RawEntry], side: Side, rates: &MarketRates) -> Vec<AssetEntry> {
        raw.iter()
            .filter_map(|e| {
                let Some(reserve) = self.resolve(&e.reserve) else {
                    warn!(reserve = %e.reserve, ?side, "entry for unconfigured reserve skipped");
                    return None;
                };
                let apy = match (rates.get(&reserve.symbol), side) {
                    (Some(AssetRates { supply_apy, .. }), Side::Deposit) => *supply_apy,
                    (Some(AssetRates { borrow_apy, .. }), Side::Borrow) => *borrow_apy,
                    (None, Side::Deposit) => Decimal::ZERO,
                    (None, Side::Borrow) => UNKNOWN_ASSET_BORROW_APY,
                };
                Some(AssetEntry {
                    asset: reserve.symbol.clone(),
                    amount: reserve.from_raw(e.raw_amount),
                    raw_amount: e.raw_amount,
                    value_usd: e.value_usd.unwrap_or(Decimal::ZERO),
                    apy,
                })
            })
            .collect()
    }

    /// Value a normalized obligation.
    ///
    /// The oracle-refreshed aggregate wins over summed entry values. A side
    /// with exactly one entry has that entry backfilled from the aggregate;
    /// sides with several entries are left as reported.
    fn value(&self, raw: RawObligation, rates: &MarketRates) -> Position {
        let mut deposits = self.entries(&raw.deposits, Side::Deposit, rates);
        let mut borrows = self.entries(&raw.borrows, Side::Borrow, rates);

        let summed_deposits: Decimal = deposits.iter().map(|e| e.value_usd).sum();
        let summed_borrows: Decimal = borrows.iter().map(|e| e.value_usd).sum();

        let (deposit_value, borrow_value) = match &raw.aggregate {
            Some(agg) => {
                backfill(&mut deposits, agg.deposit_value);
                backfill(&mut borrows, agg.borrow_value);
                (agg.deposit_value, agg.borrow_value)
            }
            None => (summed_deposits, summed_borrows),
        };

        let aggregate = raw.aggregate.as_ref();
        let ltv = aggregate.and_then(|a| a.ltv).unwrap_or_else(|| {
            if deposit_value > Decimal::ZERO {
                borrow_value / deposit_value
            } else {
                Decimal::ZERO
            }
        });
        let liquidation_threshold = aggregate
            .and_then(|a| a.liquidation_threshold)
            .unwrap_or_else(|| self.weighted(&deposits, |r| r.liquidation_threshold));
        let max_ltv = aggregate
            .and_then(|a| a.max_ltv)
            .unwrap_or_else(|| self.weighted(&deposits, |r| r.safe_borrow_ltv));

        Position {
            deposits,
            borrows,
            deposit_value,
            borrow_value,
            ltv,
            health_factor: compute_health_factor(liquidation_threshold, ltv),
            max_ltv,
            liquidation_threshold,
            fetched_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Value-weighted average of a reserve parameter over `entries`.
    fn weighted(&self, entries: &[AssetEntry], param: impl Fn(&Reserve) -> Decimal) -> Decimal {
        let total: Decimal = entries.iter().map(|e| e.value_usd).sum();
        if total.is_zero() {
            // Nothing to weight by: take the most conservative parameter.
            return entries
                .iter()
                .filter_map(|e| self.reserves.get(&e.asset).map(&param))
                .min()
                .unwrap_or(Decimal::ZERO);
        }
        let weighted: Decimal = entries
            .iter()
            .filter_map(|e| self.reserves.get(&e.asset).map(|r| param(r) * e.value_usd))
            .sum();
        weighted / total
    }
}

fn backfill(entries: &mut [AssetEntry], aggregate: Decimal) {
    if let [only] = entries {
        if only.value_usd != aggregate {
            debug!(
                asset = %only.asset,
                entry_value = %only.value_usd,
                aggregate = %aggregate,
                "backfilling entry value from refreshed aggregate"
            );
            only.value_usd = aggregate;
        }
    }
}
