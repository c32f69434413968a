use std::collections::HashMap;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Live yield figures for one reserve (fractions, e.g. `0.052` = 5.2%).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AssetRates {
    #[serde(with = "rust_decimal::serde::str")]
    pub supply_apy: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub borrow_apy: Decimal,
}

/// Rates keyed by asset symbol.
pub type MarketRates = HashMap<String, AssetRates>;

/// Explicit cache value for market rates.
///
/// Owned by the position aggregator and injected at construction; there is
/// no process-wide rate state.
#[derive(Debug, Clone)]
pub struct RateCache {
    value: Option<MarketRates>,
    fetched_at: Option<Instant>,
    ttl: Duration,
}

impl RateCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            value: None,
            fetched_at: None,
            ttl,
        }
    }

    /// Cached rates if present and younger than the TTL.
    pub fn get(&self) -> Option<&MarketRates> {
        match (&self.value, self.fetched_at) {
            (Some(v), Some(at)) if at.elapsed() < self.ttl => Some(v),
            _ => None,
        }
    }

    pub fn store(&mut self, rates: MarketRates) {
        self.value = Some(rates);
        self.fetched_at = Some(Instant::now());
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
