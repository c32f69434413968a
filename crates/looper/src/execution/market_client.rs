//! HTTP client for the lending market's reserve metrics API.
//!
//! `GET {api_url}/reserves/metrics` returns one record per reserve with its
//! current supply and borrow APY. Any failure (network, status, body) falls
//! back to a conservative rate table so valuation never stalls on metrics.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use super::ledger::MarketDataSource;
use super::normalize::flex_decimal;
use crate::config::MarketConfig;
use crate::constants::FALLBACK_RATES;
use crate::errors::LooperError;
use crate::types::{AssetRates, MarketRates};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReserveMetrics {
    #[serde(alias = "liquidityToken")]
    symbol: String,
    #[serde(deserialize_with = "flex_decimal")]
    supply_apy: Decimal,
    #[serde(deserialize_with = "flex_decimal")]
    borrow_apy: Decimal,
}

/// Fallback table: built-in conservative rates, overlaid by the rates
/// configured in `market.json`.
pub fn fallback_rates(configured: &HashMap<String, AssetRates>) -> MarketRates {
    let mut rates: MarketRates = FALLBACK_RATES
        .iter()
        .map(|(symbol, supply_apy, borrow_apy)| {
            (
                symbol.to_string(),
                AssetRates {
                    supply_apy: *supply_apy,
                    borrow_apy: *borrow_apy,
                },
            )
        })
        .collect();
    rates.extend(configured.iter().map(|(k, v)| (k.clone(), *v)));
    rates
}

pub struct MarketClient {
    http: Client,
    base_url: String,
    fallback: MarketRates,
}

impl MarketClient {
    pub fn new(market: &MarketConfig, request_timeout: Duration) -> Result<Self, LooperError> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: market.api_url.trim_end_matches('/').to_string(),
            fallback: fallback_rates(&market.fallback_rates),
        })
    }

    async fn fetch_live(&self) -> Result<MarketRates, LooperError> {
        let url = format!("{}/reserves/metrics", self.base_url);
        let records: Vec<ReserveMetrics> = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(records
            .into_iter()
            .map(|r| {
                (
                    r.symbol.to_uppercase(),
                    AssetRates {
                        supply_apy: r.supply_apy,
                        borrow_apy: r.borrow_apy,
                    },
                )
            })
            .collect())
    }
}

#[async_trait]
impl MarketDataSource for MarketClient {
    /// Live rates merged over the fallback table. Never fails.
    async fn fetch_rates(&self) -> Result<MarketRates, LooperError> {
        if self.base_url.is_empty() {
            debug!("no market api configured, using fallback rates");
            return Ok(self.fallback.clone());
        }

        match self.fetch_live().await {
            Ok(live) => {
                debug!(reserves = live.len(), "fetched live market rates");
                let mut rates = self.fallback.clone();
                rates.extend(live);
                Ok(rates)
            }
            Err(e) => {
                warn!(error = %e, "market rates unavailable, using fallback table");
                Ok(self.fallback.clone())
            }
        }
    }
}
