//! Ledger account normalization.
//!
//! Obligation accounts arrive in more than one shape: entry collections keyed
//! by reserve or as arrays, numbers as JSON numbers or strings, and the same
//! field under several names. Everything is parsed here, once, into a typed
//! [`RawObligation`]. Nothing downstream looks at the JSON.

use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::errors::LooperError;

// ---------------------------------------------------------------------------
// Typed output
// ---------------------------------------------------------------------------

/// One deposit or borrow line before reserve resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    /// Reserve symbol or ledger address.
    pub reserve: String,
    pub raw_amount: u64,
    /// Entry-level oracle value, when the account carries one.
    pub value_usd: Option<Decimal>,
}

/// Oracle-refreshed obligation totals.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub deposit_value: Decimal,
    pub borrow_value: Decimal,
    pub ltv: Option<Decimal>,
    pub liquidation_threshold: Option<Decimal>,
    pub max_ltv: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawObligation {
    pub deposits: Vec<RawEntry>,
    pub borrows: Vec<RawEntry>,
    pub aggregate: Option<Aggregate>,
}

/// Parse raw obligation account data into a [`RawObligation`].
///
/// Zero-amount entries (empty slots) are dropped.
pub fn parse_obligation(value: &Value) -> Result<RawObligation, LooperError> {
    let doc = ObligationDoc::deserialize(value)?;

    let aggregate = match doc.aggregate {
        Some(a) => Some(Aggregate {
            deposit_value: a.deposit_value.to_decimal()?,
            borrow_value: a.borrow_value.to_decimal()?,
            ltv: a.ltv.map(|v| v.to_decimal()).transpose()?,
            liquidation_threshold: a.liquidation_threshold.map(|v| v.to_decimal()).transpose()?,
            max_ltv: a.max_ltv.map(|v| v.to_decimal()).transpose()?,
        }),
        None => None,
    };

    Ok(RawObligation {
        deposits: doc.deposits.into_entries()?,
        borrows: doc.borrows.into_entries()?,
        aggregate,
    })
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ObligationDoc {
    #[serde(default, alias = "collateral", alias = "depositEntries")]
    deposits: EntrySet,
    #[serde(default, alias = "debts", alias = "borrowEntries")]
    borrows: EntrySet,
    #[serde(default, alias = "stats", alias = "refreshedStats")]
    aggregate: Option<AggregateDoc>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EntrySet {
    List(Vec<EntryDoc>),
    Keyed(BTreeMap<String, EntryDoc>),
}

impl Default for EntrySet {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl EntrySet {
    fn into_entries(self) -> Result<Vec<RawEntry>, LooperError> {
        let pairs: Vec<(Option<String>, EntryDoc)> = match self {
            Self::List(list) => list.into_iter().map(|e| (None, e)).collect(),
            Self::Keyed(map) => map.into_iter().map(|(k, e)| (Some(k), e)).collect(),
        };

        let mut entries = Vec::with_capacity(pairs.len());
        for (key, doc) in pairs {
            let raw_amount = doc.amount.to_u64()?;
            if raw_amount == 0 {
                continue;
            }
            let reserve = doc
                .reserve
                .or(key)
                .ok_or_else(|| LooperError::Ledger("obligation entry without a reserve".into()))?;
            entries.push(RawEntry {
                reserve,
                raw_amount,
                value_usd: doc.value.map(|v| v.to_decimal()).transpose()?,
            });
        }
        Ok(entries)
    }
}

#[derive(Deserialize)]
struct EntryDoc {
    #[serde(
        default,
        alias = "mint",
        alias = "symbol",
        alias = "asset",
        alias = "depositReserve",
        alias = "borrowReserve"
    )]
    reserve: Option<String>,
    #[serde(
        alias = "raw_amount",
        alias = "depositedAmount",
        alias = "borrowedAmount"
    )]
    amount: Flex,
    #[serde(
        default,
        alias = "value_usd",
        alias = "marketValue",
        alias = "marketValueRefreshed"
    )]
    value: Option<Flex>,
}

#[derive(Deserialize)]
struct AggregateDoc {
    #[serde(alias = "userTotalDeposit", alias = "depositedValue")]
    deposit_value: Flex,
    #[serde(alias = "userTotalBorrow", alias = "borrowedValue")]
    borrow_value: Flex,
    #[serde(default, alias = "loanToValue")]
    ltv: Option<Flex>,
    #[serde(default, alias = "liquidationLtv")]
    liquidation_threshold: Option<Flex>,
    #[serde(default, alias = "maxLtv")]
    max_ltv: Option<Flex>,
}

/// A number that may be encoded as a JSON number or a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum Flex {
    Num(serde_json::Number),
    Str(String),
}

impl Flex {
    fn to_decimal(&self) -> Result<Decimal, LooperError> {
        let text = match self {
            Self::Num(n) => n.to_string(),
            Self::Str(s) => s.trim().to_string(),
        };
        Decimal::from_str(&text)
            .or_else(|_| Decimal::from_scientific(&text))
            .map_err(|e| LooperError::Ledger(format!("invalid number '{text}': {e}")))
    }

    fn to_u64(&self) -> Result<u64, LooperError> {
        let d = self.to_decimal()?;
        d.trunc()
            .to_u64()
            .ok_or_else(|| LooperError::Ledger(format!("amount {d} out of range")))
    }
}

/// Deserialize a [`Decimal`] from either a JSON number or a string.
pub(crate) fn flex_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    Flex::deserialize(deserializer)?
        .to_decimal()
        .map_err(serde::de::Error::custom)
}
