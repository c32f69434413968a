use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::constants::MAX_HEALTH_FACTOR;

/// Static per-asset reserve configuration, loaded from `market.json`.
///
/// `safe_borrow_ltv` is a conservative ceiling chosen by the operator; it is
/// deliberately lower than the protocol's `liquidation_threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reserve {
    pub symbol: String,
    /// Ledger address of the reserve account.
    pub address: String,
    pub decimals: u8,
    #[serde(with = "rust_decimal::serde::str")]
    pub safe_borrow_ltv: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub liquidation_threshold: Decimal,
    /// Wrapped native asset: withdrawals and borrows are unwrapped in cleanup.
    #[serde(default)]
    pub is_native: bool,
}

impl Reserve {
    fn scale(&self) -> Decimal {
        Decimal::from(10u64.pow(self.decimals as u32))
    }

    /// Token units to raw integer units. Truncates sub-unit dust.
    pub fn to_raw(&self, amount: Decimal) -> u64 {
        (amount * self.scale()).trunc().to_u64().unwrap_or(0)
    }

    /// Raw integer units to token units.
    pub fn from_raw(&self, raw: u64) -> Decimal {
        Decimal::from(raw) / self.scale()
    }
}

/// One deposit or borrow line inside a [`Position`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetEntry {
    pub asset: String,
    /// Token units (decimals applied).
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub raw_amount: u64,
    /// Oracle value in USD.
    #[serde(with = "rust_decimal::serde::str")]
    pub value_usd: Decimal,
    /// Supply APY for deposits, borrow APY for borrows (fraction).
    #[serde(with = "rust_decimal::serde::str")]
    pub apy: Decimal,
}

/// Immutable snapshot of one account's obligation.
///
/// Built fresh by the position aggregator on every read. A missing on-ledger
/// obligation is [`Position::empty`], never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub deposits: Vec<AssetEntry>,
    pub borrows: Vec<AssetEntry>,
    #[serde(with = "rust_decimal::serde::str")]
    pub deposit_value: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub borrow_value: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ltv: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub health_factor: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub max_ltv: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub liquidation_threshold: Decimal,
    pub fetched_at: i64,
}

impl Position {
    /// Zero position with a maximally safe health factor.
    pub fn empty() -> Self {
        Self {
            deposits: Vec::new(),
            borrows: Vec::new(),
            deposit_value: Decimal::ZERO,
            borrow_value: Decimal::ZERO,
            ltv: Decimal::ZERO,
            health_factor: MAX_HEALTH_FACTOR,
            max_ltv: Decimal::ZERO,
            liquidation_threshold: Decimal::ZERO,
            fetched_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deposits.is_empty() && self.borrows.is_empty()
    }

    pub fn deposit(&self, asset: &str) -> Option<&AssetEntry> {
        self.deposits.iter().find(|e| e.asset == asset)
    }

    pub fn borrow(&self, asset: &str) -> Option<&AssetEntry> {
        self.borrows.iter().find(|e| e.asset == asset)
    }

    /// Deposited token units of `asset` (zero if absent).
    pub fn deposited_amount(&self, asset: &str) -> Decimal {
        self.deposit(asset).map_or(Decimal::ZERO, |e| e.amount)
    }

    /// Borrowed token units of `asset` (zero if absent).
    pub fn borrowed_amount(&self, asset: &str) -> Decimal {
        self.borrow(asset).map_or(Decimal::ZERO, |e| e.amount)
    }

    pub fn net_equity(&self) -> Decimal {
        self.deposit_value - self.borrow_value
    }

    /// `deposit_value / net_equity`; 1 for an unlevered or empty position.
    pub fn leverage(&self) -> Decimal {
        let equity = self.net_equity();
        if equity <= Decimal::ZERO || self.deposit_value.is_zero() {
            return Decimal::ONE;
        }
        self.deposit_value / equity
    }
}

/// Health factor = liquidation threshold / LTV.
///
/// Returns `Decimal::MAX` when there is no debt.
pub fn compute_health_factor(liquidation_threshold: Decimal, ltv: Decimal) -> Decimal {
    if ltv <= Decimal::ZERO {
        return MAX_HEALTH_FACTOR;
    }
    liquidation_threshold / ltv
}
