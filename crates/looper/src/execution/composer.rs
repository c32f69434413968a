//! Action composer: turns an intent into one ordered, atomic settlement unit.
//!
//! Every unit is assembled from the same declarative slot list:
//!
//! ```text
//! pre      ensure token accounts, wrap native for deposit/repay, refresh
//!          touched reserves, refresh obligation
//! main1    first operation group
//! refresh  refresh touched reserves + obligation (two-group intents only)
//! main2    second operation group
//! post     unwrap whatever is left in the wrapped-native account
//! ```
//!
//! The ledger rejects a second group that runs against the valuation left by
//! the first, so the refresh slot sits strictly between the two groups.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::errors::LooperError;
use crate::types::{Amount, LedgerOp, OpAmount, Reserve, SettlementUnit};

/// One atomic intent.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Deposit {
        asset: String,
        amount: Decimal,
    },
    Withdraw {
        asset: String,
        amount: Amount,
    },
    Borrow {
        asset: String,
        amount: Decimal,
    },
    Repay {
        asset: String,
        amount: Amount,
    },
    RepayAndWithdraw {
        repay_asset: String,
        repay_amount: Amount,
        withdraw_asset: String,
        withdraw_amount: Amount,
    },
}

impl Intent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Deposit { .. } => "deposit",
            Self::Withdraw { .. } => "withdraw",
            Self::Borrow { .. } => "borrow",
            Self::Repay { .. } => "repay",
            Self::RepayAndWithdraw { .. } => "repay_and_withdraw",
        }
    }
}

/// Slot order of every settlement unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Pre,
    Main1,
    Refresh,
    Main2,
    Post,
}

pub const SLOT_ORDER: [Slot; 5] = [Slot::Pre, Slot::Main1, Slot::Refresh, Slot::Main2, Slot::Post];

/// Operations grouped by slot, flattened in [`SLOT_ORDER`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SlotPlan {
    pub pre: Vec<LedgerOp>,
    pub main1: Vec<LedgerOp>,
    pub refresh: Vec<LedgerOp>,
    pub main2: Vec<LedgerOp>,
    pub post: Vec<LedgerOp>,
}

impl SlotPlan {
    pub fn slot(&self, slot: Slot) -> &[LedgerOp] {
        match slot {
            Slot::Pre => &self.pre,
            Slot::Main1 => &self.main1,
            Slot::Refresh => &self.refresh,
            Slot::Main2 => &self.main2,
            Slot::Post => &self.post,
        }
    }

    pub fn into_unit(self, label: &str) -> SettlementUnit {
        let ops = SLOT_ORDER
            .iter()
            .flat_map(|s| self.slot(*s).iter().cloned())
            .collect();
        SettlementUnit {
            label: label.to_string(),
            ops,
        }
    }
}

pub struct Composer {
    reserves: HashMap<String, Reserve>,
}

impl Composer {
    pub fn new(reserves: HashMap<String, Reserve>) -> Self {
        Self { reserves }
    }

    fn reserve(&self, asset: &str) -> Result<&Reserve, LooperError> {
        self.reserves
            .get(asset)
            .ok_or_else(|| LooperError::Config(format!("unknown reserve '{asset}'")))
    }

    /// Round `amount` down to what `asset`'s raw precision can represent.
    pub fn quantize(&self, asset: &str, amount: Decimal) -> Result<Decimal, LooperError> {
        let reserve = self.reserve(asset)?;
        Ok(reserve.from_raw(reserve.to_raw(amount)))
    }

    /// Build the settlement unit for `intent`.
    pub fn compose(&self, intent: &Intent) -> Result<SettlementUnit, LooperError> {
        self.plan(intent).map(|p| p.into_unit(intent.label()))
    }

    /// Build the slot plan for `intent` without flattening it.
    pub fn plan(&self, intent: &Intent) -> Result<SlotPlan, LooperError> {
        let mut plan = SlotPlan::default();
        match intent {
            Intent::Deposit { asset, amount } => plan.main1.push(LedgerOp::Deposit {
                asset: asset.clone(),
                amount: self.exact(asset, *amount)?,
            }),
            Intent::Withdraw { asset, amount } => plan.main1.push(LedgerOp::Withdraw {
                asset: asset.clone(),
                amount: self.op_amount(asset, *amount)?,
            }),
            Intent::Borrow { asset, amount } => plan.main1.push(LedgerOp::Borrow {
                asset: asset.clone(),
                amount: self.exact(asset, *amount)?,
            }),
            Intent::Repay { asset, amount } => plan.main1.push(LedgerOp::Repay {
                asset: asset.clone(),
                amount: self.op_amount(asset, *amount)?,
            }),
            Intent::RepayAndWithdraw {
                repay_asset,
                repay_amount,
                withdraw_asset,
                withdraw_amount,
            } => {
                plan.main1.push(LedgerOp::Repay {
                    asset: repay_asset.clone(),
                    amount: self.op_amount(repay_asset, *repay_amount)?,
                });
                plan.main2.push(LedgerOp::Withdraw {
                    asset: withdraw_asset.clone(),
                    amount: self.op_amount(withdraw_asset, *withdraw_amount)?,
                });
            }
        }

        let main_ops = || plan.main1.iter().chain(plan.main2.iter());

        let mut touched: Vec<String> = Vec::new();
        for op in main_ops() {
            let asset = op_asset(op);
            if !touched.iter().any(|t| t == asset) {
                touched.push(asset.to_string());
            }
        }

        let refresh_all: Vec<LedgerOp> = touched
            .iter()
            .map(|a| LedgerOp::RefreshReserve { asset: a.clone() })
            .chain(std::iter::once(LedgerOp::RefreshObligation))
            .collect();

        // Deposit and repay draw on the wrapped-native account, which has to
        // be funded from the native balance before the obligation refresh.
        let wraps: Vec<LedgerOp> = main_ops()
            .filter_map(|op| match op {
                LedgerOp::Deposit { asset, amount } | LedgerOp::Repay { asset, amount }
                    if self.is_native(asset) =>
                {
                    Some(LedgerOp::WrapNative { amount: *amount })
                }
                _ => None,
            })
            .collect();

        // Withdraw and borrow deliver wrapped tokens; a repay may leave a
        // remainder once it is clamped to the amount owed.
        let unwrap = main_ops().any(|op| match op {
            LedgerOp::Withdraw { asset, .. }
            | LedgerOp::Borrow { asset, .. }
            | LedgerOp::Repay { asset, .. } => self.is_native(asset),
            _ => false,
        });

        plan.pre = touched
            .iter()
            .map(|a| LedgerOp::EnsureTokenAccount { asset: a.clone() })
            .chain(wraps)
            .chain(refresh_all.iter().cloned())
            .collect();
        if !plan.main2.is_empty() {
            plan.refresh = refresh_all;
        }
        if unwrap {
            plan.post.push(LedgerOp::UnwrapNative);
        }

        Ok(plan)
    }

    fn is_native(&self, asset: &str) -> bool {
        self.reserves.get(asset).is_some_and(|r| r.is_native)
    }

    fn exact(&self, asset: &str, amount: Decimal) -> Result<OpAmount, LooperError> {
        Ok(OpAmount::Raw(self.reserve(asset)?.to_raw(amount)))
    }

    fn op_amount(&self, asset: &str, amount: Amount) -> Result<OpAmount, LooperError> {
        match amount {
            Amount::Exact(v) => self.exact(asset, v),
            Amount::Max => self.reserve(asset).map(|_| OpAmount::All),
        }
    }
}

fn op_asset(op: &LedgerOp) -> &str {
    match op {
        LedgerOp::Deposit { asset, .. }
        | LedgerOp::Withdraw { asset, .. }
        | LedgerOp::Borrow { asset, .. }
        | LedgerOp::Repay { asset, .. }
        | LedgerOp::EnsureTokenAccount { asset }
        | LedgerOp::RefreshReserve { asset } => asset,
        LedgerOp::RefreshObligation | LedgerOp::WrapNative { .. } | LedgerOp::UnwrapNative => "",
    }
}
