//! In-memory lending market for rehearsal runs and tests.
//!
//! Implements [`Ledger`] and [`StakingConverter`] over a single wallet and a
//! single obligation. Settlements are verified, applied atomically in their
//! composed order and reported through the same status-polling path as a
//! real ledger. The market enforces the refresh-before-main-operation rule,
//! so a settlement unit whose second group runs on a stale valuation is
//! rejected exactly like on chain.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::ledger::{Conversion, Ledger, StakingConverter};
use super::wallet::settlement_digest;
use crate::errors::LooperError;
use crate::types::{
    FreshnessToken, LedgerOp, OpAmount, Reserve, SettlementId, SettlementStatus, SettlementUnit,
    SignedSettlement,
};

/// Blocks a freshness token stays valid for.
const VALIDITY_WINDOW: u64 = 150;

#[derive(Debug, Clone, Default)]
struct Balances {
    wallet: BTreeMap<String, u64>,
    /// Wrapped-native token accounts. Native reserves settle through these.
    wrapped: BTreeMap<String, u64>,
    deposits: BTreeMap<String, u64>,
    borrows: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
struct SimState {
    balances: Balances,
    prices: HashMap<String, Decimal>,
    /// Collateral units received per borrow-asset unit staked.
    stake_rate: Decimal,
    height: u64,
    next_id: u64,
    /// Remaining status sequence per settlement; the last entry repeats.
    statuses: HashMap<SettlementId, VecDeque<Option<SettlementStatus>>>,
    confirmation_delay: u32,
    fail_next_settlement: Option<String>,
    fail_next_stake: bool,
    fail_next_unstake: bool,
    fail_reads: bool,
    accepted: Vec<SettlementUnit>,
    sends: u32,
}

impl SimState {
    fn next_id(&mut self, prefix: &str) -> SettlementId {
        self.next_id += 1;
        SettlementId(format!("{prefix}-{}", self.next_id))
    }
}

pub struct SimulatedLedger {
    reserves: HashMap<String, Reserve>,
    collateral_asset: String,
    borrow_asset: String,
    state: Mutex<SimState>,
}

impl SimulatedLedger {
    /// Empty market. `collateral_asset` is what staking produces from
    /// `borrow_asset`.
    pub fn new(
        reserves: HashMap<String, Reserve>,
        collateral_asset: impl Into<String>,
        borrow_asset: impl Into<String>,
    ) -> Self {
        Self {
            reserves,
            collateral_asset: collateral_asset.into(),
            borrow_asset: borrow_asset.into(),
            state: Mutex::new(SimState {
                stake_rate: Decimal::ONE,
                height: 1_000,
                ..SimState::default()
            }),
        }
    }

    fn reserve(&self, asset: &str) -> Result<&Reserve, LooperError> {
        self.reserves
            .get(asset)
            .ok_or_else(|| LooperError::Ledger(format!("unknown reserve '{asset}'")))
    }

    // -----------------------------------------------------------------------
    // Scenario setup
    // -----------------------------------------------------------------------

    pub async fn set_price(&self, asset: &str, price_usd: Decimal) {
        self.state.lock().await.prices.insert(asset.to_string(), price_usd);
    }

    pub async fn set_stake_rate(&self, rate: Decimal) {
        self.state.lock().await.stake_rate = rate;
    }

    pub async fn fund_wallet(&self, asset: &str, amount: Decimal) -> Result<(), LooperError> {
        let raw = self.reserve(asset)?.to_raw(amount);
        *self
            .state
            .lock()
            .await
            .balances
            .wallet
            .entry(asset.to_string())
            .or_default() += raw;
        Ok(())
    }

    pub async fn seed_deposit(&self, asset: &str, amount: Decimal) -> Result<(), LooperError> {
        let raw = self.reserve(asset)?.to_raw(amount);
        *self
            .state
            .lock()
            .await
            .balances
            .deposits
            .entry(asset.to_string())
            .or_default() += raw;
        Ok(())
    }

    pub async fn seed_borrow(&self, asset: &str, amount: Decimal) -> Result<(), LooperError> {
        let raw = self.reserve(asset)?.to_raw(amount);
        *self
            .state
            .lock()
            .await
            .balances
            .borrows
            .entry(asset.to_string())
            .or_default() += raw;
        Ok(())
    }

    /// Polls returning no status before each new settlement confirms.
    pub async fn set_confirmation_delay(&self, polls: u32) {
        self.state.lock().await.confirmation_delay = polls;
    }

    pub async fn fail_next_settlement(&self, reason: &str) {
        self.state.lock().await.fail_next_settlement = Some(reason.to_string());
    }

    pub async fn fail_next_stake(&self) {
        self.state.lock().await.fail_next_stake = true;
    }

    pub async fn fail_next_unstake(&self) {
        self.state.lock().await.fail_next_unstake = true;
    }

    pub async fn set_read_failure(&self, fail: bool) {
        self.state.lock().await.fail_reads = fail;
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Units applied successfully, in order.
    pub async fn accepted_units(&self) -> Vec<SettlementUnit> {
        self.state.lock().await.accepted.clone()
    }

    /// Settlements handed to [`Ledger::send`], applied or not.
    pub async fn send_count(&self) -> u32 {
        self.state.lock().await.sends
    }

    pub async fn wallet(&self, asset: &str) -> Decimal {
        let raw = self.state.lock().await.balances.wallet.get(asset).copied();
        self.units(asset, raw.unwrap_or(0))
    }

    pub async fn deposited(&self, asset: &str) -> Decimal {
        let raw = self.state.lock().await.balances.deposits.get(asset).copied();
        self.units(asset, raw.unwrap_or(0))
    }

    pub async fn borrowed(&self, asset: &str) -> Decimal {
        let raw = self.state.lock().await.balances.borrows.get(asset).copied();
        self.units(asset, raw.unwrap_or(0))
    }

    fn units(&self, asset: &str, raw: u64) -> Decimal {
        self.reserves
            .get(asset)
            .map_or(Decimal::ZERO, |r| r.from_raw(raw))
    }

    // -----------------------------------------------------------------------
    // Valuation
    // -----------------------------------------------------------------------

    fn value(
        &self,
        prices: &HashMap<String, Decimal>,
        entries: &BTreeMap<String, u64>,
    ) -> Result<Decimal, String> {
        let mut total = Decimal::ZERO;
        for (asset, raw) in entries {
            let price = prices
                .get(asset)
                .ok_or_else(|| format!("no oracle price for {asset}"))?;
            total += self.units(asset, *raw) * price;
        }
        Ok(total)
    }

    /// Deposit-value weighted liquidation threshold.
    fn liquidation_threshold(
        &self,
        prices: &HashMap<String, Decimal>,
        deposits: &BTreeMap<String, u64>,
    ) -> Result<Decimal, String> {
        let total = self.value(prices, deposits)?;
        if total.is_zero() {
            return Ok(Decimal::ZERO);
        }
        let mut weighted = Decimal::ZERO;
        for (asset, raw) in deposits {
            let price = prices.get(asset).copied().unwrap_or_default();
            let lt = self
                .reserves
                .get(asset)
                .map_or(Decimal::ZERO, |r| r.liquidation_threshold);
            weighted += self.units(asset, *raw) * price * lt;
        }
        Ok(weighted / total)
    }

    // -----------------------------------------------------------------------
    // Settlement application
    // -----------------------------------------------------------------------

    /// Apply `unit` to a copy of the balances. The copy replaces the live
    /// balances only when every operation succeeds.
    fn apply(&self, state: &SimState, unit: &SettlementUnit) -> Result<Balances, String> {
        let mut b = state.balances.clone();
        let mut fresh = false;

        for op in &unit.ops {
            if op.is_main() && !fresh {
                return Err(format!(
                    "stale obligation valuation: refresh required before {op:?}"
                ));
            }

            match op {
                LedgerOp::EnsureTokenAccount { asset } => {
                    b.wallet.entry(asset.clone()).or_default();
                }
                LedgerOp::RefreshReserve { asset } => {
                    if !self.reserves.contains_key(asset) {
                        return Err(format!("unknown reserve {asset}"));
                    }
                }
                LedgerOp::RefreshObligation => fresh = true,
                LedgerOp::WrapNative { amount } => {
                    let native = self.native_asset()?;
                    let held = b.wallet.get(native).copied().unwrap_or(0);
                    let raw = match amount {
                        OpAmount::Raw(n) => *n,
                        OpAmount::All => held,
                    };
                    if raw > held {
                        return Err(format!("insufficient native {native} to wrap"));
                    }
                    debit(&mut b.wallet, native, raw);
                    *b.wrapped.entry(native.to_string()).or_default() += raw;
                }
                LedgerOp::UnwrapNative => {
                    for (asset, raw) in std::mem::take(&mut b.wrapped) {
                        *b.wallet.entry(asset).or_default() += raw;
                    }
                }
                LedgerOp::Deposit { asset, amount } => {
                    let source = self.token_account(&mut b, asset);
                    let held = source.get(asset).copied().unwrap_or(0);
                    let raw = match amount {
                        OpAmount::Raw(n) => *n,
                        OpAmount::All => held,
                    };
                    if raw > held {
                        return Err(format!("insufficient {asset} in wallet"));
                    }
                    debit(source, asset, raw);
                    *b.deposits.entry(asset.clone()).or_default() += raw;
                }
                LedgerOp::Withdraw { asset, amount } => {
                    let deposited = b.deposits.get(asset).copied().unwrap_or(0);
                    let raw = match amount {
                        OpAmount::Raw(n) => *n,
                        OpAmount::All => deposited,
                    };
                    if raw > deposited {
                        return Err(format!("withdraw exceeds {asset} deposit"));
                    }
                    debit(&mut b.deposits, asset, raw);
                    *self.token_account(&mut b, asset).entry(asset.clone()).or_default() += raw;

                    let deposit_value = self.value(&state.prices, &b.deposits)?;
                    let borrow_value = self.value(&state.prices, &b.borrows)?;
                    if borrow_value > deposit_value {
                        return Err("withdraw would leave obligation insolvent".into());
                    }
                }
                LedgerOp::Borrow { asset, amount } => {
                    let OpAmount::Raw(raw) = amount else {
                        return Err("borrow requires an exact amount".into());
                    };
                    *b.borrows.entry(asset.clone()).or_default() += raw;
                    *self.token_account(&mut b, asset).entry(asset.clone()).or_default() += raw;

                    let deposit_value = self.value(&state.prices, &b.deposits)?;
                    let borrow_value = self.value(&state.prices, &b.borrows)?;
                    let lt = self.liquidation_threshold(&state.prices, &b.deposits)?;
                    if borrow_value > deposit_value * lt {
                        return Err("borrow exceeds liquidation threshold".into());
                    }
                }
                LedgerOp::Repay { asset, amount } => {
                    let owed = b.borrows.get(asset).copied().unwrap_or(0);
                    let raw = match amount {
                        OpAmount::Raw(n) => (*n).min(owed),
                        OpAmount::All => owed,
                    };
                    let source = self.token_account(&mut b, asset);
                    if raw > source.get(asset).copied().unwrap_or(0) {
                        return Err(format!("insufficient {asset} to repay"));
                    }
                    debit(source, asset, raw);
                    debit(&mut b.borrows, asset, raw);
                }
            }

            if op.is_main() {
                fresh = false;
            }
        }

        Ok(b)
    }

    /// Token account a reserve settles through: the wrapped-native account
    /// for native reserves, the plain wallet otherwise.
    fn token_account<'a>(&self, b: &'a mut Balances, asset: &str) -> &'a mut BTreeMap<String, u64> {
        if self.reserves.get(asset).is_some_and(|r| r.is_native) {
            &mut b.wrapped
        } else {
            &mut b.wallet
        }
    }

    fn native_asset(&self) -> Result<&str, String> {
        self.reserves
            .values()
            .find(|r| r.is_native)
            .map(|r| r.symbol.as_str())
            .ok_or_else(|| "market has no native reserve".to_string())
    }

    fn verify(&self, signed: &SignedSettlement) -> Result<(), LooperError> {
        let bytes = hex::decode(&signed.signature)
            .map_err(|e| LooperError::Ledger(format!("malformed signature: {e}")))?;
        let signature = alloy::primitives::Signature::try_from(bytes.as_slice())
            .map_err(|e| LooperError::Ledger(format!("malformed signature: {e}")))?;
        let digest = settlement_digest(&signed.unit, &signed.token)?;
        let recovered = signature
            .recover_address_from_prehash(&digest)
            .map_err(|e| LooperError::Ledger(format!("signature recovery failed: {e}")))?;
        if recovered.to_string() != signed.signer {
            return Err(LooperError::Ledger("signature does not match signer".into()));
        }
        Ok(())
    }
}

fn debit(map: &mut BTreeMap<String, u64>, asset: &str, raw: u64) {
    if let Some(v) = map.get_mut(asset) {
        *v = v.saturating_sub(raw);
        if *v == 0 {
            map.remove(asset);
        }
    }
}

fn debit_wallet(map: &mut BTreeMap<String, u64>, asset: &str, raw: u64) -> bool {
    match map.get_mut(asset) {
        Some(v) if *v >= raw => {
            *v -= raw;
            true
        }
        _ => false,
    }
}

#[async_trait]
impl Ledger for SimulatedLedger {
    async fn latest_checkpoint(&self) -> Result<FreshnessToken, LooperError> {
        let height = self.state.lock().await.height;
        Ok(FreshnessToken {
            checkpoint: format!("sim-checkpoint-{height}"),
            expiry_height: height + VALIDITY_WINDOW,
        })
    }

    async fn current_height(&self) -> Result<u64, LooperError> {
        Ok(self.state.lock().await.height)
    }

    async fn send(&self, settlement: SignedSettlement) -> Result<SettlementId, LooperError> {
        self.verify(&settlement)?;

        let mut state = self.state.lock().await;
        state.sends += 1;
        state.height += 1;

        let status = if settlement.token.expiry_height < state.height {
            SettlementStatus::Failed {
                reason: "freshness token expired".into(),
            }
        } else if let Some(reason) = state.fail_next_settlement.take() {
            SettlementStatus::Failed { reason }
        } else {
            match self.apply(&state, &settlement.unit) {
                Ok(balances) => {
                    state.balances = balances;
                    state.accepted.push(settlement.unit.clone());
                    SettlementStatus::Confirmed
                }
                Err(reason) => SettlementStatus::Failed { reason },
            }
        };

        let id = state.next_id("sim");
        debug!(settlement_id = %id, label = %settlement.unit.label, ?status, "simulated settlement");

        let mut sequence: VecDeque<Option<SettlementStatus>> =
            (0..state.confirmation_delay).map(|_| None).collect();
        sequence.push_back(Some(status));
        state.statuses.insert(id.clone(), sequence);
        Ok(id)
    }

    async fn status(&self, id: &SettlementId) -> Result<Option<SettlementStatus>, LooperError> {
        let mut state = self.state.lock().await;
        state.height += 1;
        let Some(sequence) = state.statuses.get_mut(id) else {
            return Ok(None);
        };
        if sequence.len() > 1 {
            Ok(sequence.pop_front().flatten())
        } else {
            Ok(sequence.front().cloned().flatten())
        }
    }

    async fn read_obligation(&self, _owner: &str) -> Result<Option<Value>, LooperError> {
        let state = self.state.lock().await;
        if state.fail_reads {
            return Err(LooperError::TransientRead("simulated rpc outage".into()));
        }
        let b = &state.balances;
        if b.deposits.is_empty() && b.borrows.is_empty() {
            return Ok(None);
        }

        let price = |asset: &str| state.prices.get(asset).copied().unwrap_or_default();

        // Deposits keyed by symbol, borrows as an array keyed by reserve
        // address: both shapes occur on the wire.
        let deposits: serde_json::Map<String, Value> = b
            .deposits
            .iter()
            .map(|(asset, raw)| {
                let value = self.units(asset, *raw) * price(asset);
                (
                    asset.clone(),
                    json!({
                        "depositedAmount": raw.to_string(),
                        "marketValueRefreshed": value.to_string(),
                    }),
                )
            })
            .collect();

        let borrows: Vec<Value> = b
            .borrows
            .iter()
            .map(|(asset, raw)| {
                let address = self
                    .reserves
                    .get(asset)
                    .map_or_else(|| asset.clone(), |r| r.address.clone());
                let value = self.units(asset, *raw) * price(asset);
                json!({
                    "mint": address,
                    "borrowedAmount": raw,
                    "marketValue": value.to_string(),
                })
            })
            .collect();

        let deposit_value = self
            .value(&state.prices, &b.deposits)
            .map_err(LooperError::Ledger)?;
        let borrow_value = self
            .value(&state.prices, &b.borrows)
            .map_err(LooperError::Ledger)?;
        let ltv = if deposit_value.is_zero() {
            Decimal::ZERO
        } else {
            borrow_value / deposit_value
        };
        let lt = self
            .liquidation_threshold(&state.prices, &b.deposits)
            .map_err(LooperError::Ledger)?;

        Ok(Some(json!({
            "deposits": deposits,
            "borrows": borrows,
            "stats": {
                "userTotalDeposit": deposit_value.to_string(),
                "userTotalBorrow": borrow_value.to_string(),
                "loanToValue": ltv.to_string(),
                "liquidationLtv": lt.to_string(),
            }
        })))
    }

    async fn wallet_balance(&self, _owner: &str, asset: &str) -> Result<u64, LooperError> {
        Ok(self
            .state
            .lock()
            .await
            .balances
            .wallet
            .get(asset)
            .copied()
            .unwrap_or(0))
    }

    async fn oracle_price(&self, asset: &str) -> Result<Decimal, LooperError> {
        self.state
            .lock()
            .await
            .prices
            .get(asset)
            .copied()
            .ok_or_else(|| LooperError::TransientRead(format!("no oracle price for {asset}")))
    }
}

#[async_trait]
impl StakingConverter for SimulatedLedger {
    async fn stake(&self, amount: Decimal) -> Result<Conversion, LooperError> {
        let from = self.reserve(&self.borrow_asset)?;
        let to = self.reserve(&self.collateral_asset)?;

        let mut state = self.state.lock().await;
        if std::mem::take(&mut state.fail_next_stake) {
            warn!("simulated stake failure");
            return Err(LooperError::Ledger("stake pool rejected deposit".into()));
        }

        let raw_in = from.to_raw(amount);
        if !debit_wallet(&mut state.balances.wallet, &self.borrow_asset, raw_in) {
            return Err(LooperError::Ledger(format!(
                "insufficient {} to stake",
                self.borrow_asset
            )));
        }
        let raw_out = to.to_raw(amount * state.stake_rate);
        *state
            .balances
            .wallet
            .entry(self.collateral_asset.clone())
            .or_default() += raw_out;

        let settlement_id = state.next_id("stake");
        let received = to.from_raw(raw_out);
        info!(%amount, %received, settlement_id = %settlement_id, "simulated stake");
        Ok(Conversion {
            received,
            settlement_id,
        })
    }

    async fn instant_unstake(
        &self,
        amount: Decimal,
        max_slippage: Decimal,
    ) -> Result<Conversion, LooperError> {
        let from = self.reserve(&self.collateral_asset)?;
        let to = self.reserve(&self.borrow_asset)?;

        let mut state = self.state.lock().await;
        if std::mem::take(&mut state.fail_next_unstake) {
            warn!("simulated unstake failure");
            return Err(LooperError::Ledger("instant unstake pool drained".into()));
        }
        if state.stake_rate.is_zero() {
            return Err(LooperError::Ledger("stake rate is zero".into()));
        }

        let raw_in = from.to_raw(amount);
        if !debit_wallet(&mut state.balances.wallet, &self.collateral_asset, raw_in) {
            return Err(LooperError::Ledger(format!(
                "insufficient {} to unstake",
                self.collateral_asset
            )));
        }
        let fair = amount / state.stake_rate;
        let raw_out = to.to_raw(fair * (Decimal::ONE - max_slippage));
        *state
            .balances
            .wallet
            .entry(self.borrow_asset.clone())
            .or_default() += raw_out;

        let settlement_id = state.next_id("unstake");
        let received = to.from_raw(raw_out);
        info!(%amount, %received, settlement_id = %settlement_id, "simulated instant unstake");
        Ok(Conversion {
            received,
            settlement_id,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::execution::composer::tests::reserves;
    use crate::execution::normalize::parse_obligation;
    use crate::execution::wallet::sign_settlement;
    use alloy::signers::local::PrivateKeySigner;
    use rust_decimal_macros::dec;

    pub(crate) async fn market() -> SimulatedLedger {
        let ledger = SimulatedLedger::new(reserves(), "JITOSOL", "SOL");
        ledger.set_price("SOL", dec!(100)).await;
        ledger.set_price("JITOSOL", dec!(110)).await;
        ledger.set_price("USDC", dec!(1)).await;
        ledger.set_stake_rate(dec!(0.9)).await;
        ledger
    }

    async fn signed(ledger: &SimulatedLedger, ops: Vec<LedgerOp>) -> SignedSettlement {
        let token = ledger.latest_checkpoint().await.unwrap();
        sign_settlement(
            &PrivateKeySigner::random(),
            SettlementUnit {
                label: "test".into(),
                ops,
            },
            token,
        )
        .unwrap()
    }

    async fn final_status(ledger: &SimulatedLedger, id: &SettlementId) -> SettlementStatus {
        ledger.status(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_main_op_without_refresh_is_rejected() {
        let ledger = market().await;
        ledger.fund_wallet("SOL", dec!(2)).await.unwrap();
        let s = signed(
            &ledger,
            vec![LedgerOp::Deposit {
                asset: "SOL".into(),
                amount: OpAmount::Raw(1_000_000_000),
            }],
        )
        .await;
        let id = ledger.send(s).await.unwrap();
        assert!(matches!(
            final_status(&ledger, &id).await,
            SettlementStatus::Failed { reason } if reason.contains("stale")
        ));
        assert_eq!(ledger.deposited("SOL").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_second_group_needs_its_own_refresh() {
        let ledger = market().await;
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();
        ledger.seed_borrow("SOL", dec!(1)).await.unwrap();
        ledger.fund_wallet("SOL", dec!(1)).await.unwrap();

        let s = signed(
            &ledger,
            vec![
                LedgerOp::RefreshObligation,
                LedgerOp::Repay {
                    asset: "SOL".into(),
                    amount: OpAmount::All,
                },
                LedgerOp::Withdraw {
                    asset: "JITOSOL".into(),
                    amount: OpAmount::All,
                },
            ],
        )
        .await;
        let id = ledger.send(s).await.unwrap();
        assert!(matches!(
            final_status(&ledger, &id).await,
            SettlementStatus::Failed { .. }
        ));
        // Atomic: the repay did not land either.
        assert_eq!(ledger.borrowed("SOL").await, dec!(1));
    }

    #[tokio::test]
    async fn test_tampered_signature_rejected_on_accept() {
        let ledger = market().await;
        let mut s = signed(&ledger, vec![LedgerOp::RefreshObligation]).await;
        s.token.expiry_height += 1;
        assert!(matches!(ledger.send(s).await, Err(LooperError::Ledger(_))));
        assert_eq!(ledger.send_count().await, 0);
    }

    #[tokio::test]
    async fn test_confirmation_delay_yields_no_status_first() {
        let ledger = market().await;
        ledger.set_confirmation_delay(2).await;
        let id = ledger
            .send(signed(&ledger, vec![LedgerOp::RefreshObligation]).await)
            .await
            .unwrap();
        assert_eq!(ledger.status(&id).await.unwrap(), None);
        assert_eq!(ledger.status(&id).await.unwrap(), None);
        assert_eq!(
            ledger.status(&id).await.unwrap(),
            Some(SettlementStatus::Confirmed)
        );
        assert_eq!(
            ledger.status(&id).await.unwrap(),
            Some(SettlementStatus::Confirmed)
        );
    }

    #[tokio::test]
    async fn test_borrow_beyond_liquidation_threshold_fails() {
        let ledger = market().await;
        ledger.seed_deposit("JITOSOL", dec!(1)).await.unwrap();
        // $110 collateral at 0.75 threshold supports at most $82.50.
        let s = signed(
            &ledger,
            vec![
                LedgerOp::RefreshObligation,
                LedgerOp::Borrow {
                    asset: "SOL".into(),
                    amount: OpAmount::Raw(900_000_000),
                },
            ],
        )
        .await;
        let id = ledger.send(s).await.unwrap();
        assert!(matches!(
            final_status(&ledger, &id).await,
            SettlementStatus::Failed { .. }
        ));
        assert_eq!(ledger.wallet("SOL").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_native_repay_needs_wrapped_balance() {
        let ledger = market().await;
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();
        ledger.seed_borrow("SOL", dec!(2)).await.unwrap();
        ledger.fund_wallet("SOL", dec!(3)).await.unwrap();

        let repay = LedgerOp::Repay {
            asset: "SOL".into(),
            amount: OpAmount::All,
        };
        let unwrapped = signed(&ledger, vec![LedgerOp::RefreshObligation, repay.clone()]).await;
        let id = ledger.send(unwrapped).await.unwrap();
        assert!(matches!(
            final_status(&ledger, &id).await,
            SettlementStatus::Failed { reason } if reason.contains("insufficient SOL")
        ));

        let wrapped = signed(
            &ledger,
            vec![
                LedgerOp::WrapNative {
                    amount: OpAmount::All,
                },
                LedgerOp::RefreshObligation,
                repay,
                LedgerOp::UnwrapNative,
            ],
        )
        .await;
        let id = ledger.send(wrapped).await.unwrap();
        assert_eq!(final_status(&ledger, &id).await, SettlementStatus::Confirmed);
        assert_eq!(ledger.borrowed("SOL").await, Decimal::ZERO);
        // Remainder comes back out of the wrapped account.
        assert_eq!(ledger.wallet("SOL").await, dec!(1));
    }

    #[tokio::test]
    async fn test_native_borrow_stays_wrapped_without_unwrap() {
        let ledger = market().await;
        ledger.seed_deposit("JITOSOL", dec!(10)).await.unwrap();
        let s = signed(
            &ledger,
            vec![
                LedgerOp::RefreshObligation,
                LedgerOp::Borrow {
                    asset: "SOL".into(),
                    amount: OpAmount::Raw(1_000_000_000),
                },
            ],
        )
        .await;
        let id = ledger.send(s).await.unwrap();
        assert_eq!(final_status(&ledger, &id).await, SettlementStatus::Confirmed);
        assert_eq!(ledger.borrowed("SOL").await, dec!(1));
        assert_eq!(ledger.wallet("SOL").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_stake_and_unstake_rates() {
        let ledger = market().await;
        ledger.fund_wallet("SOL", dec!(10)).await.unwrap();
        let staked = ledger.stake(dec!(10)).await.unwrap();
        assert_eq!(staked.received, dec!(9));
        assert_eq!(ledger.wallet("JITOSOL").await, dec!(9));

        let unstaked = ledger.instant_unstake(dec!(9), dec!(0.001)).await.unwrap();
        assert_eq!(unstaked.received, dec!(9.99));
    }

    #[tokio::test]
    async fn test_scripted_stake_failure_is_one_shot() {
        let ledger = market().await;
        ledger.fund_wallet("SOL", dec!(2)).await.unwrap();
        ledger.fail_next_stake().await;
        assert!(ledger.stake(dec!(1)).await.is_err());
        assert_eq!(ledger.wallet("SOL").await, dec!(2));
        assert!(ledger.stake(dec!(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_obligation_json_round_trips_through_normalizer() {
        let ledger = market().await;
        ledger.seed_deposit("JITOSOL", dec!(2)).await.unwrap();
        ledger.seed_borrow("SOL", dec!(1)).await.unwrap();

        let raw = ledger.read_obligation("owner").await.unwrap().unwrap();
        let ob = parse_obligation(&raw).unwrap();
        assert_eq!(ob.deposits[0].reserve, "JITOSOL");
        assert_eq!(ob.borrows[0].reserve, "SOL-reserve");
        let agg = ob.aggregate.unwrap();
        assert_eq!(agg.deposit_value, dec!(220));
        assert_eq!(agg.borrow_value, dec!(100));
    }

    #[tokio::test]
    async fn test_no_obligation_reads_none() {
        let ledger = market().await;
        assert!(ledger.read_obligation("owner").await.unwrap().is_none());
    }
}
