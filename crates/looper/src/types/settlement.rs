use std::fmt;

use serde::{Deserialize, Serialize};

/// Amount carried by a ledger operation, in raw integer units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpAmount {
    Raw(u64),
    /// Everything available on that leg (full withdraw / full repay).
    All,
}

/// A single operation inside a settlement unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerOp {
    /// Idempotent: create the wallet's token account for `asset` if missing.
    EnsureTokenAccount { asset: String },
    RefreshReserve { asset: String },
    RefreshObligation,
    Deposit { asset: String, amount: OpAmount },
    Withdraw { asset: String, amount: OpAmount },
    Borrow { asset: String, amount: OpAmount },
    Repay { asset: String, amount: OpAmount },
    /// Move native balance into the wrapped-native token account. `All`
    /// wraps the whole native balance.
    WrapNative { amount: OpAmount },
    /// Close the wrapped-native token account back into the wallet.
    UnwrapNative,
}

impl LedgerOp {
    /// Operations that move funds against the obligation.
    pub fn is_main(&self) -> bool {
        matches!(
            self,
            Self::Deposit { .. } | Self::Withdraw { .. } | Self::Borrow { .. } | Self::Repay { .. }
        )
    }
}

/// Ordered, single-use bundle of operations representing one atomic intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementUnit {
    pub label: String,
    pub ops: Vec<LedgerOp>,
}

impl SettlementUnit {
    pub fn main_ops(&self) -> impl Iterator<Item = &LedgerOp> {
        self.ops.iter().filter(|op| op.is_main())
    }
}

/// Recent ledger checkpoint plus the height after which a signed submission
/// referencing it is no longer valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessToken {
    pub checkpoint: String,
    pub expiry_height: u64,
}

/// Identifier assigned by the ledger on accept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SettlementId(pub String);

impl SettlementId {
    /// Placeholder id for dry-run synthetic results.
    pub fn dry_run() -> Self {
        Self("dry-run".into())
    }
}

impl fmt::Display for SettlementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Signed unit ready to hand to the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedSettlement {
    pub unit: SettlementUnit,
    pub token: FreshnessToken,
    pub signer: String,
    /// Hex-encoded 65-byte signature over the settlement digest.
    pub signature: String,
}

/// Status reported by the ledger for a submitted settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SettlementStatus {
    /// Seen by the ledger but not yet confirmed.
    Processed,
    Confirmed,
    Finalized,
    Failed { reason: String },
}

/// A submitted settlement awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSettlement {
    pub id: SettlementId,
    pub token: FreshnessToken,
}

/// Terminal success: a confirmed or finalized status was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub id: SettlementId,
    pub finalized: bool,
    pub attempts: u32,
}
