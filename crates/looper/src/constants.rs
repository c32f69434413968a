use rust_decimal::Decimal;
use rust_decimal_macros::dec;

// ---------------------------------------------------------------------------
// Risk limits
// ---------------------------------------------------------------------------

/// Protocol-risk-independent LTV ceiling. Positions above it are unsafe no
/// matter how the borrow caps are configured.
pub const HARD_LTV_CEILING: Decimal = dec!(0.70);

/// Fraction of the effective cap above which a position is classed `Watch`.
pub const WATCH_RATIO: Decimal = dec!(0.90);

/// Health factor reported when there is no debt.
pub const MAX_HEALTH_FACTOR: Decimal = Decimal::MAX;

// ---------------------------------------------------------------------------
// Confirmation polling
// ---------------------------------------------------------------------------

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_500;
pub const DEFAULT_MAX_CONFIRM_ATTEMPTS: u32 = 30;

// ---------------------------------------------------------------------------
// Loop / unwind policy defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_MAX_LOOPS: u32 = 3;
pub const DEFAULT_HEADROOM_HAIRCUT: Decimal = dec!(0.90);
pub const DEFAULT_CONVERGENCE_TOLERANCE: Decimal = dec!(0.95);

pub const DEFAULT_UNWIND_ITERATIONS: u32 = 6;
pub const DEFAULT_WITHDRAW_FRACTION: Decimal = dec!(0.40);
pub const DEFAULT_UNSTAKE_SLIPPAGE: Decimal = dec!(0.001);

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Conservative rates `(symbol, supply_apy, borrow_apy)` used when neither the
/// metrics API nor the configured fallback table covers an asset.
pub const FALLBACK_RATES: &[(&str, Decimal, Decimal)] = &[
    ("SOL", dec!(0.02), dec!(0.10)),
    ("JITOSOL", dec!(0.0), dec!(0.03)),
    ("MSOL", dec!(0.0), dec!(0.03)),
    ("USDC", dec!(0.03), dec!(0.12)),
    ("USDT", dec!(0.03), dec!(0.12)),
];

/// Borrow APY assumed for an asset with no known rate at all.
pub const UNKNOWN_ASSET_BORROW_APY: Decimal = dec!(0.15);
