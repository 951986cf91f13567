//! # Fixed-Point Amounts
//!
//! Every value that moves through the engine is held as [`Lamports`], an
//! integer count of the ledger's smallest unit (10⁻⁹ of the native unit).
//! Floats only appear at the HTTP edge, where [`Lamports::from_sol`] and
//! [`Lamports::as_sol`] convert.
//!
//! ## Rounding
//!
//! | Operation | Rounding |
//! |-----------|----------|
//! | `from_sol` | half away from zero |
//! | `apply_bps` | half away from zero |
//! | `deduct_fee_bps` | fee floored, so payouts never exceed the pool |
//!
//! All intermediate products use `u128`.

use std::fmt;
use std::iter::Sum;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest units per native unit.
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Denominator for basis-point arithmetic.
pub const BPS_DENOMINATOR: u64 = 10_000;

// ════════════════════════════════════════════════════════════════════════════
// ERROR
// ════════════════════════════════════════════════════════════════════════════

/// Conversion failures from floating-point native units.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AmountError {
    #[error("amount is not a finite number")]
    NotFinite,

    #[error("amount {0} is negative")]
    Negative(f64),

    #[error("amount {0} exceeds the representable range")]
    Overflow(f64),
}

// ════════════════════════════════════════════════════════════════════════════
// LAMPORTS
// ════════════════════════════════════════════════════════════════════════════

/// Integer amount in the ledger's smallest unit.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lamports(pub u64);

impl Lamports {
    pub const ZERO: Lamports = Lamports(0);

    /// Converts a native-unit float, rounding half away from zero.
    pub fn from_sol(sol: f64) -> Result<Self, AmountError> {
        if !sol.is_finite() {
            return Err(AmountError::NotFinite);
        }
        if sol < 0.0 {
            return Err(AmountError::Negative(sol));
        }
        let scaled = (sol * LAMPORTS_PER_SOL as f64).round();
        if scaled > u64::MAX as f64 {
            return Err(AmountError::Overflow(sol));
        }
        Ok(Lamports(scaled as u64))
    }

    /// Native-unit float for display and JSON responses.
    pub fn as_sol(self) -> f64 {
        self.0 as f64 / LAMPORTS_PER_SOL as f64
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Multiplies by `bps / 10_000`, rounding half away from zero.
    ///
    /// Saturates at `u64::MAX` rather than wrapping.
    pub fn apply_bps(self, bps: u32) -> Lamports {
        let product = self.0 as u128 * bps as u128;
        let denom = BPS_DENOMINATOR as u128;
        let rounded = (product + denom / 2) / denom;
        Lamports(u64::try_from(rounded).unwrap_or(u64::MAX))
    }

    /// Returns the amount left after withholding a `bps` fee.
    ///
    /// The fee is floored, so the result is never more than the pool.
    pub fn deduct_fee_bps(self, bps: u32) -> Lamports {
        let bps = (bps as u128).min(BPS_DENOMINATOR as u128);
        let fee = self.0 as u128 * bps / BPS_DENOMINATOR as u128;
        Lamports(self.0 - fee as u64)
    }

    pub fn abs_diff(self, other: Lamports) -> Lamports {
        Lamports(self.0.abs_diff(other.0))
    }

    pub fn checked_add(self, other: Lamports) -> Option<Lamports> {
        self.0.checked_add(other.0).map(Lamports)
    }

    pub fn saturating_add(self, other: Lamports) -> Lamports {
        Lamports(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for Lamports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:09}",
            self.0 / LAMPORTS_PER_SOL,
            self.0 % LAMPORTS_PER_SOL
        )
    }
}

impl From<u64> for Lamports {
    fn from(v: u64) -> Self {
        Lamports(v)
    }
}

impl Sum for Lamports {
    fn sum<I: Iterator<Item = Lamports>>(iter: I) -> Self {
        iter.fold(Lamports::ZERO, Lamports::saturating_add)
    }
}

impl<'a> Sum<&'a Lamports> for Lamports {
    fn sum<I: Iterator<Item = &'a Lamports>>(iter: I) -> Self {
        iter.copied().sum()
    }
}
