//! Fixed-Point Money and Multipliers
//!
//! All balances, stakes and payouts are integer minor units (cents).
//! Multipliers are fixed-point hundredths, so `250` means 2.50x.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Amount      u64   minor units      1050  = 10.50           │
//! │  Multiplier  u32   hundredths       250   = 2.50x           │
//! │                                                             │
//! │  payout = floor(amount * multiplier / 100)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Crash points, cash-out multipliers and the multiplier curve all share the
//! same two-decimal precision, so comparisons never depend on float rounding.

use std::fmt;
use serde::{Serialize, Deserialize};

/// Currency amount in minor units (cents).
pub type Amount = u64;

/// Minor units per whole currency unit.
pub const MINOR_UNITS: Amount = 100;

/// Multiplier scale: 1.00x is stored as 100.
pub const MULTIPLIER_SCALE: u32 = 100;

/// Fixed-point multiplier in hundredths (2.50x = 250).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Multiplier(u32);

impl Multiplier {
    /// 1.00x, the floor of every round.
    pub const ONE: Multiplier = Multiplier(MULTIPLIER_SCALE);

    /// Create from raw hundredths.
    pub const fn from_hundredths(hundredths: u32) -> Self {
        Self(hundredths)
    }

    /// Raw hundredths.
    pub const fn hundredths(self) -> u32 {
        self.0
    }

    /// Amount paid for `stake` cashed out at this multiplier.
    ///
    /// Principal included. Returns `None` on overflow.
    pub fn payout(self, stake: Amount) -> Option<Amount> {
        let product = (stake as u128).checked_mul(self.0 as u128)?;
        Amount::try_from(product / MULTIPLIER_SCALE as u128).ok()
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}x", self.0 / MULTIPLIER_SCALE, self.0 % MULTIPLIER_SCALE)
    }
}

/// Format an amount as `units.cents`.
pub fn format_amount(amount: Amount) -> String {
    format!("{}.{:02}", amount / MINOR_UNITS, amount % MINOR_UNITS)
}
