//! Crash-Point Generation
//!
//! A crash point is drawn once per round, before any bet exists, and never
//! sees bet volume or player identity. The scheduler only depends on the
//! [`CrashPointGenerator`] trait; the distribution is a replaceable policy.

use std::collections::VecDeque;
use std::sync::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use thiserror::Error;

use crate::core::money::Multiplier;
use crate::core::rng::RoundRng;

/// Crash-point generation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeneratorError {
    /// Generator could not produce a value right now; retry later.
    #[error("crash point generator unavailable: {0}")]
    Unavailable(String),
}

/// Source of crash points.
pub trait CrashPointGenerator: Send + Sync {
    /// Draw the next crash point (≥ 1.00, two-decimal precision).
    fn draw(&self) -> Result<Multiplier, GeneratorError>;
}

// =============================================================================
// TIERED POLICY
// =============================================================================

/// Total weight of a tier table (basis points).
pub const TIER_WEIGHT_TOTAL: u32 = 10_000;

/// One slice of the outcome space, drawn uniformly in `[low, high]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CrashTier {
    /// Share of outcomes in basis points.
    pub weight: u32,
    /// Lowest crash point in this tier (inclusive).
    pub low: Multiplier,
    /// Highest crash point in this tier (inclusive).
    pub high: Multiplier,
}

impl CrashTier {
    /// Tier from a weight and inclusive bounds in hundredths.
    pub const fn new(weight: u32, low: u32, high: u32) -> Self {
        Self {
            weight,
            low: Multiplier::from_hundredths(low),
            high: Multiplier::from_hundredths(high),
        }
    }
}

/// Reference distribution:
/// 50% instant crash, 30% (1.00, 2.00], 15% (2.00, 5.00], 5% (5.00, 15.00].
pub const DEFAULT_TIERS: [CrashTier; 4] = [
    CrashTier::new(5_000, 100, 100),
    CrashTier::new(3_000, 101, 200),
    CrashTier::new(1_500, 201, 500),
    CrashTier::new(500, 501, 1_500),
];

/// Tier table rejected at construction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TierError {
    /// No tiers, or all weights zero.
    #[error("tier table has no weight")]
    Empty,
    /// Tier bounds inverted or below 1.00x.
    #[error("tier {index} has invalid bounds")]
    InvalidBounds {
        /// Offending tier.
        index: usize,
    },
    /// Tier table text could not be parsed.
    #[error("cannot parse tier {0:?}, expected weight:low-high")]
    Parse(String),
}

/// Parse a tier table such as `5000:100-100,3000:101-200`.
///
/// Bounds are hundredths. The result still goes through
/// [`TieredCrashPolicy::new`] for validation.
pub fn parse_tiers(text: &str) -> Result<Vec<CrashTier>, TierError> {
    text.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let bad = || TierError::Parse(part.to_string());
            let (weight, range) = part.split_once(':').ok_or_else(bad)?;
            let (low, high) = range.split_once('-').ok_or_else(bad)?;
            Ok(CrashTier::new(
                weight.trim().parse().map_err(|_| bad())?,
                low.trim().parse().map_err(|_| bad())?,
                high.trim().parse().map_err(|_| bad())?,
            ))
        })
        .collect()
}

/// Weighted-tier crash policy.
///
/// Live rounds use [`TieredCrashPolicy::from_entropy`] or
/// [`TieredCrashPolicy::with_tiers`], backed by `StdRng` (ChaCha, seeded from
/// the OS). Seeded [`RoundRng`] policies exist for replays and tests only.
pub struct TieredCrashPolicy<R = StdRng> {
    tiers: Vec<CrashTier>,
    total_weight: u64,
    rng: Mutex<R>,
}

impl<R: RngCore> TieredCrashPolicy<R> {
    /// Build a policy from a tier table and RNG.
    pub fn new(tiers: Vec<CrashTier>, rng: R) -> Result<Self, TierError> {
        for (index, tier) in tiers.iter().enumerate() {
            if tier.low < Multiplier::ONE || tier.low > tier.high {
                return Err(TierError::InvalidBounds { index });
            }
        }

        let total_weight: u64 = tiers.iter().map(|t| t.weight as u64).sum();
        if total_weight == 0 {
            return Err(TierError::Empty);
        }

        Ok(Self {
            tiers,
            total_weight,
            rng: Mutex::new(rng),
        })
    }

    /// Tier table in use.
    pub fn tiers(&self) -> &[CrashTier] {
        &self.tiers
    }
}

impl TieredCrashPolicy<StdRng> {
    /// Reference tiers on a CSPRNG seeded from the OS.
    pub fn from_entropy() -> Self {
        Self {
            tiers: DEFAULT_TIERS.to_vec(),
            total_weight: TIER_WEIGHT_TOTAL as u64,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Custom tiers on a CSPRNG seeded from the OS.
    pub fn with_tiers(tiers: Vec<CrashTier>) -> Result<Self, TierError> {
        Self::new(tiers, StdRng::from_entropy())
    }
}

impl TieredCrashPolicy<RoundRng> {
    /// Reference tiers replayed from an explicit seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            tiers: DEFAULT_TIERS.to_vec(),
            total_weight: TIER_WEIGHT_TOTAL as u64,
            rng: Mutex::new(RoundRng::new(seed)),
        }
    }
}

impl<R: RngCore + Send> CrashPointGenerator for TieredCrashPolicy<R> {
    fn draw(&self) -> Result<Multiplier, GeneratorError> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| GeneratorError::Unavailable("rng lock poisoned".into()))?;

        let mut roll = rng.gen_range(0..self.total_weight);
        for tier in &self.tiers {
            let weight = tier.weight as u64;
            if roll < weight {
                let value = rng.gen_range(tier.low.hundredths()..=tier.high.hundredths());
                return Ok(Multiplier::from_hundredths(value));
            }
            roll -= weight;
        }

        Err(GeneratorError::Unavailable("tier table exhausted".into()))
    }
}

// =============================================================================
// FIXED SEQUENCE
// =============================================================================

/// Replays a preset list of outcomes. Used in tests and replays.
///
/// `Err` entries simulate an outage; an exhausted sequence is an outage too.
pub struct SequenceGenerator {
    outcomes: Mutex<VecDeque<Result<Multiplier, GeneratorError>>>,
}

impl SequenceGenerator {
    /// Generator that yields the given crash points in order.
    pub fn new(points: impl IntoIterator<Item = Multiplier>) -> Self {
        Self::with_outcomes(points.into_iter().map(Ok))
    }

    /// Generator with explicit successes and failures.
    pub fn with_outcomes(
        outcomes: impl IntoIterator<Item = Result<Multiplier, GeneratorError>>,
    ) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
        }
    }
}

impl CrashPointGenerator for SequenceGenerator {
    fn draw(&self) -> Result<Multiplier, GeneratorError> {
        let mut outcomes = self
            .outcomes
            .lock()
            .map_err(|_| GeneratorError::Unavailable("sequence lock poisoned".into()))?;
        outcomes
            .pop_front()
            .unwrap_or_else(|| Err(GeneratorError::Unavailable("sequence exhausted".into())))
    }
}
