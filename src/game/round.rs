//! Round Definitions
//!
//! Identity types, the round phase machine, and the multiplier curve.

use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::core::money::{Multiplier, MULTIPLIER_SCALE};

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Monotonic round number. Round 1 is the first round after startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoundId(pub u64);

impl RoundId {
    /// The first round.
    pub const FIRST: RoundId = RoundId(1);

    /// The round after this one.
    pub fn next(self) -> RoundId {
        RoundId(self.0 + 1)
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Account / player identifier (UUID).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub uuid::Uuid);

impl UserId {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes))
    }

    /// Parse from a UUID string.
    pub fn parse(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(Self)
    }

    /// Fresh random id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.as_bytes()[..4])
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Bet identity: one bet per user per round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BetId {
    /// Round the bet belongs to.
    pub round_id: RoundId,
    /// Bettor.
    pub user_id: UserId,
}

impl fmt::Display for BetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.round_id.0, self.user_id)
    }
}

// =============================================================================
// PHASE
// =============================================================================

/// Round lifecycle stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Betting window open; multiplier not yet running.
    Waiting,
    /// Multiplier climbing; cash-outs accepted.
    Running,
    /// Crash reached; no further mutation of bets.
    Crashed,
}

impl RoundPhase {
    /// Whether `next` is the single legal successor of this phase.
    pub fn can_advance_to(self, next: RoundPhase) -> bool {
        matches!(
            (self, next),
            (RoundPhase::Waiting, RoundPhase::Running) | (RoundPhase::Running, RoundPhase::Crashed)
        )
    }
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoundPhase::Waiting => "waiting",
            RoundPhase::Running => "running",
            RoundPhase::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

// =============================================================================
// MULTIPLIER CURVE
// =============================================================================

/// Pure mapping from elapsed running time to the displayed multiplier.
///
/// `multiplier(t) = 1.00 + floor(t / step_ms) * step`
///
/// Every reader computes the same value for the same elapsed time, so no lock
/// is needed to agree on the multiplier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiplierCurve {
    /// Milliseconds per step.
    pub step_ms: u64,
    /// Hundredths added per step.
    pub step_hundredths: u32,
}

impl Default for MultiplierCurve {
    fn default() -> Self {
        Self {
            step_ms: 100,
            step_hundredths: 10, // +0.10x every 100ms
        }
    }
}

impl MultiplierCurve {
    /// Multiplier after `elapsed_ms` of running time.
    pub fn multiplier_at(&self, elapsed_ms: u64) -> Multiplier {
        let steps = elapsed_ms / self.step_ms.max(1);
        let gained = steps.saturating_mul(self.step_hundredths as u64);
        let total = (MULTIPLIER_SCALE as u64).saturating_add(gained);
        Multiplier::from_hundredths(total.min(u32::MAX as u64) as u32)
    }

    /// Earliest elapsed time at which the curve reaches `target`.
    ///
    /// This is the crash instant for a round whose crash point is `target`.
    /// Every elapsed time strictly below it yields a multiplier below `target`.
    pub fn time_to_reach(&self, target: Multiplier) -> u64 {
        let above_one = target.hundredths().saturating_sub(MULTIPLIER_SCALE) as u64;
        let step = self.step_hundredths.max(1) as u64;
        let steps = above_one.div_ceil(step);
        steps.saturating_mul(self.step_ms.max(1))
    }
}

// =============================================================================
// ROUND
// =============================================================================

/// One round. Mutated only through the engine's transition methods.
#[derive(Clone, Debug)]
pub struct Round {
    /// Round number.
    pub id: RoundId,
    crash_point: Multiplier,
    /// Current phase.
    pub phase: RoundPhase,
    /// Wall time the round was opened.
    pub created_at: DateTime<Utc>,
    /// Wall time the multiplier started.
    pub started_at: Option<DateTime<Utc>>,
    /// Clock reading when the multiplier started.
    pub started_at_ms: Option<u64>,
    /// Wall time of the crash.
    pub ended_at: Option<DateTime<Utc>>,
    /// Elapsed running time at which the round crashes.
    pub crash_elapsed_ms: u64,
}

impl Round {
    /// Open a round in WAITING with its crash point fixed.
    pub fn new(id: RoundId, crash_point: Multiplier, curve: &MultiplierCurve) -> Self {
        Self {
            id,
            crash_point,
            phase: RoundPhase::Waiting,
            created_at: Utc::now(),
            started_at: None,
            started_at_ms: None,
            ended_at: None,
            crash_elapsed_ms: curve.time_to_reach(crash_point),
        }
    }

    /// The crash point. Callers outside the engine only see it once crashed.
    pub fn crash_point(&self) -> Multiplier {
        self.crash_point
    }

    /// Crash point if the round has already crashed.
    pub fn revealed_crash_point(&self) -> Option<Multiplier> {
        (self.phase == RoundPhase::Crashed).then_some(self.crash_point)
    }

    /// Elapsed running time at `now_ms`, if running or crashed.
    pub fn elapsed_ms(&self, now_ms: u64) -> Option<u64> {
        self.started_at_ms.map(|start| now_ms.saturating_sub(start))
    }

    /// Whether the crash instant has been reached at `now_ms`.
    pub fn crash_reached(&self, now_ms: u64) -> bool {
        match self.elapsed_ms(now_ms) {
            Some(elapsed) => elapsed >= self.crash_elapsed_ms,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn m(h: u32) -> Multiplier {
        Multiplier::from_hundredths(h)
    }

    #[test]
    fn test_curve_starts_at_one() {
        let curve = MultiplierCurve::default();
        assert_eq!(curve.multiplier_at(0), Multiplier::ONE);
        assert_eq!(curve.multiplier_at(99), Multiplier::ONE);
        assert_eq!(curve.multiplier_at(100), m(110));
        assert_eq!(curve.multiplier_at(1000), m(200));
    }

    #[test]
    fn test_time_to_reach() {
        let curve = MultiplierCurve::default();
        assert_eq!(curve.time_to_reach(Multiplier::ONE), 0);
        assert_eq!(curve.time_to_reach(m(200)), 1000);
        assert_eq!(curve.time_to_reach(m(250)), 1500);
        // 2.55 is not on the grid: the curve first reaches it at 2.60
        assert_eq!(curve.time_to_reach(m(255)), 1600);
    }

    #[test]
    fn test_phase_transitions() {
        assert!(RoundPhase::Waiting.can_advance_to(RoundPhase::Running));
        assert!(RoundPhase::Running.can_advance_to(RoundPhase::Crashed));
        assert!(!RoundPhase::Waiting.can_advance_to(RoundPhase::Crashed));
        assert!(!RoundPhase::Crashed.can_advance_to(RoundPhase::Waiting));
        assert!(!RoundPhase::Running.can_advance_to(RoundPhase::Running));
    }

    #[test]
    fn test_round_hides_crash_point_until_crashed() {
        let curve = MultiplierCurve::default();
        let mut round = Round::new(RoundId::FIRST, m(250), &curve);
        assert_eq!(round.revealed_crash_point(), None);
        assert_eq!(round.crash_elapsed_ms, 1500);

        round.phase = RoundPhase::Crashed;
        assert_eq!(round.revealed_crash_point(), Some(m(250)));
    }

    #[test]
    fn test_crash_reached() {
        let curve = MultiplierCurve::default();
        let mut round = Round::new(RoundId(3), m(200), &curve);
        assert!(!round.crash_reached(10_000));

        round.started_at_ms = Some(500);
        assert!(!round.crash_reached(1499));
        assert!(round.crash_reached(1500));
    }

    #[test]
    fn test_user_id_roundtrip() {
        let id = UserId::random();
        assert_eq!(UserId::parse(&id.to_string()), Some(id));
        assert_eq!(UserId::parse("not-a-uuid"), None);
    }

    proptest! {
        #[test]
        fn prop_curve_monotonic(a in 0u64..10_000_000, b in 0u64..10_000_000) {
            let curve = MultiplierCurve::default();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(curve.multiplier_at(lo) <= curve.multiplier_at(hi));
        }

        #[test]
        fn prop_crash_instant_is_tight(
            crash in 100u32..5_000,
            step_ms in 1u64..500,
            step_hundredths in 1u32..50,
        ) {
            let curve = MultiplierCurve { step_ms, step_hundredths };
            let target = m(crash);
            let t = curve.time_to_reach(target);

            prop_assert!(curve.multiplier_at(t) >= target);
            if t > 0 {
                prop_assert!(curve.multiplier_at(t - 1) < target);
            }
        }
    }
}
