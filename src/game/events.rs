//! Round Events
//!
//! Broadcast by the engine and scheduler; forwarded to clients by the
//! network layer. The crash point appears only in [`RoundEvent::RoundEnded`].

use serde::{Serialize, Deserialize};

use crate::core::money::{Amount, Multiplier};
use crate::game::round::{RoundId, UserId};

/// Totals announced with the end of a round.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSummary {
    /// Bets placed.
    pub bets: u32,
    /// Winning bets.
    pub won: u32,
    /// Losing bets.
    pub lost: u32,
    /// Bets whose payout is still pending after retries.
    pub unsettled: u32,
    /// Sum of stakes.
    pub total_staked: Amount,
    /// Sum of payouts.
    pub total_paid: Amount,
}

/// Lifecycle and player events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RoundEvent {
    /// New round open for bets.
    RoundCreated {
        /// Round number.
        round_id: RoundId,
        /// Betting window length.
        betting_window_ms: u64,
    },

    /// Multiplier started climbing.
    RoundStarted {
        /// Round number.
        round_id: RoundId,
    },

    /// Periodic multiplier update for live display.
    MultiplierTick {
        /// Round number.
        round_id: RoundId,
        /// Running time.
        elapsed_ms: u64,
        /// Multiplier at `elapsed_ms`.
        multiplier: Multiplier,
    },

    /// A bet was accepted.
    BetPlaced {
        /// Round number.
        round_id: RoundId,
        /// Bettor.
        user_id: UserId,
        /// Stake.
        amount: Amount,
    },

    /// A cash-out was accepted.
    CashedOut {
        /// Round number.
        round_id: RoundId,
        /// Bettor.
        user_id: UserId,
        /// Locked-in multiplier.
        multiplier: Multiplier,
    },

    /// Round crashed and was settled. First event carrying the crash point.
    RoundEnded {
        /// Round number.
        round_id: RoundId,
        /// Crash point.
        crash_point: Multiplier,
        /// Settlement totals.
        summary: RoundSummary,
    },
}

impl RoundEvent {
    /// Round the event belongs to.
    pub fn round_id(&self) -> RoundId {
        match self {
            RoundEvent::RoundCreated { round_id, .. }
            | RoundEvent::RoundStarted { round_id }
            | RoundEvent::MultiplierTick { round_id, .. }
            | RoundEvent::BetPlaced { round_id, .. }
            | RoundEvent::CashedOut { round_id, .. }
            | RoundEvent::RoundEnded { round_id, .. } => *round_id,
        }
    }
}
