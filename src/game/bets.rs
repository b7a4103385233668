//! Bet Registry
//!
//! Per-round bets keyed by user. Placement inserts under the map lock together
//! with the ledger debit; cash-out only locks the one bet it touches.

use std::collections::BTreeMap;
use std::sync::Arc;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::core::money::{Amount, Multiplier};
use crate::game::ledger::{EntryRef, Ledger, LedgerError};
use crate::game::round::{BetId, RoundId, UserId};

/// User-facing bet errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BetError {
    /// Operation attempted outside its valid phase (or for a stale round).
    #[error("wrong phase for this action")]
    WrongPhase,
    /// User already has a bet in this round.
    #[error("bet already placed this round")]
    DuplicateBet,
    /// No bet, or bet already cashed out.
    #[error("no active bet")]
    NoActiveBet,
    /// Balance below the stake.
    #[error("insufficient funds")]
    InsufficientFunds,
    /// Stake outside the configured limits.
    #[error("bet must be between {min} and {max}")]
    BetOutOfRange {
        /// Smallest accepted stake.
        min: Amount,
        /// Largest accepted stake.
        max: Amount,
    },
    /// Account frozen.
    #[error("account frozen")]
    AccountFrozen,
    /// No ledger account for this user.
    #[error("unknown account")]
    UnknownAccount,
}

impl From<LedgerError> for BetError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds { .. } => BetError::InsufficientFunds,
            LedgerError::Frozen(_) => BetError::AccountFrozen,
            LedgerError::UnknownAccount(_) => BetError::UnknownAccount,
            // Debits never overflow; zero stakes are rejected before the ledger
            LedgerError::Overflow | LedgerError::ZeroAmount => BetError::InsufficientFunds,
        }
    }
}

/// Locked-in cash-out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashOut {
    /// Multiplier at the moment of the request.
    pub multiplier: Multiplier,
    /// Running time at the moment of the request.
    pub elapsed_ms: u64,
}

/// Settlement result for one bet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BetOutcome {
    /// Cashed out at or below the crash point.
    Won {
        /// Amount credited (principal included).
        payout: Amount,
    },
    /// No cash-out, or cashed out above the crash point.
    Lost,
}

/// Player-facing status of a bet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    /// Placed, round not running yet.
    Betting,
    /// Round running, not cashed out.
    Playing,
    /// Cashed out, not settled yet.
    CashedOut,
    /// Settled as a win.
    Won,
    /// Settled as a loss.
    Lost,
}

/// A bet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bet {
    /// Identity.
    pub id: BetId,
    /// Stake in minor units, debited at placement.
    pub amount: Amount,
    /// Clock reading at placement.
    pub placed_at_ms: u64,
    /// Set at most once.
    pub cash_out: Option<CashOut>,
    /// Set once by settlement.
    pub outcome: Option<BetOutcome>,
}

impl Bet {
    /// Status given whether the round is running yet.
    pub fn status(&self, running: bool) -> BetStatus {
        match (self.outcome, self.cash_out) {
            (Some(BetOutcome::Won { .. }), _) => BetStatus::Won,
            (Some(BetOutcome::Lost), _) => BetStatus::Lost,
            (None, Some(_)) => BetStatus::CashedOut,
            (None, None) if running => BetStatus::Playing,
            (None, None) => BetStatus::Betting,
        }
    }
}

/// Bets of one round.
pub struct BetRegistry {
    round_id: RoundId,
    bets: RwLock<BTreeMap<UserId, Arc<Mutex<Bet>>>>,
}

impl BetRegistry {
    /// Empty registry for a round.
    pub fn new(round_id: RoundId) -> Self {
        Self {
            round_id,
            bets: RwLock::new(BTreeMap::new()),
        }
    }

    /// Round this registry belongs to.
    pub fn round_id(&self) -> RoundId {
        self.round_id
    }

    /// Debit the stake and insert the bet as one step.
    ///
    /// The map stays write-locked across the debit, so a failed debit leaves
    /// no bet behind and a concurrent duplicate cannot slip in.
    pub async fn place(
        &self,
        user_id: UserId,
        amount: Amount,
        placed_at_ms: u64,
        ledger: &Ledger,
    ) -> Result<BetId, BetError> {
        let id = BetId { round_id: self.round_id, user_id };
        let mut bets = self.bets.write().await;

        if bets.contains_key(&user_id) {
            return Err(BetError::DuplicateBet);
        }

        ledger.debit(user_id, amount, EntryRef::Stake { bet: id }).await?;

        bets.insert(user_id, Arc::new(Mutex::new(Bet {
            id,
            amount,
            placed_at_ms,
            cash_out: None,
            outcome: None,
        })));

        Ok(id)
    }

    /// Lock in a cash-out. Second call for the same bet fails.
    pub async fn cash_out(
        &self,
        user_id: &UserId,
        multiplier: Multiplier,
        elapsed_ms: u64,
    ) -> Result<Multiplier, BetError> {
        let bet = {
            let bets = self.bets.read().await;
            bets.get(user_id).cloned().ok_or(BetError::NoActiveBet)?
        };

        let mut bet = bet.lock().await;
        if bet.cash_out.is_some() {
            return Err(BetError::NoActiveBet);
        }

        bet.cash_out = Some(CashOut { multiplier, elapsed_ms });
        Ok(multiplier)
    }

    /// Copy of one bet.
    pub async fn get(&self, user_id: &UserId) -> Option<Bet> {
        let bet = self.bets.read().await.get(user_id).cloned()?;
        let bet = bet.lock().await.clone();
        Some(bet)
    }

    /// Copies of every bet, in user order.
    pub async fn snapshot(&self) -> Vec<Bet> {
        let mut out = Vec::new();
        for bet in self.handles().await {
            out.push(bet.lock().await.clone());
        }
        out
    }

    /// Shared handles for settlement to lock one at a time.
    pub(crate) async fn handles(&self) -> Vec<Arc<Mutex<Bet>>> {
        self.bets.read().await.values().cloned().collect()
    }

    /// Number of bets.
    pub async fn len(&self) -> usize {
        self.bets.read().await.len()
    }

    /// Whether no bets were placed.
    pub async fn is_empty(&self) -> bool {
        self.bets.read().await.is_empty()
    }

    /// Sum of stakes.
    pub async fn total_staked(&self) -> Amount {
        self.snapshot().await.iter().map(|b| b.amount).sum()
    }
}
