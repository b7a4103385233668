//! Round Engine
//!
//! The single owned state object for the live round. Everything that reads or
//! changes the phase goes through the phase gate, a read/write lock:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  place_bet / cash_out      gate.read()   (many at once)      │
//! │  open / start / crash      gate.write()  (scheduler only)    │
//! │                                                              │
//! │  lock order: gate → bet map → bet → ledger account           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A cash-out holding the gate shared either completes before the crash
//! transition acquires it, or waits and then observes CRASHED. A cash-out at
//! or past the crash instant is rejected even if the scheduler's timer has
//! not fired yet, so ties lose.

use std::sync::Arc;
use chrono::Utc;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::core::clock::Clock;
use crate::core::money::{Amount, Multiplier};
use crate::game::bets::{Bet, BetError, BetOutcome, BetRegistry, BetStatus};
use crate::game::events::{RoundEvent, RoundSummary};
use crate::game::ledger::{Applied, EntryRef, Ledger};
use crate::game::round::{BetId, MultiplierCurve, Round, RoundId, RoundPhase, UserId};
use crate::game::settlement::{settle_round, SettlementFailure, SettlementReport};
use crate::game::store::{RoundRecord, RoundStore, SettledBet, StoreError};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Elapsed-time to multiplier mapping.
    pub curve: MultiplierCurve,
    /// Smallest stake (minor units).
    pub min_bet: Amount,
    /// Largest stake (minor units).
    pub max_bet: Amount,
    /// Event channel capacity.
    pub event_capacity: usize,
    /// Rounds whose ledger references stay replay-safe after archiving.
    /// Also the oldest round [`RoundEngine::resettle`] accepts.
    pub ledger_retention_rounds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            curve: MultiplierCurve::default(),
            min_bet: 10,          // 0.10
            max_bet: 1_000_000,   // 10,000.00
            event_capacity: 1024,
            ledger_retention_rounds: 1_000,
        }
    }
}

/// Scheduler-side errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transition not allowed from the current phase.
    #[error("cannot move to {to} from {from:?}")]
    InvalidTransition {
        /// Current phase, if a round exists.
        from: Option<RoundPhase>,
        /// Requested phase.
        to: RoundPhase,
    },
    /// No round installed.
    #[error("no round in progress")]
    NoRound,
    /// Round not in the archive.
    #[error("round {0} is not archived")]
    UnknownRound(RoundId),
    /// Round older than the ledger retention horizon.
    #[error("round {round_id} is before the resettle horizon {horizon}")]
    RoundExpired {
        /// Requested round.
        round_id: RoundId,
        /// Oldest round still accepted.
        horizon: RoundId,
    },
    /// Archived record fails its digest check.
    #[error("record of round {0} does not verify")]
    Tampered(RoundId),
    /// Archive failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Live round plus its bets.
struct RoundSlot {
    round: Round,
    bets: Arc<BetRegistry>,
}

/// State behind the phase gate.
pub(crate) struct GateState {
    current: Option<RoundSlot>,
    next_id: RoundId,
}

impl GateState {
    fn phase(&self) -> Option<RoundPhase> {
        self.current.as_ref().map(|s| s.round.phase)
    }
}

/// Data the scheduler needs once the multiplier is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningRound {
    /// Round number.
    pub round_id: RoundId,
    /// Clock reading at start.
    pub started_at_ms: u64,
    /// Running time at which the round crashes.
    pub crash_elapsed_ms: u64,
}

impl RunningRound {
    /// Clock reading of the crash instant.
    pub fn crash_deadline_ms(&self) -> u64 {
        self.started_at_ms.saturating_add(self.crash_elapsed_ms)
    }
}

/// Player entry in a round snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerView {
    /// Bettor.
    pub user_id: UserId,
    /// Stake.
    pub amount: Amount,
    /// Status.
    pub status: BetStatus,
    /// Locked-in multiplier.
    pub cash_out: Option<Multiplier>,
    /// Settled payout.
    pub payout: Option<Amount>,
}

/// Public view of the live round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    /// Round number.
    pub round_id: RoundId,
    /// Phase.
    pub phase: RoundPhase,
    /// Running time, once started.
    pub elapsed_ms: Option<u64>,
    /// Current multiplier, once started.
    pub multiplier: Option<Multiplier>,
    /// Crash point, only once crashed.
    pub crash_point: Option<Multiplier>,
    /// Bets.
    pub players: Vec<PlayerView>,
}

/// The round engine.
pub struct RoundEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    ledger: Arc<Ledger>,
    store: Arc<dyn RoundStore>,
    gate: RwLock<GateState>,
    events: broadcast::Sender<RoundEvent>,
    enabled: watch::Sender<bool>,
}

impl RoundEngine {
    /// Create an engine whose first round will be `first_round`.
    pub fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        ledger: Arc<Ledger>,
        store: Arc<dyn RoundStore>,
        first_round: RoundId,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            clock,
            ledger,
            store,
            gate: RwLock::new(GateState { current: None, next_id: first_round }),
            events,
            enabled: watch::channel(true).0,
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared ledger.
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Reading of the clock the curve runs on.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn release_cutoff(&self, latest: RoundId) -> RoundId {
        RoundId(latest.0.saturating_sub(self.config.ledger_retention_rounds))
    }

    /// Subscribe to round events.
    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.events.subscribe()
    }

    /// Enable or pause the game. A paused game finishes its current round
    /// and opens no new one until re-enabled.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.send_replace(enabled);
        if was != enabled {
            info!("Game {}", if enabled { "enabled" } else { "paused" });
        }
    }

    /// Whether new rounds may open.
    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    /// Watch the enabled flag.
    pub fn enabled_watch(&self) -> watch::Receiver<bool> {
        self.enabled.subscribe()
    }

    pub(crate) fn emit(&self, event: RoundEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // =========================================================================
    // SCHEDULER TRANSITIONS
    // =========================================================================

    /// Install a new round in WAITING with its crash point fixed.
    #[instrument(skip(self, crash_point))]
    pub async fn open_round(
        &self,
        crash_point: Multiplier,
        betting_window_ms: u64,
    ) -> Result<RoundId, EngineError> {
        let mut gate = self.gate.write().await;

        match gate.phase() {
            None | Some(RoundPhase::Crashed) => {}
            from => return Err(EngineError::InvalidTransition { from, to: RoundPhase::Waiting }),
        }

        let id = gate.next_id;
        gate.next_id = id.next();
        gate.current = Some(RoundSlot {
            round: Round::new(id, crash_point, &self.config.curve),
            bets: Arc::new(BetRegistry::new(id)),
        });

        info!("Round {} open for bets", id);
        self.emit(RoundEvent::RoundCreated { round_id: id, betting_window_ms });
        Ok(id)
    }

    /// WAITING → RUNNING. Records the start instant.
    pub async fn start_round(&self) -> Result<RunningRound, EngineError> {
        let mut gate = self.gate.write().await;
        let now_ms = self.clock.now_ms();

        let slot = gate.current.as_mut().ok_or(EngineError::NoRound)?;
        let from = slot.round.phase;
        if !from.can_advance_to(RoundPhase::Running) {
            return Err(EngineError::InvalidTransition { from: Some(from), to: RoundPhase::Running });
        }

        slot.round.phase = RoundPhase::Running;
        slot.round.started_at_ms = Some(now_ms);
        slot.round.started_at = Some(Utc::now());

        let running = RunningRound {
            round_id: slot.round.id,
            started_at_ms: now_ms,
            crash_elapsed_ms: slot.round.crash_elapsed_ms,
        };

        info!("Round {} running", running.round_id);
        self.emit(RoundEvent::RoundStarted { round_id: running.round_id });
        Ok(running)
    }

    /// RUNNING → CRASHED. After this returns no cash-out can be accepted.
    pub async fn crash_round(&self) -> Result<(RoundId, Multiplier), EngineError> {
        let mut gate = self.gate.write().await;
        Self::apply_crash(&mut gate)
    }

    fn apply_crash(gate: &mut GateState) -> Result<(RoundId, Multiplier), EngineError> {
        let slot = gate.current.as_mut().ok_or(EngineError::NoRound)?;
        let from = slot.round.phase;
        if !from.can_advance_to(RoundPhase::Crashed) {
            return Err(EngineError::InvalidTransition { from: Some(from), to: RoundPhase::Crashed });
        }

        slot.round.phase = RoundPhase::Crashed;
        slot.round.ended_at = Some(Utc::now());

        info!("Round {} crashed at {}", slot.round.id, slot.round.crash_point());
        Ok((slot.round.id, slot.round.crash_point()))
    }

    /// Settle the crashed round. Safe to call repeatedly.
    pub async fn settle_current(&self) -> Result<SettlementReport, EngineError> {
        let (round_id, crash_point, bets) = self.crashed_slot().await?;
        Ok(settle_round(round_id, crash_point, &bets, &self.ledger).await)
    }

    /// Seal the crashed round into a record and append it to the archive.
    ///
    /// `unsettled` lists payouts still failing after settlement retries.
    pub async fn archive_current(
        &self,
        unsettled: Vec<SettlementFailure>,
    ) -> Result<RoundRecord, EngineError> {
        let record = {
            let gate = self.gate.read().await;
            let slot = gate.current.as_ref().ok_or(EngineError::NoRound)?;
            if slot.round.phase != RoundPhase::Crashed {
                return Err(EngineError::InvalidTransition {
                    from: Some(slot.round.phase),
                    to: RoundPhase::Crashed,
                });
            }

            let bets: Vec<SettledBet> = slot.bets.snapshot().await.iter().map(SettledBet::from).collect();
            RoundRecord::seal(
                slot.round.id,
                slot.round.crash_point(),
                slot.round.created_at,
                slot.round.started_at,
                slot.round.ended_at,
                bets,
                unsettled,
            )
        };

        // Gate released before touching storage
        let store = self.store.clone();
        let to_write = record.clone();
        tokio::task::spawn_blocking(move || store.append(&to_write))
            .await
            .map_err(|e| StoreError::Unavailable(format!("archive task failed: {}", e)))??;

        debug!("Round {} archived ({})", record.round_id, &record.digest[..12]);
        self.ledger.release_rounds_before(self.release_cutoff(record.round_id)).await;
        Ok(record)
    }

    /// Pay the archived payouts of `round_id` that failed at settlement.
    ///
    /// Each one is credited under its original payout reference, so running
    /// this again credits nothing new. Rounds before the retention horizon
    /// are refused because their references may already be released.
    #[instrument(skip(self))]
    pub async fn resettle(&self, round_id: RoundId) -> Result<SettlementReport, EngineError> {
        self.check_horizon(round_id).await?;

        let store = self.store.clone();
        let record = tokio::task::spawn_blocking(move || store.find(round_id))
            .await
            .map_err(|e| StoreError::Unavailable(format!("archive lookup failed: {}", e)))??
            .ok_or(EngineError::UnknownRound(round_id))?;

        self.resettle_record(&record).await
    }

    /// [`RoundEngine::resettle`] for a record already in hand.
    pub async fn resettle_record(&self, record: &RoundRecord) -> Result<SettlementReport, EngineError> {
        if !record.verify() {
            return Err(EngineError::Tampered(record.round_id));
        }
        self.check_horizon(record.round_id).await?;

        let mut report = SettlementReport::default();
        for failure in &record.unsettled {
            if failure.payout == 0 || failure.bet.round_id != record.round_id {
                report.failures.push(failure.clone());
                continue;
            }

            let reference = EntryRef::Payout { bet: failure.bet };
            match self.ledger.credit(failure.bet.user_id, failure.payout, reference).await {
                Ok(Applied::Applied(_)) => {
                    report.won += 1;
                    report.total_paid += failure.payout;
                }
                Ok(Applied::AlreadyApplied(_)) => report.already_settled += 1,
                Err(e) => report.failures.push(SettlementFailure {
                    reason: e.to_string(),
                    ..failure.clone()
                }),
            }
        }

        info!(
            "Round {} resettled: {} paid ({}), {} already paid, {} still failing",
            record.round_id,
            report.won,
            report.total_paid,
            report.already_settled,
            report.failures.len()
        );
        Ok(report)
    }

    async fn check_horizon(&self, round_id: RoundId) -> Result<(), EngineError> {
        let latest = {
            let gate = self.gate.read().await;
            RoundId(gate.next_id.0.saturating_sub(1))
        };
        let horizon = self.release_cutoff(latest);
        if round_id < horizon {
            return Err(EngineError::RoundExpired { round_id, horizon });
        }
        Ok(())
    }

    /// Announce the end of the round with its crash point.
    pub fn announce_end(&self, record: &RoundRecord) {
        let won = record
            .bets
            .iter()
            .filter(|b| matches!(b.outcome, Some(BetOutcome::Won { .. })))
            .count() as u32;
        let lost = record
            .bets
            .iter()
            .filter(|b| matches!(b.outcome, Some(BetOutcome::Lost)))
            .count() as u32;

        self.emit(RoundEvent::RoundEnded {
            round_id: record.round_id,
            crash_point: record.crash_point,
            summary: RoundSummary {
                bets: record.bets.len() as u32,
                won,
                lost,
                unsettled: record.unsettled.len() as u32,
                total_staked: record.total_staked,
                total_paid: record.total_paid,
            },
        });
    }

    // =========================================================================
    // PLAYER OPERATIONS
    // =========================================================================

    /// Place a bet in the WAITING round. The stake is debited immediately.
    pub async fn place_bet(
        &self,
        round_id: RoundId,
        user_id: UserId,
        amount: Amount,
    ) -> Result<BetId, BetError> {
        let gate = self.gate.read().await;
        let slot = gate.current.as_ref().ok_or(BetError::WrongPhase)?;
        if slot.round.id != round_id || slot.round.phase != RoundPhase::Waiting {
            return Err(BetError::WrongPhase);
        }

        let min = self.config.min_bet.max(1);
        let max = self.config.max_bet;
        if amount < min || amount > max {
            return Err(BetError::BetOutOfRange { min, max });
        }

        let bet_id = slot
            .bets
            .place(user_id, amount, self.clock.now_ms(), &self.ledger)
            .await?;

        debug!("Bet {} placed: {}", bet_id, amount);
        self.emit(RoundEvent::BetPlaced { round_id, user_id, amount });
        Ok(bet_id)
    }

    /// Cash out at the current multiplier.
    pub async fn cash_out(&self, round_id: RoundId, user_id: UserId) -> Result<Multiplier, BetError> {
        let gate = self.gate.read().await;
        let slot = gate.current.as_ref().ok_or(BetError::WrongPhase)?;
        if slot.round.id != round_id || slot.round.phase != RoundPhase::Running {
            return Err(BetError::WrongPhase);
        }

        let now_ms = self.clock.now_ms();
        if slot.round.crash_reached(now_ms) {
            debug!("Cash-out by {} at crash instant rejected", user_id.short());
            return Err(BetError::WrongPhase);
        }

        let elapsed_ms = slot.round.elapsed_ms(now_ms).unwrap_or(0);
        let multiplier = self.config.curve.multiplier_at(elapsed_ms);
        slot.bets.cash_out(&user_id, multiplier, elapsed_ms).await?;

        debug!("{} cashed out at {}", user_id.short(), multiplier);
        self.emit(RoundEvent::CashedOut { round_id, user_id, multiplier });
        Ok(multiplier)
    }

    /// Bets of a crashed round. Rejected until the round has crashed.
    pub async fn list_active_bets(&self, round_id: RoundId) -> Result<Vec<Bet>, BetError> {
        let gate = self.gate.read().await;
        let slot = gate.current.as_ref().ok_or(BetError::WrongPhase)?;
        if slot.round.id != round_id || slot.round.phase != RoundPhase::Crashed {
            return Err(BetError::WrongPhase);
        }
        Ok(slot.bets.snapshot().await)
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Current round id and phase.
    pub async fn current(&self) -> Option<(RoundId, RoundPhase)> {
        let gate = self.gate.read().await;
        gate.current.as_ref().map(|s| (s.round.id, s.round.phase))
    }

    /// Live multiplier of the running round.
    pub async fn live_multiplier(&self) -> Option<(RoundId, u64, Multiplier)> {
        let gate = self.gate.read().await;
        let slot = gate.current.as_ref()?;
        if slot.round.phase != RoundPhase::Running {
            return None;
        }
        let elapsed = slot.round.elapsed_ms(self.clock.now_ms())?;
        let capped = elapsed.min(slot.round.crash_elapsed_ms);
        Some((slot.round.id, capped, self.config.curve.multiplier_at(capped)))
    }

    /// Public snapshot of the live round.
    pub async fn snapshot(&self) -> Option<RoundSnapshot> {
        let gate = self.gate.read().await;
        let slot = gate.current.as_ref()?;
        let round = &slot.round;

        let elapsed_ms = round
            .elapsed_ms(self.clock.now_ms())
            .map(|e| e.min(round.crash_elapsed_ms));
        let running = round.phase != RoundPhase::Waiting;

        let players = slot
            .bets
            .snapshot()
            .await
            .into_iter()
            .map(|bet| PlayerView {
                user_id: bet.id.user_id,
                amount: bet.amount,
                status: bet.status(running),
                cash_out: bet.cash_out.map(|c| c.multiplier),
                payout: match bet.outcome {
                    Some(BetOutcome::Won { payout }) => Some(payout),
                    _ => None,
                },
            })
            .collect();

        Some(RoundSnapshot {
            round_id: round.id,
            phase: round.phase,
            elapsed_ms,
            multiplier: elapsed_ms.map(|e| self.config.curve.multiplier_at(e)),
            crash_point: round.revealed_crash_point(),
            players,
        })
    }

    /// Recently archived rounds, oldest first.
    pub async fn history(&self, limit: usize) -> Result<Vec<RoundRecord>, StoreError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.recent(limit))
            .await
            .map_err(|e| StoreError::Unavailable(format!("history task failed: {}", e)))?
    }

    async fn crashed_slot(&self) -> Result<(RoundId, Multiplier, Arc<BetRegistry>), EngineError> {
        let gate = self.gate.read().await;
        let slot = gate.current.as_ref().ok_or(EngineError::NoRound)?;
        if slot.round.phase != RoundPhase::Crashed {
            warn!("Settlement requested for round {} in phase {}", slot.round.id, slot.round.phase);
            return Err(EngineError::InvalidTransition {
                from: Some(slot.round.phase),
                to: RoundPhase::Crashed,
            });
        }
        Ok((slot.round.id, slot.round.crash_point(), slot.bets.clone()))
    }

    #[cfg(test)]
    pub(crate) async fn crash_point_for_test(&self) -> Option<Multiplier> {
        self.gate.read().await.current.as_ref().map(|s| s.round.crash_point())
    }

    #[cfg(test)]
    pub(crate) async fn hold_gate(&self) -> tokio::sync::RwLockWriteGuard<'_, GateState> {
        self.gate.write().await
    }

    #[cfg(test)]
    pub(crate) fn crash_held(gate: &mut GateState) -> Result<(RoundId, Multiplier), EngineError> {
        Self::apply_crash(gate)
    }
}
