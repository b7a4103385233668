//! Settlement Engine
//!
//! Applies round outcomes to the ledger once the round has crashed.
//!
//! A bet wins when it cashed out at or below the crash point and is credited
//! `amount * multiplier` (principal included). Everything else loses and the
//! escrowed stake stays with the house.
//!
//! Each bet carries an outcome marker and each payout a ledger reference, so
//! running settlement again only touches bets that failed before.

use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::core::money::{Amount, Multiplier};
use crate::game::bets::{Bet, BetOutcome, BetRegistry};
use crate::game::ledger::{EntryRef, Ledger, LedgerError};
use crate::game::round::{BetId, RoundId};

/// Settlement of a single bet failed. Other bets are unaffected.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("settlement of bet {bet} failed: {reason}")]
pub struct SettlementFailure {
    /// Bet left unsettled.
    pub bet: BetId,
    /// Payout that could not be applied.
    pub payout: Amount,
    /// Cause.
    pub reason: String,
}

/// Totals for one settlement pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementReport {
    /// Bets settled as wins in this pass.
    pub won: u32,
    /// Bets settled as losses in this pass.
    pub lost: u32,
    /// Bets skipped because an earlier pass settled them.
    pub already_settled: u32,
    /// Sum of payouts credited in this pass.
    pub total_paid: Amount,
    /// Bets that could not be settled.
    pub failures: Vec<SettlementFailure>,
}

impl SettlementReport {
    /// Whether every bet is settled.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Decide a bet against the crash point. Pure; no ledger access.
pub fn decide(bet: &Bet, crash_point: Multiplier) -> Option<BetOutcome> {
    match bet.cash_out {
        Some(cash_out) if cash_out.multiplier <= crash_point => cash_out
            .multiplier
            .payout(bet.amount)
            .map(|payout| BetOutcome::Won { payout }),
        _ => Some(BetOutcome::Lost),
    }
}

/// Settle every unsettled bet of a crashed round.
///
/// The caller guarantees the round is crashed, so no cash-out can race with
/// this pass.
pub async fn settle_round(
    round_id: RoundId,
    crash_point: Multiplier,
    registry: &BetRegistry,
    ledger: &Ledger,
) -> SettlementReport {
    let mut report = SettlementReport::default();

    for handle in registry.handles().await {
        let mut bet = handle.lock().await;

        if bet.outcome.is_some() {
            report.already_settled += 1;
            continue;
        }

        let outcome = match decide(&bet, crash_point) {
            Some(outcome) => outcome,
            None => {
                error!("Payout overflow for bet {}", bet.id);
                report.failures.push(SettlementFailure {
                    bet: bet.id,
                    payout: 0,
                    reason: LedgerError::Overflow.to_string(),
                });
                continue;
            }
        };

        match outcome {
            BetOutcome::Lost => {
                bet.outcome = Some(BetOutcome::Lost);
                report.lost += 1;
            }
            BetOutcome::Won { payout } => {
                match ledger.credit(bet.id.user_id, payout, EntryRef::Payout { bet: bet.id }).await {
                    Ok(applied) => {
                        debug!(
                            "Round {} paid {} to {} (balance {})",
                            round_id, payout, bet.id.user_id.short(), applied.balance()
                        );
                        bet.outcome = Some(outcome);
                        report.won += 1;
                        report.total_paid += payout;
                    }
                    Err(e) => {
                        error!("Round {} payout to {} failed: {}", round_id, bet.id.user_id.short(), e);
                        report.failures.push(SettlementFailure {
                            bet: bet.id,
                            payout,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    info!(
        "Round {} settled: {} won, {} lost, {} paid, {} failed",
        round_id, report.won, report.lost, report.total_paid, report.failures.len()
    );

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::round::UserId;

    fn m(h: u32) -> Multiplier {
        Multiplier::from_hundredths(h)
    }

    async fn player(ledger: &Ledger, registry: &BetRegistry, stake: Amount) -> UserId {
        let user = UserId::random();
        ledger.open_account(user).await;
        ledger.deposit(user, 10_000, uuid::Uuid::new_v4()).await.unwrap();
        registry.place(user, stake, 0, ledger).await.unwrap();
        user
    }

    #[test]
    fn test_decide() {
        let mut bet = Bet {
            id: BetId { round_id: RoundId(1), user_id: UserId::random() },
            amount: 1000,
            placed_at_ms: 0,
            cash_out: None,
            outcome: None,
        };
        assert_eq!(decide(&bet, m(250)), Some(BetOutcome::Lost));

        bet.cash_out = Some(crate::game::bets::CashOut { multiplier: m(200), elapsed_ms: 1000 });
        assert_eq!(decide(&bet, m(250)), Some(BetOutcome::Won { payout: 2000 }));

        // Equal to the crash point still wins at settlement
        assert_eq!(decide(&bet, m(200)), Some(BetOutcome::Won { payout: 2000 }));

        bet.cash_out = Some(crate::game::bets::CashOut { multiplier: m(300), elapsed_ms: 2000 });
        assert_eq!(decide(&bet, m(250)), Some(BetOutcome::Lost));
    }

    #[tokio::test]
    async fn test_settle_round_credits_winners_only() {
        let ledger = Ledger::new();
        let registry = BetRegistry::new(RoundId(1));
        let winner = player(&ledger, &registry, 1000).await;
        let loser = player(&ledger, &registry, 1000).await;

        registry.cash_out(&winner, m(200), 1000).await.unwrap();

        let report = settle_round(RoundId(1), m(250), &registry, &ledger).await;
        assert_eq!(report.won, 1);
        assert_eq!(report.lost, 1);
        assert_eq!(report.total_paid, 2000);
        assert!(report.is_complete());

        assert_eq!(ledger.balance(&winner).await, Some(9000 + 2000));
        assert_eq!(ledger.balance(&loser).await, Some(9000));
    }

    #[tokio::test]
    async fn test_rerun_is_noop() {
        let ledger = Ledger::new();
        let registry = BetRegistry::new(RoundId(2));
        let winner = player(&ledger, &registry, 500).await;
        registry.cash_out(&winner, m(150), 500).await.unwrap();

        settle_round(RoundId(2), m(400), &registry, &ledger).await;
        let again = settle_round(RoundId(2), m(400), &registry, &ledger).await;

        assert_eq!(again.won, 0);
        assert_eq!(again.already_settled, 1);
        assert_eq!(again.total_paid, 0);
        assert_eq!(ledger.balance(&winner).await, Some(9500 + 750));
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_retryable() {
        let ledger = Ledger::new();
        let registry = BetRegistry::new(RoundId(3));
        let frozen = player(&ledger, &registry, 1000).await;
        let fine = player(&ledger, &registry, 1000).await;

        registry.cash_out(&frozen, m(120), 200).await.unwrap();
        registry.cash_out(&fine, m(130), 300).await.unwrap();
        ledger.set_frozen(frozen, true).await.unwrap();

        let first = settle_round(RoundId(3), m(500), &registry, &ledger).await;
        assert_eq!(first.won, 1);
        assert_eq!(first.failures.len(), 1);
        assert_eq!(first.failures[0].bet.user_id, frozen);
        assert_eq!(first.failures[0].payout, 1200);
        assert_eq!(ledger.balance(&fine).await, Some(9000 + 1300));

        ledger.set_frozen(frozen, false).await.unwrap();
        let second = settle_round(RoundId(3), m(500), &registry, &ledger).await;
        assert_eq!(second.won, 1);
        assert_eq!(second.already_settled, 1);
        assert!(second.is_complete());
        assert_eq!(ledger.balance(&frozen).await, Some(9000 + 1200));
    }
}
