//! Round Scheduler
//!
//! The only task that moves rounds through their phases. One explicit loop:
//!
//! ```text
//! draw crash point ─► open (WAITING) ─► betting window ─► start (RUNNING)
//!        ▲                                                     │
//!        │                                               ticks until
//!   cooldown ◄── announce ◄── archive ◄── settle ◄── crash (CRASHED)
//! ```
//!
//! Generator and archive failures are retried with backoff, never skipped,
//! so round numbers stay contiguous. Shutdown lets an open round run to its
//! crash and settle before the loop exits.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{env_duration_ms, env_parse};
use crate::core::money::Multiplier;
use crate::game::crash::CrashPointGenerator;
use crate::game::engine::{EngineError, RoundEngine, RunningRound};
use crate::game::events::RoundEvent;
use crate::game::round::RoundId;
use crate::game::settlement::SettlementFailure;
use crate::game::store::{RoundRecord, RoundStore, StoreError};

/// Exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// First delay.
    pub initial: Duration,
    /// Delay cap.
    pub max: Duration,
    /// Growth per attempt.
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay = self.initial;
        for _ in 0..attempt {
            delay = delay.saturating_mul(self.factor.max(1));
            if delay >= self.max {
                return self.max;
            }
        }
        delay.min(self.max)
    }
}

/// Scheduler timing.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// How long bets are accepted.
    pub betting_window: Duration,
    /// Pause after a round ends.
    pub cooldown: Duration,
    /// Multiplier broadcast interval while running.
    pub tick_interval: Duration,
    /// Backoff for generator and archive failures.
    pub retry: RetryPolicy,
    /// Extra settlement passes for failed payouts.
    pub settle_retries: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            betting_window: Duration::from_secs(5),
            cooldown: Duration::from_secs(3),
            tick_interval: Duration::from_millis(100),
            retry: RetryPolicy::default(),
            settle_retries: 3,
        }
    }
}

impl ScheduleConfig {
    /// Read `CRASH_BETTING_WINDOW_MS`, `CRASH_COOLDOWN_MS`, `CRASH_TICK_MS`,
    /// `CRASH_RETRY_INITIAL_MS`, `CRASH_RETRY_MAX_MS` and `CRASH_SETTLE_RETRIES`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            betting_window: env_duration_ms("CRASH_BETTING_WINDOW_MS", d.betting_window),
            cooldown: env_duration_ms("CRASH_COOLDOWN_MS", d.cooldown),
            tick_interval: env_duration_ms("CRASH_TICK_MS", d.tick_interval),
            retry: RetryPolicy {
                initial: env_duration_ms("CRASH_RETRY_INITIAL_MS", d.retry.initial),
                max: env_duration_ms("CRASH_RETRY_MAX_MS", d.retry.max),
                factor: d.retry.factor,
            },
            settle_retries: env_parse("CRASH_SETTLE_RETRIES", d.settle_retries),
        }
    }
}

/// Fatal scheduler errors. Only reachable through a broken invariant.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Engine refused a transition.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Round number to start from, continuing after the archive.
pub fn resume_round_id(store: &dyn RoundStore) -> Result<RoundId, StoreError> {
    Ok(store.last_round_id()?.map(RoundId::next).unwrap_or(RoundId::FIRST))
}

/// Drives the round lifecycle.
pub struct RoundScheduler {
    engine: Arc<RoundEngine>,
    generator: Arc<dyn CrashPointGenerator>,
    config: ScheduleConfig,
}

impl RoundScheduler {
    /// Create a scheduler.
    pub fn new(
        engine: Arc<RoundEngine>,
        generator: Arc<dyn CrashPointGenerator>,
        config: ScheduleConfig,
    ) -> Self {
        Self { engine, generator, config }
    }

    /// Run rounds until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), SchedulerError> {
        info!(
            "Scheduler started: {:?} betting, {:?} cooldown",
            self.config.betting_window, self.config.cooldown
        );

        loop {
            if !self.wait_enabled(&mut shutdown).await {
                break;
            }

            let crash_point = match self.draw_crash_point(&mut shutdown).await {
                Some(point) => point,
                None => break,
            };

            let stopping = self.play_round(crash_point, &mut shutdown).await?;
            if stopping {
                break;
            }

            if !self.pause_for(self.config.cooldown, &mut shutdown).await {
                break;
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// One full round. Returns whether shutdown was requested meanwhile.
    async fn play_round(
        &self,
        crash_point: Multiplier,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<bool, SchedulerError> {
        let mut stopping = false;
        let window_ms = self.config.betting_window.as_millis() as u64;

        // WAITING
        let round_id = self.engine.open_round(crash_point, window_ms).await?;
        self.hold(self.config.betting_window, shutdown, &mut stopping).await;

        // RUNNING
        let running = self.engine.start_round().await?;
        self.run_ticks(&running, shutdown, &mut stopping).await;

        // CRASHED
        self.engine.crash_round().await?;
        let unsettled = self.settle(round_id).await?;
        let record = self.archive(unsettled).await?;
        self.engine.announce_end(&record);

        Ok(stopping)
    }

    async fn wait_enabled(&self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let mut enabled = self.engine.enabled_watch();
        while !*enabled.borrow_and_update() {
            info!("Game paused, no new rounds");
            tokio::select! {
                changed = enabled.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = shutdown.recv() => return false,
            }
        }
        true
    }

    async fn draw_crash_point(&self, shutdown: &mut broadcast::Receiver<()>) -> Option<Multiplier> {
        let mut attempt = 0;
        loop {
            match self.generator.draw() {
                Ok(point) => return Some(point.max(Multiplier::ONE)),
                Err(e) => {
                    let delay = self.config.retry.delay(attempt);
                    warn!("Crash point draw failed (attempt {}): {}; retrying in {:?}", attempt + 1, e, delay);
                    attempt += 1;
                    if !self.pause_for(delay, shutdown).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Tick until the engine clock reaches the crash instant. The deadline is
    /// re-read from the clock every wake-up, so the crash lands where
    /// `cash_out` starts refusing.
    async fn run_ticks(
        &self,
        running: &RunningRound,
        shutdown: &mut broadcast::Receiver<()>,
        stopping: &mut bool,
    ) {
        let mut ticker = interval(self.config.tick_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let remaining = running.crash_deadline_ms().saturating_sub(self.engine.now_ms());
            if remaining == 0 {
                break;
            }

            tokio::select! {
                biased;
                _ = sleep(Duration::from_millis(remaining)) => {}
                _ = ticker.tick() => {
                    if let Some((round_id, elapsed_ms, multiplier)) = self.engine.live_multiplier().await {
                        self.engine.emit(RoundEvent::MultiplierTick { round_id, elapsed_ms, multiplier });
                    }
                }
                _ = shutdown.recv(), if !*stopping => {
                    info!("Shutdown requested; finishing the running round");
                    *stopping = true;
                }
            }
        }
    }

    async fn settle(&self, round_id: RoundId) -> Result<Vec<SettlementFailure>, SchedulerError> {
        let mut attempt = 0;
        loop {
            let report = self.engine.settle_current().await?;
            if report.is_complete() {
                return Ok(Vec::new());
            }
            if attempt >= self.config.settle_retries {
                error!(
                    "Round {} left {} payouts unsettled after {} attempts",
                    round_id,
                    report.failures.len(),
                    attempt + 1
                );
                return Ok(report.failures);
            }

            let delay = self.config.retry.delay(attempt);
            debug!("Round {} retrying {} payouts in {:?}", round_id, report.failures.len(), delay);
            sleep(delay).await;
            attempt += 1;
        }
    }

    async fn archive(&self, unsettled: Vec<SettlementFailure>) -> Result<RoundRecord, SchedulerError> {
        let mut attempt = 0;
        loop {
            match self.engine.archive_current(unsettled.clone()).await {
                Ok(record) => return Ok(record),
                Err(EngineError::Store(e)) => {
                    let delay = self.config.retry.delay(attempt);
                    error!("Archiving failed (attempt {}): {}; retrying in {:?}", attempt + 1, e, delay);
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Sleep the full duration, noting a shutdown request without acting on it.
    async fn hold(&self, duration: Duration, shutdown: &mut broadcast::Receiver<()>, stopping: &mut bool) {
        let timer = sleep(duration);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => return,
                _ = shutdown.recv(), if !*stopping => {
                    info!("Shutdown requested; finishing the open round");
                    *stopping = true;
                }
            }
        }
    }

    /// Sleep unless shutdown fires first. Returns false on shutdown.
    async fn pause_for(&self, duration: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
        tokio::select! {
            _ = sleep(duration) => true,
            _ = shutdown.recv() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::{Clock, ManualClock, SystemClock};
    use crate::game::crash::{GeneratorError, SequenceGenerator};
    use crate::game::engine::EngineConfig;
    use crate::game::ledger::Ledger;
    use crate::game::store::MemoryRoundStore;
    use crate::game::round::{RoundPhase, UserId};

    fn m(h: u32) -> Multiplier {
        Multiplier::from_hundredths(h)
    }

    fn outage() -> Result<Multiplier, GeneratorError> {
        Err(GeneratorError::Unavailable("rng service down".into()))
    }

    fn config() -> ScheduleConfig {
        ScheduleConfig {
            betting_window: Duration::from_secs(2),
            cooldown: Duration::from_secs(1),
            tick_interval: Duration::from_millis(100),
            retry: RetryPolicy {
                initial: Duration::from_millis(50),
                max: Duration::from_millis(400),
                factor: 2,
            },
            settle_retries: 2,
        }
    }

    struct Setup {
        engine: Arc<RoundEngine>,
        store: Arc<MemoryRoundStore>,
        shutdown: broadcast::Sender<()>,
        handle: tokio::task::JoinHandle<Result<(), SchedulerError>>,
    }

    fn start(
        outcomes: Vec<Result<Multiplier, GeneratorError>>,
        store: Arc<MemoryRoundStore>,
        enabled: bool,
    ) -> Setup {
        start_with_clock(outcomes, store, enabled, Arc::new(SystemClock::new()))
    }

    fn start_with_clock(
        outcomes: Vec<Result<Multiplier, GeneratorError>>,
        store: Arc<MemoryRoundStore>,
        enabled: bool,
        clock: Arc<dyn Clock>,
    ) -> Setup {
        let first = resume_round_id(store.as_ref()).unwrap();
        let engine = Arc::new(RoundEngine::new(
            EngineConfig::default(),
            clock,
            Arc::new(Ledger::new()),
            store.clone(),
            first,
        ));
        engine.set_enabled(enabled);

        let scheduler = RoundScheduler::new(
            engine.clone(),
            Arc::new(SequenceGenerator::with_outcomes(outcomes)),
            config(),
        );
        let (shutdown, rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { scheduler.run(rx).await });

        Setup { engine, store, shutdown, handle }
    }

    async fn next_ended(rx: &mut broadcast::Receiver<RoundEvent>) -> (RoundId, Multiplier) {
        loop {
            if let RoundEvent::RoundEnded { round_id, crash_point, .. } = rx.recv().await.unwrap() {
                return (round_id, crash_point);
            }
        }
    }

    #[test]
    fn test_retry_policy_caps() {
        let policy = RetryPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(700),
            factor: 2,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(700));
        assert_eq!(policy.delay(40), Duration::from_millis(700));
    }

    #[test]
    fn test_resume_round_id() {
        let store = MemoryRoundStore::default();
        assert_eq!(resume_round_id(&store).unwrap(), RoundId::FIRST);

        let record = RoundRecord::seal(RoundId(41), m(150), chrono::Utc::now(), None, None, vec![], vec![]);
        store.append(&record).unwrap();
        assert_eq!(resume_round_id(&store).unwrap(), RoundId(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flaky_generator_keeps_ids_contiguous() {
        let s = start(
            vec![Ok(m(150)), outage(), outage(), Ok(m(200)), outage(), Ok(m(100))],
            Arc::new(MemoryRoundStore::default()),
            true,
        );
        let mut rx = s.engine.subscribe();

        assert_eq!(next_ended(&mut rx).await, (RoundId(1), m(150)));
        assert_eq!(next_ended(&mut rx).await, (RoundId(2), m(200)));
        assert_eq!(next_ended(&mut rx).await, (RoundId(3), m(100)));

        s.shutdown.send(()).unwrap();
        s.handle.await.unwrap().unwrap();

        let ids: Vec<_> = s.store.recent(10).unwrap().iter().map(|r| r.round_id).collect();
        assert_eq!(ids, vec![RoundId(1), RoundId(2), RoundId(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_emits_lifecycle_in_order() {
        let s = start(vec![Ok(m(130))], Arc::new(MemoryRoundStore::default()), true);
        let mut rx = s.engine.subscribe();

        let mut kinds = Vec::new();
        loop {
            let event = rx.recv().await.unwrap();
            let kind = match &event {
                RoundEvent::RoundCreated { .. } => "created",
                RoundEvent::RoundStarted { .. } => "started",
                RoundEvent::MultiplierTick { multiplier, .. } => {
                    assert!(*multiplier < m(130));
                    "tick"
                }
                RoundEvent::RoundEnded { .. } => "ended",
                _ => "other",
            };
            if kinds.last() != Some(&kind) {
                kinds.push(kind);
            }
            if kind == "ended" {
                break;
            }
        }
        assert_eq!(kinds, vec!["created", "started", "tick", "ended"]);

        s.shutdown.send(()).unwrap();
        s.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_player_cashes_out_during_live_round() {
        let s = start(vec![Ok(m(300))], Arc::new(MemoryRoundStore::default()), true);
        let mut rx = s.engine.subscribe();

        let user = UserId::random();
        s.engine.ledger().open_account(user).await;
        s.engine.ledger().deposit(user, 1000, uuid::Uuid::new_v4()).await.unwrap();

        let mut cashed = None;
        loop {
            match rx.recv().await.unwrap() {
                RoundEvent::RoundCreated { round_id, .. } => {
                    s.engine.place_bet(round_id, user, 100).await.unwrap();
                }
                RoundEvent::MultiplierTick { round_id, multiplier, .. } if multiplier >= m(150) && cashed.is_none() => {
                    cashed = Some(s.engine.cash_out(round_id, user).await.unwrap());
                }
                RoundEvent::RoundEnded { .. } => break,
                _ => {}
            }
        }

        let multiplier = cashed.unwrap();
        assert!(multiplier >= m(150) && multiplier < m(300));
        let payout = multiplier.payout(100).unwrap();
        assert_eq!(s.engine.ledger().balance(&user).await, Some(900 + payout));

        s.shutdown.send(()).unwrap();
        s.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_game_opens_no_round() {
        let s = start(vec![Ok(m(120)), Ok(m(120))], Arc::new(MemoryRoundStore::default()), false);
        let mut rx = s.engine.subscribe();

        let idle = tokio::time::timeout(Duration::from_secs(60), rx.recv()).await;
        assert!(idle.is_err());

        s.engine.set_enabled(true);
        match rx.recv().await.unwrap() {
            RoundEvent::RoundCreated { round_id, .. } => assert_eq!(round_id, RoundId(1)),
            other => panic!("unexpected event {:?}", other),
        }

        // Pausing mid-round lets the round finish
        s.engine.set_enabled(false);
        assert_eq!(next_ended(&mut rx).await.0, RoundId(1));

        let quiet = tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                if let RoundEvent::RoundCreated { .. } = rx.recv().await.unwrap() {
                    return;
                }
            }
        })
        .await;
        assert!(quiet.is_err());

        s.shutdown.send(()).unwrap();
        s.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_outage_is_retried() {
        let store = Arc::new(MemoryRoundStore::default());
        store.fail_next(4);
        let s = start(vec![Ok(m(110)), Ok(m(120))], store, true);
        let mut rx = s.engine.subscribe();

        assert_eq!(next_ended(&mut rx).await.0, RoundId(1));
        assert_eq!(next_ended(&mut rx).await.0, RoundId(2));

        let records = s.store.recent(10).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.verify()));

        s.shutdown.send(()).unwrap();
        s.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_finishes_open_round() {
        let s = start(vec![Ok(m(500))], Arc::new(MemoryRoundStore::default()), true);
        let mut rx = s.engine.subscribe();

        let user = UserId::random();
        s.engine.ledger().open_account(user).await;
        s.engine.ledger().deposit(user, 1000, uuid::Uuid::new_v4()).await.unwrap();

        match rx.recv().await.unwrap() {
            RoundEvent::RoundCreated { round_id, .. } => {
                s.engine.place_bet(round_id, user, 100).await.unwrap();
            }
            other => panic!("unexpected event {:?}", other),
        }

        s.shutdown.send(()).unwrap();
        s.handle.await.unwrap().unwrap();

        // The bet was settled and archived, not left in escrow
        let records = s.store.recent(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bets.len(), 1);
        assert!(records[0].bets[0].outcome.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_numbering_from_store() {
        let store = Arc::new(MemoryRoundStore::default());
        let old = RoundRecord::seal(RoundId(9), m(180), chrono::Utc::now(), None, None, vec![], vec![]);
        store.append(&old).unwrap();

        let s = start(vec![Ok(m(110))], store, true);
        let mut rx = s.engine.subscribe();
        assert_eq!(next_ended(&mut rx).await.0, RoundId(10));

        s.shutdown.send(()).unwrap();
        s.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_follows_engine_clock() {
        let clock = Arc::new(ManualClock::new(0));
        let s = start_with_clock(vec![Ok(m(300))], Arc::new(MemoryRoundStore::default()), true, clock.clone());
        let mut rx = s.engine.subscribe();

        loop {
            if let RoundEvent::RoundStarted { .. } = rx.recv().await.unwrap() {
                break;
            }
        }

        // Runtime time passes but the engine clock does not
        let early = tokio::time::timeout(Duration::from_secs(30), next_ended(&mut rx)).await;
        assert!(early.is_err());
        assert_eq!(s.engine.snapshot().await.unwrap().phase, RoundPhase::Running);

        // 3.00x is reached 2000ms into the round
        clock.advance(2000);
        assert_eq!(next_ended(&mut rx).await, (RoundId(1), m(300)));

        s.shutdown.send(()).unwrap();
        s.handle.await.unwrap().unwrap();
    }
}
