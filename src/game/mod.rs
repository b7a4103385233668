//! Game Logic Module
//!
//! The round lifecycle, from crash-point draw to archived settlement.
//!
//! ## Module Structure
//!
//! - `round`: Identifiers, phases, multiplier curve
//! - `crash`: Crash-point generation
//! - `ledger`: Account balances with idempotent entries
//! - `bets`: Per-round bet registry
//! - `settlement`: Applying outcomes to the ledger
//! - `engine`: Phase gate and player operations
//! - `scheduler`: The round loop
//! - `store`: Round archive
//! - `events`: Broadcast events

pub mod round;
pub mod crash;
pub mod ledger;
pub mod bets;
pub mod settlement;
pub mod engine;
pub mod scheduler;
pub mod store;
pub mod events;

// Re-export key types
pub use round::{BetId, MultiplierCurve, Round, RoundId, RoundPhase, UserId};
pub use crash::{CrashPointGenerator, GeneratorError, SequenceGenerator, TieredCrashPolicy};
pub use ledger::{EntryRef, Ledger, LedgerError};
pub use bets::{Bet, BetError, BetOutcome, BetStatus};
pub use settlement::{SettlementFailure, SettlementReport};
pub use engine::{EngineConfig, EngineError, RoundEngine, RoundSnapshot};
pub use scheduler::{RetryPolicy, RoundScheduler, ScheduleConfig, SchedulerError};
pub use store::{JsonlRoundStore, MemoryRoundStore, RoundRecord, RoundStore, StoreError};
pub use events::{RoundEvent, RoundSummary};
