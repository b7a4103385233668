//! # Crash Round Server
//!
//! Authoritative round scheduler and settlement engine for a multiplier
//! crash game.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CRASH ROUND SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Primitives                                │
//! │  ├── money.rs    - Minor-unit amounts, fixed-point multiplier│
//! │  ├── rng.rs      - Xorshift128+ PRNG                         │
//! │  ├── clock.rs    - Injectable monotonic clock                │
//! │  └── hash.rs     - SHA-256 record hashing                    │
//! │                                                              │
//! │  game/           - Round lifecycle                           │
//! │  ├── round.rs    - Ids, phases, multiplier curve             │
//! │  ├── crash.rs    - Crash-point generators                    │
//! │  ├── ledger.rs   - Idempotent account ledger                 │
//! │  ├── bets.rs     - Per-round bet registry                    │
//! │  ├── settlement.rs - Payout application                      │
//! │  ├── engine.rs   - Phase gate and player operations          │
//! │  ├── scheduler.rs- Round loop                                │
//! │  ├── store.rs    - Round archive                             │
//! │  └── events.rs   - Broadcast events                          │
//! │                                                              │
//! │  network/        - WebSocket transport                       │
//! │  ├── server.rs   - Connections and dispatch                  │
//! │  ├── protocol.rs - Message types                             │
//! │  └── auth.rs     - JWT validation                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Money
//!
//! Balances and stakes are integer minor units; multipliers are hundredths.
//! A payout is `floor(amount * multiplier / 100)` and nothing in the money
//! path touches floating point.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use config::AppConfig;
pub use core::money::{Amount, Multiplier};
pub use game::engine::{EngineConfig, RoundEngine};
pub use game::ledger::Ledger;
pub use game::round::{RoundId, RoundPhase, UserId};
pub use game::scheduler::{RoundScheduler, ScheduleConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
