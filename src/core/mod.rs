//! Core primitives.
//!
//! Money arithmetic, randomness, time and hashing. Nothing here knows about
//! rounds or players.

pub mod money;
pub mod rng;
pub mod clock;
pub mod hash;

// Re-export core types
pub use money::{Amount, Multiplier, format_amount};
pub use rng::RoundRng;
pub use clock::{Clock, SystemClock, ManualClock};
pub use hash::{RecordHasher, RecordHash};
