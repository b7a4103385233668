//! Process Configuration
//!
//! Every component has a plain config struct with `Default`; this module
//! reads the environment on top of those defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::game::engine::EngineConfig;
use crate::game::ledger::LedgerConfig;
use crate::game::round::MultiplierCurve;
use crate::game::scheduler::ScheduleConfig;
use crate::network::auth::AuthConfig;
use crate::network::server::ServerConfig;

/// Parse `key` from the environment, keeping `default` when unset or invalid.
pub fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring invalid {}={:?}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

/// Millisecond duration from the environment.
pub fn env_duration_ms(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(key, default.as_millis() as u64))
}

/// Boolean flag: `1` or `true` enable it.
pub fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

impl EngineConfig {
    /// Read `CRASH_MIN_BET`, `CRASH_MAX_BET`, `CRASH_STEP_MS`,
    /// `CRASH_STEP_HUNDREDTHS` and `CRASH_LEDGER_RETENTION_ROUNDS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            curve: MultiplierCurve {
                step_ms: env_parse("CRASH_STEP_MS", d.curve.step_ms).max(1),
                step_hundredths: env_parse("CRASH_STEP_HUNDREDTHS", d.curve.step_hundredths).max(1),
            },
            min_bet: env_parse("CRASH_MIN_BET", d.min_bet),
            max_bet: env_parse("CRASH_MAX_BET", d.max_bet),
            event_capacity: d.event_capacity,
            ledger_retention_rounds: env_parse("CRASH_LEDGER_RETENTION_ROUNDS", d.ledger_retention_rounds),
        }
    }
}

impl LedgerConfig {
    /// Read `CRASH_LEDGER_JOURNAL`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            journal_capacity: env_parse("CRASH_LEDGER_JOURNAL", d.journal_capacity).max(1),
        }
    }
}

/// Everything the binary needs.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Network listener.
    pub server: ServerConfig,
    /// Bet limits and curve.
    pub engine: EngineConfig,
    /// Journal limits.
    pub ledger: LedgerConfig,
    /// Round timing.
    pub schedule: ScheduleConfig,
    /// Token validation.
    pub auth: AuthConfig,
    /// JSON-lines archive; in-memory when unset.
    pub archive_path: Option<PathBuf>,
    /// Crash tier table text; reference tiers when unset.
    pub crash_tiers: Option<String>,
}

impl AppConfig {
    /// Read the whole configuration. `CRASH_ARCHIVE_PATH` selects the archive
    /// and `CRASH_TIERS` overrides the crash distribution.
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig::from_env(),
            engine: EngineConfig::from_env(),
            ledger: LedgerConfig::from_env(),
            schedule: ScheduleConfig::from_env(),
            auth: AuthConfig::from_env(),
            archive_path: std::env::var("CRASH_ARCHIVE_PATH").ok().map(PathBuf::from),
            crash_tiers: std::env::var("CRASH_TIERS").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_fallbacks() {
        std::env::set_var("CRASH_TEST_PARSE_OK", " 250 ");
        std::env::set_var("CRASH_TEST_PARSE_BAD", "lots");

        assert_eq!(env_parse("CRASH_TEST_PARSE_OK", 0u64), 250);
        assert_eq!(env_parse("CRASH_TEST_PARSE_BAD", 7u64), 7);
        assert_eq!(env_parse("CRASH_TEST_PARSE_UNSET", 9u32), 9);
    }

    #[test]
    fn test_env_duration_and_flag() {
        std::env::set_var("CRASH_TEST_WINDOW_MS", "1500");
        std::env::set_var("CRASH_TEST_FLAG", "1");

        assert_eq!(
            env_duration_ms("CRASH_TEST_WINDOW_MS", Duration::from_secs(5)),
            Duration::from_millis(1500)
        );
        assert!(env_flag("CRASH_TEST_FLAG", false));
        assert!(!env_flag("CRASH_TEST_FLAG_UNSET", false));
    }

    #[test]
    fn test_ledger_journal_floor() {
        std::env::set_var("CRASH_LEDGER_JOURNAL", "0");
        assert_eq!(LedgerConfig::from_env().journal_capacity, 1);
        std::env::remove_var("CRASH_LEDGER_JOURNAL");
        assert_eq!(LedgerConfig::from_env().journal_capacity, LedgerConfig::default().journal_capacity);
    }
}
