//! Round Archive
//!
//! Durable record of every finished round: crash point, timing, and each
//! bet's outcome. Enough to audit a round after the fact.
//!
//! Storage technology is behind [`RoundStore`]. Two implementations ship:
//! an in-memory store and an append-only JSON-lines file.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::hash::RecordHasher;
use crate::core::money::{Amount, Multiplier};
use crate::game::bets::{Bet, BetOutcome, CashOut};
use crate::game::round::{RoundId, UserId};
use crate::game::settlement::SettlementFailure;

/// Archive errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Record could not be (de)serialized.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Store temporarily refusing writes.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One bet as archived.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettledBet {
    /// Bettor.
    pub user_id: UserId,
    /// Stake.
    pub amount: Amount,
    /// Cash-out, if any.
    pub cash_out: Option<CashOut>,
    /// Outcome; `None` if settlement is still pending.
    pub outcome: Option<BetOutcome>,
}

impl From<&Bet> for SettledBet {
    fn from(bet: &Bet) -> Self {
        Self {
            user_id: bet.id.user_id,
            amount: bet.amount,
            cash_out: bet.cash_out,
            outcome: bet.outcome,
        }
    }
}

/// Archived round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    /// Round number.
    pub round_id: RoundId,
    /// Crash point.
    pub crash_point: Multiplier,
    /// When the round opened.
    pub created_at: DateTime<Utc>,
    /// When the multiplier started.
    pub started_at: Option<DateTime<Utc>>,
    /// When it crashed.
    pub ended_at: Option<DateTime<Utc>>,
    /// Every bet.
    pub bets: Vec<SettledBet>,
    /// Payouts that could not be applied.
    pub unsettled: Vec<SettlementFailure>,
    /// Sum of stakes.
    pub total_staked: Amount,
    /// Sum of payouts applied.
    pub total_paid: Amount,
    /// Hex SHA-256 over the fields above.
    pub digest: String,
}

impl RoundRecord {
    /// Build a record and seal it with its digest.
    pub fn seal(
        round_id: RoundId,
        crash_point: Multiplier,
        created_at: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
        bets: Vec<SettledBet>,
        unsettled: Vec<SettlementFailure>,
    ) -> Self {
        let total_staked = bets.iter().map(|b| b.amount).sum();
        let total_paid = bets
            .iter()
            .filter_map(|b| match b.outcome {
                Some(BetOutcome::Won { payout }) => Some(payout),
                _ => None,
            })
            .sum();

        let mut record = Self {
            round_id,
            crash_point,
            created_at,
            started_at,
            ended_at,
            bets,
            unsettled,
            total_staked,
            total_paid,
            digest: String::new(),
        };
        record.digest = record.compute_digest();
        record
    }

    /// Digest over the record content (excluding the digest field).
    pub fn compute_digest(&self) -> String {
        let mut h = RecordHasher::for_round_record();
        h.update_u64(self.round_id.0);
        h.update_u32(self.crash_point.hundredths());
        h.update_i64(self.created_at.timestamp_millis());
        h.update_i64(self.started_at.map(|t| t.timestamp_millis()).unwrap_or(-1));
        h.update_i64(self.ended_at.map(|t| t.timestamp_millis()).unwrap_or(-1));

        h.update_u32(self.bets.len() as u32);
        for bet in &self.bets {
            h.update_uuid(bet.user_id.as_bytes());
            h.update_u64(bet.amount);
            h.update_opt_u32(bet.cash_out.map(|c| c.multiplier.hundredths()));
            h.update_u64(bet.cash_out.map(|c| c.elapsed_ms).unwrap_or(0));
            match bet.outcome {
                None => h.update_u8(0),
                Some(BetOutcome::Lost) => h.update_u8(1),
                Some(BetOutcome::Won { payout }) => {
                    h.update_u8(2);
                    h.update_u64(payout);
                }
            }
        }

        h.update_u32(self.unsettled.len() as u32);
        for failure in &self.unsettled {
            h.update_uuid(failure.bet.user_id.as_bytes());
            h.update_u64(failure.payout);
        }

        h.update_u64(self.total_staked);
        h.update_u64(self.total_paid);
        hex::encode(h.finalize())
    }

    /// Whether the stored digest matches the content.
    pub fn verify(&self) -> bool {
        self.digest == self.compute_digest()
    }
}

/// Round archive.
pub trait RoundStore: Send + Sync {
    /// Append a finished round.
    fn append(&self, record: &RoundRecord) -> Result<(), StoreError>;

    /// Most recent records, oldest first.
    fn recent(&self, limit: usize) -> Result<Vec<RoundRecord>, StoreError>;

    /// Record of one round, if archived.
    fn find(&self, round_id: RoundId) -> Result<Option<RoundRecord>, StoreError>;

    /// Highest archived round number.
    fn last_round_id(&self) -> Result<Option<RoundId>, StoreError> {
        Ok(self.recent(1)?.last().map(|r| r.round_id))
    }
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

/// Bounded in-memory archive.
pub struct MemoryRoundStore {
    records: Mutex<VecDeque<RoundRecord>>,
    capacity: usize,
    failures_pending: Mutex<u32>,
}

impl MemoryRoundStore {
    /// Keep at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            failures_pending: Mutex::new(0),
        }
    }

    /// Make the next `count` appends fail (outage simulation).
    pub fn fail_next(&self, count: u32) {
        if let Ok(mut pending) = self.failures_pending.lock() {
            *pending = count;
        }
    }

    fn poisoned() -> StoreError {
        StoreError::Unavailable("memory store lock poisoned".into())
    }
}

impl Default for MemoryRoundStore {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl RoundStore for MemoryRoundStore {
    fn append(&self, record: &RoundRecord) -> Result<(), StoreError> {
        {
            let mut pending = self.failures_pending.lock().map_err(|_| Self::poisoned())?;
            if *pending > 0 {
                *pending -= 1;
                return Err(StoreError::Unavailable("simulated outage".into()));
            }
        }

        let mut records = self.records.lock().map_err(|_| Self::poisoned())?;
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record.clone());
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<RoundRecord>, StoreError> {
        let records = self.records.lock().map_err(|_| Self::poisoned())?;
        let skip = records.len().saturating_sub(limit);
        Ok(records.iter().skip(skip).cloned().collect())
    }

    fn find(&self, round_id: RoundId) -> Result<Option<RoundRecord>, StoreError> {
        let records = self.records.lock().map_err(|_| Self::poisoned())?;
        Ok(records.iter().rev().find(|r| r.round_id == round_id).cloned())
    }
}

// =============================================================================
// JSON-LINES STORE
// =============================================================================

/// Append-only JSON-lines file, one record per line.
pub struct JsonlRoundStore {
    path: PathBuf,
    writer: Mutex<()>,
}

impl JsonlRoundStore {
    /// Store backed by `path`. The file is created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    /// Reader over the archive; `None` until the first append.
    fn open(&self) -> Result<Option<BufReader<File>>, StoreError> {
        match File::open(&self.path) {
            Ok(f) => Ok(Some(BufReader::new(f))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl RoundStore for JsonlRoundStore {
    fn append(&self, record: &RoundRecord) -> Result<(), StoreError> {
        let _guard = self
            .writer
            .lock()
            .map_err(|_| StoreError::Unavailable("writer lock poisoned".into()))?;

        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<RoundRecord>, StoreError> {
        let reader = match self.open()? {
            Some(r) => r,
            None => return Ok(Vec::new()),
        };

        let mut window = VecDeque::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() || limit == 0 {
                continue;
            }
            if window.len() == limit {
                window.pop_front();
            }
            window.push_back(line);
        }
        window
            .iter()
            .map(|line| serde_json::from_str(line).map_err(StoreError::from))
            .collect()
    }

    fn find(&self, round_id: RoundId) -> Result<Option<RoundRecord>, StoreError> {
        let reader = match self.open()? {
            Some(r) => r,
            None => return Ok(None),
        };

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: RoundRecord = serde_json::from_str(&line)?;
            if record.round_id == round_id {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}
