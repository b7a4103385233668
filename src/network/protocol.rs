//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Text frames carry JSON tagged by `"type"`; binary frames carry bincode.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::core::money::{Amount, Multiplier};
use crate::game::bets::BetError;
use crate::game::engine::{EngineError, RoundSnapshot};
use crate::game::events::RoundEvent;
use crate::game::ledger::LedgerError;
use crate::game::round::{RoundId, UserId};
use crate::game::settlement::SettlementReport;
use crate::game::store::RoundRecord;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with the server.
    Auth(AuthRequest),

    /// Bet on the round currently taking bets.
    PlaceBet {
        /// Round the client believes is open.
        round_id: RoundId,
        /// Stake in minor units.
        amount: Amount,
    },

    /// Cash out of the running round.
    CashOut {
        /// Round being cashed out of.
        round_id: RoundId,
    },

    /// Current balance.
    Balance,

    /// Recent crash history.
    History {
        /// How many rounds (server caps it).
        #[serde(default)]
        limit: Option<u32>,
    },

    /// Current round view.
    Snapshot,

    /// Admin: enable or pause new rounds.
    SetEnabled {
        /// New state.
        enabled: bool,
    },

    /// Admin: freeze or unfreeze an account.
    FreezeAccount {
        /// Target account.
        user_id: UserId,
        /// New state.
        frozen: bool,
    },

    /// Admin: credit (positive) or debit (negative) an account.
    AdjustBalance {
        /// Target account.
        user_id: UserId,
        /// Signed amount in minor units.
        amount: i64,
        /// Shown in the account journal.
        reason: String,
        /// Replays with the same id apply once.
        adjustment_id: uuid::Uuid,
    },

    /// Admin: pay the payouts an archived round left unsettled.
    Resettle {
        /// Archived round.
        round_id: RoundId,
    },

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp, echoed back.
        timestamp: u64,
    },
}

/// Authentication request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// JWT, or a user UUID when guests are allowed.
    pub token: String,
    /// Client version for compatibility check.
    #[serde(default)]
    pub client_version: String,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication result.
    AuthResult(AuthResult),

    /// Bet accepted; stake debited.
    BetAccepted {
        /// Round.
        round_id: RoundId,
        /// Stake.
        amount: Amount,
        /// Balance after the debit.
        balance: Amount,
    },

    /// Cash-out accepted.
    CashedOut {
        /// Round.
        round_id: RoundId,
        /// Locked-in multiplier.
        multiplier: Multiplier,
    },

    /// Balance reply.
    Balance {
        /// Current balance.
        balance: Amount,
    },

    /// History reply, oldest first.
    History {
        /// Finished rounds.
        rounds: Vec<HistoryEntry>,
    },

    /// Snapshot reply.
    Snapshot {
        /// Current round, if any.
        round: Option<RoundSnapshot>,
    },

    /// Game enabled state.
    GameStatus {
        /// Whether new rounds open.
        enabled: bool,
    },

    /// Account freeze acknowledged.
    AccountStatus {
        /// Account.
        user_id: UserId,
        /// Whether frozen.
        frozen: bool,
    },

    /// Adjustment acknowledged.
    BalanceAdjusted {
        /// Account.
        user_id: UserId,
        /// Balance afterwards.
        balance: Amount,
        /// False when the adjustment id was already applied.
        applied: bool,
    },

    /// Resettle pass finished.
    Resettled {
        /// Round.
        round_id: RoundId,
        /// Outcome of this pass.
        report: SettlementReport,
    },

    /// Round lifecycle or player event.
    Event(RoundEvent),

    /// Error.
    Error(ServerError),

    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server time (Unix millis).
        server_time: u64,
    },

    /// Server is shutting down.
    Shutdown {
        /// Reason.
        reason: String,
    },
}

/// Authentication result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResult {
    /// Whether auth succeeded.
    pub success: bool,
    /// Account the connection is bound to.
    pub user_id: Option<UserId>,
    /// Balance at login.
    pub balance: Option<Amount>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// One finished round in a history reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Round.
    pub round_id: RoundId,
    /// Crash point.
    pub crash_point: Multiplier,
    /// Crash time.
    pub ended_at: Option<DateTime<Utc>>,
    /// Bets placed.
    pub bets: u32,
    /// Sum of stakes.
    pub total_staked: Amount,
    /// Sum of payouts.
    pub total_paid: Amount,
}

impl From<&RoundRecord> for HistoryEntry {
    fn from(record: &RoundRecord) -> Self {
        Self {
            round_id: record.round_id,
            crash_point: record.crash_point,
            ended_at: record.ended_at,
            bets: record.bets.len() as u32,
            total_staked: record.total_staked,
            total_paid: record.total_paid,
        }
    }
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    /// Build an error reply.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl From<&BetError> for ServerError {
    fn from(err: &BetError) -> Self {
        let code = match err {
            BetError::WrongPhase => ErrorCode::WrongPhase,
            BetError::DuplicateBet => ErrorCode::DuplicateBet,
            BetError::NoActiveBet => ErrorCode::NoActiveBet,
            BetError::InsufficientFunds => ErrorCode::InsufficientFunds,
            BetError::BetOutOfRange { .. } => ErrorCode::BetOutOfRange,
            BetError::AccountFrozen => ErrorCode::AccountFrozen,
            BetError::UnknownAccount => ErrorCode::UnknownAccount,
        };
        Self::new(code, err.to_string())
    }
}

impl From<&LedgerError> for ServerError {
    fn from(err: &LedgerError) -> Self {
        let code = match err {
            LedgerError::UnknownAccount(_) => ErrorCode::UnknownAccount,
            LedgerError::InsufficientFunds { .. } => ErrorCode::InsufficientFunds,
            LedgerError::Frozen(_) => ErrorCode::AccountFrozen,
            LedgerError::ZeroAmount => ErrorCode::InvalidInput,
            LedgerError::Overflow => ErrorCode::InternalError,
        };
        Self::new(code, err.to_string())
    }
}

impl From<&EngineError> for ServerError {
    fn from(err: &EngineError) -> Self {
        let code = match err {
            EngineError::UnknownRound(_) | EngineError::RoundExpired { .. } => ErrorCode::UnknownRound,
            EngineError::InvalidTransition { .. } | EngineError::NoRound => ErrorCode::WrongPhase,
            EngineError::Tampered(_) | EngineError::Store(_) => ErrorCode::InternalError,
        };
        Self::new(code, err.to_string())
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// Not authenticated.
    NotAuthenticated,
    /// JWT token has expired.
    TokenExpired,
    /// Invalid JWT token (signature, format, claims).
    InvalidToken,
    /// Malformed message.
    InvalidInput,
    /// Wrong phase or stale round.
    WrongPhase,
    /// Second bet in the same round.
    DuplicateBet,
    /// Nothing to cash out.
    NoActiveBet,
    /// Balance below the stake.
    InsufficientFunds,
    /// Stake outside limits.
    BetOutOfRange,
    /// Account frozen.
    AccountFrozen,
    /// No such account.
    UnknownAccount,
    /// Admin-only action.
    Forbidden,
    /// Round not archived, or too old to resettle.
    UnknownRound,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Decode a binary frame.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize::<BinaryCommand>(data).map(ClientMessage::from)
    }
}

/// Hot-path commands accepted in binary frames.
///
/// Externally tagged so bincode can decode it; the JSON messages above use
/// internal tags, which bincode cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryCommand {
    /// See [`ClientMessage::PlaceBet`].
    PlaceBet {
        /// Round.
        round_id: RoundId,
        /// Stake.
        amount: Amount,
    },
    /// See [`ClientMessage::CashOut`].
    CashOut {
        /// Round.
        round_id: RoundId,
    },
    /// See [`ClientMessage::Ping`].
    Ping {
        /// Client timestamp.
        timestamp: u64,
    },
}

impl BinaryCommand {
    /// Encode as a binary frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }
}

impl From<BinaryCommand> for ClientMessage {
    fn from(cmd: BinaryCommand) -> Self {
        match cmd {
            BinaryCommand::PlaceBet { round_id, amount } => ClientMessage::PlaceBet { round_id, amount },
            BinaryCommand::CashOut { round_id } => ClientMessage::CashOut { round_id },
            BinaryCommand::Ping { timestamp } => ClientMessage::Ping { timestamp },
        }
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Error reply shorthand.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError::new(code, message))
    }
}
