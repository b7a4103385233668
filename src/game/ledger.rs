//! Account Ledger
//!
//! Spendable balances with atomic per-account debit/credit.
//!
//! ## Locking
//!
//! The account map is only write-locked to open accounts. Every balance
//! mutation locks exactly one account, so unrelated accounts never wait on
//! each other.
//!
//! ## Idempotence
//!
//! Every entry carries an [`EntryRef`]. A reference is applied to an account
//! at most once; replaying it returns [`Applied::AlreadyApplied`] without
//! touching the balance. Settlement retries rely on this.
//!
//! ## Retention
//!
//! Each account keeps its newest [`LedgerConfig::journal_capacity`] journal
//! lines. Stake and payout references stay in the applied set until the
//! engine releases their round with [`Ledger::release_rounds_before`]; after
//! that a replay of those references is no longer recognised, so callers
//! must not replay rounds older than the release horizon. Deposit and
//! adjustment references are kept for the life of the process.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::core::money::Amount;
use crate::game::round::{BetId, RoundId, UserId};

/// What a ledger entry is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryRef {
    /// Stake escrowed when a bet is placed.
    Stake {
        /// Bet the stake belongs to.
        bet: BetId,
    },
    /// Winnings credited at settlement.
    Payout {
        /// Bet being paid.
        bet: BetId,
    },
    /// Funds added from outside the game.
    Deposit {
        /// External deposit identifier.
        id: uuid::Uuid,
    },
    /// Operator balance correction.
    Adjustment {
        /// Operator-chosen identifier; replays are no-ops.
        id: uuid::Uuid,
    },
}

impl EntryRef {
    /// Round a stake or payout belongs to.
    pub fn round_id(&self) -> Option<RoundId> {
        match self {
            EntryRef::Stake { bet } | EntryRef::Payout { bet } => Some(bet.round_id),
            EntryRef::Deposit { .. } | EntryRef::Adjustment { .. } => None,
        }
    }
}

/// Direction of an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryDirection {
    /// Balance decreased.
    Debit,
    /// Balance increased.
    Credit,
}

/// One journal line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Attribution.
    pub reference: EntryRef,
    /// Debit or credit.
    pub direction: EntryDirection,
    /// Amount moved.
    pub amount: Amount,
    /// Balance after this entry.
    pub balance_after: Amount,
    /// When it was applied.
    pub at: DateTime<Utc>,
    /// Operator note, for adjustments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

/// Outcome of a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// Entry applied; new balance.
    Applied(Amount),
    /// Reference already applied earlier; balance unchanged.
    AlreadyApplied(Amount),
}

impl Applied {
    /// Balance after the call.
    pub fn balance(self) -> Amount {
        match self {
            Applied::Applied(b) | Applied::AlreadyApplied(b) => b,
        }
    }
}

/// Ledger errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// No such account.
    #[error("unknown account {0}")]
    UnknownAccount(UserId),
    /// Debit larger than the balance.
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds {
        /// Requested debit.
        needed: Amount,
        /// Current balance.
        available: Amount,
    },
    /// Account frozen; no mutations allowed.
    #[error("account {0} is frozen")]
    Frozen(UserId),
    /// Credit would overflow the balance.
    #[error("balance overflow")]
    Overflow,
    /// Zero-amount entries are rejected.
    #[error("amount must be positive")]
    ZeroAmount,
}

/// Ledger limits.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Journal lines kept per account; older lines are dropped.
    pub journal_capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { journal_capacity: 500 }
    }
}

/// A single account.
#[derive(Debug)]
struct Account {
    balance: Amount,
    frozen: bool,
    applied: BTreeSet<EntryRef>,
    journal: VecDeque<LedgerEntry>,
}

impl Account {
    fn new() -> Self {
        Self {
            balance: 0,
            frozen: false,
            applied: BTreeSet::new(),
            journal: VecDeque::new(),
        }
    }

    fn record(
        &mut self,
        reference: EntryRef,
        direction: EntryDirection,
        amount: Amount,
        memo: Option<String>,
        capacity: usize,
    ) {
        self.applied.insert(reference);
        while self.journal.len() >= capacity.max(1) {
            self.journal.pop_front();
        }
        self.journal.push_back(LedgerEntry {
            reference,
            direction,
            amount,
            balance_after: self.balance,
            at: Utc::now(),
            memo,
        });
    }
}

/// Public account view.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountSnapshot {
    /// Owner.
    pub user_id: UserId,
    /// Spendable balance.
    pub balance: Amount,
    /// Frozen flag.
    pub frozen: bool,
}

/// The shared ledger.
pub struct Ledger {
    config: LedgerConfig,
    accounts: RwLock<BTreeMap<UserId, Arc<Mutex<Account>>>>,
}

impl Ledger {
    /// Create an empty ledger with default limits.
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    /// Create an empty ledger.
    pub fn with_config(config: LedgerConfig) -> Self {
        Self {
            config,
            accounts: RwLock::new(BTreeMap::new()),
        }
    }

    /// Open an account with a zero balance. Returns false if it already exists.
    pub async fn open_account(&self, user_id: UserId) -> bool {
        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(&user_id) {
            return false;
        }
        accounts.insert(user_id, Arc::new(Mutex::new(Account::new())));
        debug!("Opened account {}", user_id.short());
        true
    }

    async fn account(&self, user_id: &UserId) -> Result<Arc<Mutex<Account>>, LedgerError> {
        let accounts = self.accounts.read().await;
        accounts
            .get(user_id)
            .cloned()
            .ok_or(LedgerError::UnknownAccount(*user_id))
    }

    /// Credit funds from outside the game.
    pub async fn deposit(
        &self,
        user_id: UserId,
        amount: Amount,
        deposit_id: uuid::Uuid,
    ) -> Result<Applied, LedgerError> {
        self.credit(user_id, amount, EntryRef::Deposit { id: deposit_id }).await
    }

    /// Operator correction: positive `delta` credits, negative debits.
    ///
    /// Attributed to `id` with `reason` in the journal; replaying the same
    /// `id` returns [`Applied::AlreadyApplied`].
    pub async fn adjust(
        &self,
        user_id: UserId,
        delta: i64,
        id: uuid::Uuid,
        reason: &str,
    ) -> Result<Applied, LedgerError> {
        let reference = EntryRef::Adjustment { id };
        let memo = Some(reason.to_string());
        let amount = delta.unsigned_abs();
        if delta >= 0 {
            self.apply_credit(user_id, amount, reference, memo).await
        } else {
            self.apply_debit(user_id, amount, reference, memo).await
        }
    }

    /// Atomically debit `amount`, failing without side effects if the
    /// balance is too low.
    pub async fn debit(
        &self,
        user_id: UserId,
        amount: Amount,
        reference: EntryRef,
    ) -> Result<Applied, LedgerError> {
        self.apply_debit(user_id, amount, reference, None).await
    }

    /// Atomically credit `amount`.
    pub async fn credit(
        &self,
        user_id: UserId,
        amount: Amount,
        reference: EntryRef,
    ) -> Result<Applied, LedgerError> {
        self.apply_credit(user_id, amount, reference, None).await
    }

    async fn apply_debit(
        &self,
        user_id: UserId,
        amount: Amount,
        reference: EntryRef,
        memo: Option<String>,
    ) -> Result<Applied, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }

        let account = self.account(&user_id).await?;
        let mut account = account.lock().await;

        if account.applied.contains(&reference) {
            return Ok(Applied::AlreadyApplied(account.balance));
        }
        if account.frozen {
            return Err(LedgerError::Frozen(user_id));
        }
        if account.balance < amount {
            return Err(LedgerError::InsufficientFunds {
                needed: amount,
                available: account.balance,
            });
        }

        account.balance -= amount;
        account.record(reference, EntryDirection::Debit, amount, memo, self.config.journal_capacity);
        Ok(Applied::Applied(account.balance))
    }

    async fn apply_credit(
        &self,
        user_id: UserId,
        amount: Amount,
        reference: EntryRef,
        memo: Option<String>,
    ) -> Result<Applied, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }

        let account = self.account(&user_id).await?;
        let mut account = account.lock().await;

        if account.applied.contains(&reference) {
            return Ok(Applied::AlreadyApplied(account.balance));
        }
        if account.frozen {
            warn!("Credit to frozen account {} held back", user_id.short());
            return Err(LedgerError::Frozen(user_id));
        }

        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        account.record(reference, EntryDirection::Credit, amount, memo, self.config.journal_capacity);
        Ok(Applied::Applied(account.balance))
    }

    /// Freeze or unfreeze an account.
    pub async fn set_frozen(&self, user_id: UserId, frozen: bool) -> Result<(), LedgerError> {
        let account = self.account(&user_id).await?;
        account.lock().await.frozen = frozen;
        Ok(())
    }

    /// Current balance.
    pub async fn balance(&self, user_id: &UserId) -> Option<Amount> {
        let account = self.account(user_id).await.ok()?;
        let balance = account.lock().await.balance;
        Some(balance)
    }

    /// Whether a reference has been applied to an account.
    pub async fn has_entry(&self, user_id: &UserId, reference: &EntryRef) -> bool {
        match self.account(user_id).await {
            Ok(account) => account.lock().await.applied.contains(reference),
            Err(_) => false,
        }
    }

    /// Copy of an account's retained journal, oldest first.
    pub async fn journal(&self, user_id: &UserId) -> Vec<LedgerEntry> {
        match self.account(user_id).await {
            Ok(account) => account.lock().await.journal.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Forget stake and payout references of rounds before `cutoff`.
    ///
    /// Returns how many references were dropped.
    pub async fn release_rounds_before(&self, cutoff: RoundId) -> usize {
        let handles: Vec<_> = {
            let accounts = self.accounts.read().await;
            accounts.values().cloned().collect()
        };

        let mut released = 0;
        for account in handles {
            let mut account = account.lock().await;
            let before = account.applied.len();
            account
                .applied
                .retain(|r| r.round_id().map_or(true, |round| round >= cutoff));
            released += before - account.applied.len();
        }
        if released > 0 {
            debug!("Released {} ledger references before round {}", released, cutoff);
        }
        released
    }

    /// Applied references held for an account.
    pub async fn reference_count(&self, user_id: &UserId) -> usize {
        match self.account(user_id).await {
            Ok(account) => account.lock().await.applied.len(),
            Err(_) => 0,
        }
    }

    /// Snapshot of every account.
    pub async fn snapshot(&self) -> Vec<AccountSnapshot> {
        let handles: Vec<_> = {
            let accounts = self.accounts.read().await;
            accounts.iter().map(|(id, a)| (*id, a.clone())).collect()
        };

        let mut out = Vec::with_capacity(handles.len());
        for (user_id, account) in handles {
            let account = account.lock().await;
            out.push(AccountSnapshot {
                user_id,
                balance: account.balance,
                frozen: account.frozen,
            });
        }
        out
    }

    /// Sum of all balances.
    pub async fn total_balance(&self) -> Amount {
        self.snapshot().await.iter().map(|a| a.balance).sum()
    }

    /// Number of accounts.
    pub async fn account_count(&self) -> usize {
        self.accounts.read().await.len()
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}
