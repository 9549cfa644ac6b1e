//! Durable records and the storage contract.
//!
//! The `Store` trait covers wallet, bet and cycle persistence behind one
//! seam so the engine and lifecycle manager stay backend-agnostic. Composed
//! edges — activating pending bets while flipping the cycle to flying,
//! voiding a cycle with its refunds — are single methods so each backend
//! can make them atomic.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::money::{Amount, Multiplier};

pub type UserId = Uuid;
pub type BetId = Uuid;
pub type CycleId = Uuid;

/// Wallet transaction kind. Append-only records carry the unsigned amount;
/// the kind decides the sign in the ledger sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxKind {
    Deposit,
    Withdraw,
    BetDebit,
    CashoutCredit,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Deposit => "deposit",
            TxKind::Withdraw => "withdraw",
            TxKind::BetDebit => "bet-debit",
            TxKind::CashoutCredit => "cashout-credit",
        }
    }

    pub fn parse(text: &str) -> Option<TxKind> {
        match text {
            "deposit" => Some(TxKind::Deposit),
            "withdraw" => Some(TxKind::Withdraw),
            "bet-debit" => Some(TxKind::BetDebit),
            "cashout-credit" => Some(TxKind::CashoutCredit),
            _ => None,
        }
    }

    /// Signed contribution of a transaction of this kind to the balance.
    pub fn signed(&self, amount: Amount) -> i64 {
        match self {
            TxKind::Deposit | TxKind::CashoutCredit => amount.cents(),
            TxKind::Withdraw | TxKind::BetDebit => -amount.cents(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTx {
    pub id: Uuid,
    pub user_id: UserId,
    pub amount: Amount,
    pub kind: TxKind,
    pub correlation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetState {
    Pending,
    Active,
    Won,
    Lost,
    Refunded,
}

impl BetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetState::Pending => "pending",
            BetState::Active => "active",
            BetState::Won => "won",
            BetState::Lost => "lost",
            BetState::Refunded => "refunded",
        }
    }

    pub fn parse(text: &str) -> Option<BetState> {
        match text {
            "pending" => Some(BetState::Pending),
            "active" => Some(BetState::Active),
            "won" => Some(BetState::Won),
            "lost" => Some(BetState::Lost),
            "refunded" => Some(BetState::Refunded),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BetState::Won | BetState::Lost | BetState::Refunded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetRecord {
    pub id: BetId,
    /// Store-assigned, monotonic within the process; orders bets in a cycle.
    pub seq: i64,
    pub user_id: UserId,
    /// None while pending and queued for the next cycle.
    pub cycle_id: Option<CycleId>,
    pub stake: Amount,
    pub auto_cashout: Option<Multiplier>,
    pub state: BetState,
    pub cashout_multiplier: Option<Multiplier>,
    pub payout: Option<Amount>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl BetRecord {
    pub fn pending(
        user_id: UserId,
        cycle_id: Option<CycleId>,
        stake: Amount,
        auto_cashout: Option<Multiplier>,
    ) -> Self {
        BetRecord {
            id: Uuid::new_v4(),
            seq: 0,
            user_id,
            cycle_id,
            stake,
            auto_cashout,
            state: BetState::Pending,
            cashout_multiplier: None,
            payout: None,
            created_at: Utc::now(),
            settled_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleState {
    Betting,
    Flying,
    Crashed,
    Completed,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Betting => "betting",
            CycleState::Flying => "flying",
            CycleState::Crashed => "crashed",
            CycleState::Completed => "completed",
        }
    }

    pub fn parse(text: &str) -> Option<CycleState> {
        match text {
            "betting" => Some(CycleState::Betting),
            "flying" => Some(CycleState::Flying),
            "crashed" => Some(CycleState::Crashed),
            "completed" => Some(CycleState::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub id: CycleId,
    pub state: CycleState,
    /// Seed and hash kept hex-encoded for post-hoc crash-point verification.
    pub seed_hex: String,
    pub hash_hex: String,
    pub crash_point: Option<Multiplier>,
    pub created_at: DateTime<Utc>,
    pub flew_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub enum SettleOutcome {
    Won(Multiplier),
    Lost,
}

/// Page window for history queries.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Page { limit: 100, offset: 0 }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // --- wallet ledger ---

    /// Unconditional atomic credit; returns the new balance.
    async fn credit(
        &self,
        user: UserId,
        amount: Amount,
        kind: TxKind,
        correlation: Option<Uuid>,
    ) -> Result<Amount, StoreError>;

    /// Atomic debit; fails with `InsufficientFunds` when balance < amount.
    async fn debit(
        &self,
        user: UserId,
        amount: Amount,
        kind: TxKind,
        correlation: Option<Uuid>,
    ) -> Result<Amount, StoreError>;

    async fn balance_of(&self, user: UserId) -> Result<Amount, StoreError>;

    /// Most recent transactions first.
    async fn wallet_history(&self, user: UserId, page: Page) -> Result<Vec<WalletTx>, StoreError>;

    // --- bet store ---

    /// Persist a pending bet; the store assigns `seq` and returns the row.
    async fn create_bet(&self, bet: BetRecord) -> Result<BetRecord, StoreError>;

    /// Atomically flip the cycle betting→flying and activate every pending
    /// bet that is unbound or bound to it. Returns the activated rows in
    /// `seq` order for hot-bet hydration.
    async fn activate_pending(
        &self,
        cycle: CycleId,
        flew_at: DateTime<Utc>,
    ) -> Result<Vec<BetRecord>, StoreError>;

    /// Settle an active bet. Only active→won and active→lost are legal; a
    /// terminal row yields `AlreadySettled` and is left untouched. On won,
    /// the store computes payout = round(stake × multiplier).
    async fn settle_bet(
        &self,
        bet: BetId,
        outcome: SettleOutcome,
        at: DateTime<Utc>,
    ) -> Result<BetRecord, StoreError>;

    async fn find_bet(&self, bet: BetId) -> Result<Option<BetRecord>, StoreError>;

    async fn list_active_bets(&self, cycle: CycleId) -> Result<Vec<BetRecord>, StoreError>;

    async fn list_bets_by_user(&self, user: UserId, page: Page)
        -> Result<Vec<BetRecord>, StoreError>;

    /// Open (non-terminal) bets a user holds toward a target cycle.
    /// `Some(cycle)` counts bets bound to that open betting cycle plus
    /// unbound pending ones; `None` targets the next cycle and counts only
    /// unbound pending bets.
    async fn count_open_bets(
        &self,
        user: UserId,
        cycle: Option<CycleId>,
    ) -> Result<usize, StoreError>;

    // --- cycle store ---

    async fn insert_cycle(&self, cycle: &CycleRecord) -> Result<(), StoreError>;

    /// flying→crashed with the final crash point.
    async fn finish_cycle(
        &self,
        cycle: CycleId,
        crash_point: Multiplier,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// crashed→completed.
    async fn complete_cycle(&self, cycle: CycleId) -> Result<(), StoreError>;

    async fn find_cycle(&self, cycle: CycleId) -> Result<Option<CycleRecord>, StoreError>;

    /// The at-most-one cycle not yet completed, if any.
    async fn find_unfinished_cycle(&self) -> Result<Option<CycleRecord>, StoreError>;

    /// Force a cycle to completed with crash point 1.00 and mark every
    /// non-terminal bet bound to it (or pending unbound) refunded. Returns
    /// the refunded rows so the caller can credit stakes back. Used by the
    /// lock-failure abort and by restart recovery.
    async fn void_cycle(
        &self,
        cycle: CycleId,
        at: DateTime<Utc>,
    ) -> Result<Vec<BetRecord>, StoreError>;
}

/// Restart recovery: void any cycle a previous process left unfinished and
/// return every open stake to its wallet. Yields the voided cycle id so
/// the caller can broadcast it.
pub async fn recover_unfinished(store: &dyn Store) -> Result<Option<CycleId>, StoreError> {
    let Some(cycle) = store.find_unfinished_cycle().await? else {
        return Ok(None);
    };
    let refunded = store.void_cycle(cycle.id, Utc::now()).await?;
    for bet in &refunded {
        store
            .credit(bet.user_id, bet.stake, TxKind::Deposit, Some(bet.id))
            .await?;
    }
    Ok(Some(cycle.id))
}
