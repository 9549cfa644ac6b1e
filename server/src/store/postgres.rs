//! Postgres store.
//!
//! Runtime (non-macro) sqlx queries; wallet mutations take a row-level
//! `FOR UPDATE` lock so concurrent writes to one wallet are totally
//! ordered, and the composed edges run inside a single transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;
use crate::money::{Amount, Multiplier};
use crate::store::{
    BetId, BetRecord, BetState, CycleId, CycleRecord, CycleState, Page, SettleOutcome, Store,
    TxKind, UserId, WalletTx,
};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BACKOFF_MS: u64 = 1_000;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS wallets (
        user_id UUID PRIMARY KEY,
        balance_cents BIGINT NOT NULL DEFAULT 0 CHECK (balance_cents >= 0),
        version BIGINT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS wallet_txs (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        amount_cents BIGINT NOT NULL CHECK (amount_cents >= 0),
        kind TEXT NOT NULL,
        correlation_id UUID,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS wallet_txs_user_created
        ON wallet_txs (user_id, created_at DESC)",
    "CREATE TABLE IF NOT EXISTS bets (
        id UUID PRIMARY KEY,
        seq BIGSERIAL,
        user_id UUID NOT NULL,
        cycle_id UUID,
        stake_cents BIGINT NOT NULL,
        auto_cashout_hundredths BIGINT,
        state TEXT NOT NULL,
        cashout_multiplier_hundredths BIGINT,
        payout_cents BIGINT,
        created_at TIMESTAMPTZ NOT NULL,
        settled_at TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS bets_user_seq ON bets (user_id, seq DESC)",
    "CREATE INDEX IF NOT EXISTS bets_cycle_state ON bets (cycle_id, state)",
    "CREATE TABLE IF NOT EXISTS cycles (
        id UUID PRIMARY KEY,
        state TEXT NOT NULL,
        seed_hex TEXT NOT NULL,
        hash_hex TEXT NOT NULL,
        crash_point_hundredths BIGINT,
        created_at TIMESTAMPTZ NOT NULL,
        flew_at TIMESTAMPTZ,
        ended_at TIMESTAMPTZ
    )",
];

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with retries and bootstrap the schema. A pool of roughly
    /// 4×cores, at least 4 connections.
    pub async fn connect(dsn: &str) -> Result<PgStore, StoreError> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let pool_size = (cores * 4).max(4) as u32;

        let mut attempt = 0;
        let pool = loop {
            attempt += 1;
            match PgPoolOptions::new()
                .max_connections(pool_size)
                .connect(dsn)
                .await
            {
                Ok(pool) => break pool,
                Err(err) if attempt < CONNECT_ATTEMPTS => {
                    warn!(attempt, error = %err, "database connect failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(
                        CONNECT_BACKOFF_MS * attempt as u64,
                    ))
                    .await;
                }
                Err(err) => return Err(err.into()),
            }
        };

        let store = PgStore { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn mutate_wallet(
        &self,
        user: UserId,
        amount: Amount,
        kind: TxKind,
        correlation: Option<Uuid>,
    ) -> Result<Amount, StoreError> {
        if amount.is_negative() {
            return Err(StoreError::NegativeAmount);
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO wallets (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user)
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query("SELECT balance_cents FROM wallets WHERE user_id = $1 FOR UPDATE")
            .bind(user)
            .fetch_one(&mut *tx)
            .await?;
        let balance: i64 = row.try_get("balance_cents")?;

        let delta = kind.signed(amount);
        if delta < 0 && balance < amount.cents() {
            return Err(StoreError::InsufficientFunds);
        }
        let new_balance = balance.checked_add(delta).ok_or(StoreError::Overflow)?;

        sqlx::query("UPDATE wallets SET balance_cents = $2, version = version + 1 WHERE user_id = $1")
            .bind(user)
            .bind(new_balance)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO wallet_txs (id, user_id, amount_cents, kind, correlation_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(Uuid::new_v4())
        .bind(user)
        .bind(amount.cents())
        .bind(kind.as_str())
        .bind(correlation)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        #[cfg(debug_assertions)]
        {
            let row = sqlx::query(
                "SELECT COALESCE(SUM(CASE WHEN kind IN ('deposit', 'cashout-credit')
                        THEN amount_cents ELSE -amount_cents END), 0) AS ledger_sum
                 FROM wallet_txs WHERE user_id = $1",
            )
            .bind(user)
            .fetch_one(&mut *tx)
            .await?;
            let ledger_sum: i64 = row.try_get("ledger_sum")?;
            debug_assert_eq!(ledger_sum, new_balance, "ledger sum diverged from balance");
        }

        tx.commit().await?;
        Ok(Amount::from_cents(new_balance))
    }
}

fn bet_from_row(row: &PgRow) -> Result<BetRecord, StoreError> {
    let state_text: String = row.try_get("state")?;
    let state = BetState::parse(&state_text)
        .ok_or_else(|| StoreError::Database(format!("unknown bet state: {state_text}")))?;
    Ok(BetRecord {
        id: row.try_get("id")?,
        seq: row.try_get("seq")?,
        user_id: row.try_get("user_id")?,
        cycle_id: row.try_get("cycle_id")?,
        stake: Amount::from_cents(row.try_get("stake_cents")?),
        auto_cashout: row
            .try_get::<Option<i64>, _>("auto_cashout_hundredths")?
            .map(|h| Multiplier::from_hundredths(h as u32)),
        state,
        cashout_multiplier: row
            .try_get::<Option<i64>, _>("cashout_multiplier_hundredths")?
            .map(|h| Multiplier::from_hundredths(h as u32)),
        payout: row
            .try_get::<Option<i64>, _>("payout_cents")?
            .map(Amount::from_cents),
        created_at: row.try_get("created_at")?,
        settled_at: row.try_get("settled_at")?,
    })
}

fn cycle_from_row(row: &PgRow) -> Result<CycleRecord, StoreError> {
    let state_text: String = row.try_get("state")?;
    let state = CycleState::parse(&state_text)
        .ok_or_else(|| StoreError::Database(format!("unknown cycle state: {state_text}")))?;
    Ok(CycleRecord {
        id: row.try_get("id")?,
        state,
        seed_hex: row.try_get("seed_hex")?,
        hash_hex: row.try_get("hash_hex")?,
        crash_point: row
            .try_get::<Option<i64>, _>("crash_point_hundredths")?
            .map(|h| Multiplier::from_hundredths(h as u32)),
        created_at: row.try_get("created_at")?,
        flew_at: row.try_get("flew_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}

fn tx_from_row(row: &PgRow) -> Result<WalletTx, StoreError> {
    let kind_text: String = row.try_get("kind")?;
    let kind = TxKind::parse(&kind_text)
        .ok_or_else(|| StoreError::Database(format!("unknown tx kind: {kind_text}")))?;
    Ok(WalletTx {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        amount: Amount::from_cents(row.try_get("amount_cents")?),
        kind,
        correlation_id: row.try_get("correlation_id")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn credit(
        &self,
        user: UserId,
        amount: Amount,
        kind: TxKind,
        correlation: Option<Uuid>,
    ) -> Result<Amount, StoreError> {
        self.mutate_wallet(user, amount, kind, correlation).await
    }

    async fn debit(
        &self,
        user: UserId,
        amount: Amount,
        kind: TxKind,
        correlation: Option<Uuid>,
    ) -> Result<Amount, StoreError> {
        self.mutate_wallet(user, amount, kind, correlation).await
    }

    async fn balance_of(&self, user: UserId) -> Result<Amount, StoreError> {
        let row = sqlx::query("SELECT balance_cents FROM wallets WHERE user_id = $1")
            .bind(user)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Amount::from_cents(row.try_get("balance_cents")?)),
            None => Ok(Amount::ZERO),
        }
    }

    async fn wallet_history(&self, user: UserId, page: Page) -> Result<Vec<WalletTx>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, user_id, amount_cents, kind, correlation_id, created_at
             FROM wallet_txs WHERE user_id = $1
             ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(user)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(tx_from_row).collect()
    }

    async fn create_bet(&self, mut bet: BetRecord) -> Result<BetRecord, StoreError> {
        let row = sqlx::query(
            "INSERT INTO bets (id, user_id, cycle_id, stake_cents, auto_cashout_hundredths,
                               state, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING seq",
        )
        .bind(bet.id)
        .bind(bet.user_id)
        .bind(bet.cycle_id)
        .bind(bet.stake.cents())
        .bind(bet.auto_cashout.map(|m| m.hundredths() as i64))
        .bind(bet.state.as_str())
        .bind(bet.created_at)
        .fetch_one(&self.pool)
        .await?;
        bet.seq = row.try_get("seq")?;
        Ok(bet)
    }

    async fn activate_pending(
        &self,
        cycle: CycleId,
        flew_at: DateTime<Utc>,
    ) -> Result<Vec<BetRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let flipped = sqlx::query(
            "UPDATE cycles SET state = 'flying', flew_at = $2
             WHERE id = $1 AND state = 'betting'",
        )
        .bind(cycle)
        .bind(flew_at)
        .execute(&mut *tx)
        .await?;
        if flipped.rows_affected() == 0 {
            return Err(StoreError::IllegalTransition("cycle is not in betting"));
        }
        let rows = sqlx::query(
            "UPDATE bets SET state = 'active', cycle_id = $1
             WHERE state = 'pending' AND (cycle_id IS NULL OR cycle_id = $1)
             RETURNING *",
        )
        .bind(cycle)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut activated: Vec<BetRecord> =
            rows.iter().map(bet_from_row).collect::<Result<_, _>>()?;
        activated.sort_by_key(|bet| bet.seq);
        Ok(activated)
    }

    async fn settle_bet(
        &self,
        bet: BetId,
        outcome: SettleOutcome,
        at: DateTime<Utc>,
    ) -> Result<BetRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM bets WHERE id = $1 FOR UPDATE")
            .bind(bet)
            .fetch_optional(&mut *tx)
            .await?;
        let record = match row {
            Some(ref row) => bet_from_row(row)?,
            None => return Err(StoreError::NotFound),
        };
        match record.state {
            BetState::Active => {}
            BetState::Won | BetState::Lost | BetState::Refunded => {
                return Err(StoreError::AlreadySettled)
            }
            BetState::Pending => {
                return Err(StoreError::IllegalTransition("pending bet cannot settle"))
            }
        }

        let updated = match outcome {
            SettleOutcome::Won(multiplier) => {
                let payout = record.stake.mul_multiplier(multiplier);
                sqlx::query(
                    "UPDATE bets SET state = 'won', cashout_multiplier_hundredths = $2,
                            payout_cents = $3, settled_at = $4
                     WHERE id = $1 RETURNING *",
                )
                .bind(bet)
                .bind(multiplier.hundredths() as i64)
                .bind(payout.cents())
                .bind(at)
                .fetch_one(&mut *tx)
                .await?
            }
            SettleOutcome::Lost => {
                sqlx::query("UPDATE bets SET state = 'lost', settled_at = $2 WHERE id = $1 RETURNING *")
                    .bind(bet)
                    .bind(at)
                    .fetch_one(&mut *tx)
                    .await?
            }
        };
        tx.commit().await?;
        bet_from_row(&updated)
    }

    async fn find_bet(&self, bet: BetId) -> Result<Option<BetRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM bets WHERE id = $1")
            .bind(bet)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(bet_from_row).transpose()
    }

    async fn list_active_bets(&self, cycle: CycleId) -> Result<Vec<BetRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM bets WHERE cycle_id = $1 AND state = 'active' ORDER BY seq",
        )
        .bind(cycle)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(bet_from_row).collect()
    }

    async fn list_bets_by_user(
        &self,
        user: UserId,
        page: Page,
    ) -> Result<Vec<BetRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM bets WHERE user_id = $1 ORDER BY seq DESC LIMIT $2 OFFSET $3",
        )
        .bind(user)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(bet_from_row).collect()
    }

    async fn count_open_bets(
        &self,
        user: UserId,
        cycle: Option<CycleId>,
    ) -> Result<usize, StoreError> {
        let row = match cycle {
            Some(cycle) => {
                sqlx::query(
                    "SELECT COUNT(*) AS open FROM bets
                     WHERE user_id = $1
                       AND state IN ('pending', 'active')
                       AND (cycle_id = $2 OR cycle_id IS NULL)",
                )
                .bind(user)
                .bind(cycle)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT COUNT(*) AS open FROM bets
                     WHERE user_id = $1 AND state = 'pending' AND cycle_id IS NULL",
                )
                .bind(user)
                .fetch_one(&self.pool)
                .await?
            }
        };
        let count: i64 = row.try_get("open")?;
        Ok(count as usize)
    }

    async fn insert_cycle(&self, cycle: &CycleRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO cycles (id, state, seed_hex, hash_hex, crash_point_hundredths,
                                 created_at, flew_at, ended_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(cycle.id)
        .bind(cycle.state.as_str())
        .bind(&cycle.seed_hex)
        .bind(&cycle.hash_hex)
        .bind(cycle.crash_point.map(|m| m.hundredths() as i64))
        .bind(cycle.created_at)
        .bind(cycle.flew_at)
        .bind(cycle.ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_cycle(
        &self,
        cycle: CycleId,
        crash_point: Multiplier,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE cycles SET state = 'crashed', crash_point_hundredths = $2, ended_at = $3
             WHERE id = $1 AND state = 'flying'",
        )
        .bind(cycle)
        .bind(crash_point.hundredths() as i64)
        .bind(ended_at)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::IllegalTransition("cycle is not flying"));
        }
        Ok(())
    }

    async fn complete_cycle(&self, cycle: CycleId) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE cycles SET state = 'completed' WHERE id = $1 AND state = 'crashed'",
        )
        .bind(cycle)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::IllegalTransition("cycle has not crashed"));
        }
        Ok(())
    }

    async fn find_cycle(&self, cycle: CycleId) -> Result<Option<CycleRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM cycles WHERE id = $1")
            .bind(cycle)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(cycle_from_row).transpose()
    }

    async fn find_unfinished_cycle(&self) -> Result<Option<CycleRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM cycles WHERE state <> 'completed' LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(cycle_from_row).transpose()
    }

    async fn void_cycle(
        &self,
        cycle: CycleId,
        at: DateTime<Utc>,
    ) -> Result<Vec<BetRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE cycles SET state = 'completed', crash_point_hundredths = 100, ended_at = $2
             WHERE id = $1",
        )
        .bind(cycle)
        .bind(at)
        .execute(&mut *tx)
        .await?;
        let rows = sqlx::query(
            "UPDATE bets SET state = 'refunded', settled_at = $2
             WHERE state IN ('pending', 'active')
               AND (cycle_id = $1 OR cycle_id IS NULL)
             RETURNING *",
        )
        .bind(cycle)
        .bind(at)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut refunded: Vec<BetRecord> =
            rows.iter().map(bet_from_row).collect::<Result<_, _>>()?;
        refunded.sort_by_key(|bet| bet.seq);
        Ok(refunded)
    }
}
