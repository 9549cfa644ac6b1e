//! Bet lifecycle manager.
//!
//! Owns all wallet and bet mutation: admission and debit of new wagers,
//! activation bookkeeping at cycle lock, manual and auto cash-out, loss
//! settlement at crash. Wallet writes for one user are serialised by a
//! per-user lock; `settle_bet`'s state guard is the at-most-once
//! serialisation point for every cash-out race.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, RwLock as StdRwLock};
use std::sync::{RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engine::CycleSnapshot;
use crate::error::{GameError, StoreError};
use crate::hex;
use crate::hotbets::{HotBetEntry, HotBetIndex};
use crate::hub::Hub;
use crate::money::{Amount, Multiplier};
use crate::store::{
    BetId, BetRecord, BetState, CycleId, CycleState, SettleOutcome, Store, TxKind, UserId,
};
use crate::wire::ServerEvent;

/// Cash-out tokens are single-use and short-lived.
const CASHOUT_TOKEN_TTL_SECS: i64 = 30;
/// Transient database failures are retried twice before surfacing.
const RETRY_BACKOFF_MS: [u64; 2] = [50, 200];

#[derive(Debug, Clone)]
pub struct CashoutReceipt {
    pub bet_id: BetId,
    pub payout: Amount,
    pub multiplier: Multiplier,
    pub new_balance: Amount,
}

#[derive(Clone)]
struct MintedToken {
    token: String,
    user_id: UserId,
    expires_at: DateTime<Utc>,
}

pub struct BetLifecycle {
    store: Arc<dyn Store>,
    hub: Arc<Hub>,
    cfg: Arc<Config>,
    snapshot: watch::Receiver<CycleSnapshot>,
    hot: StdRwLock<HotBetIndex>,
    user_locks: StdMutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
    tokens: StdMutex<HashMap<BetId, MintedToken>>,
}

impl BetLifecycle {
    pub fn new(
        store: Arc<dyn Store>,
        hub: Arc<Hub>,
        cfg: Arc<Config>,
        snapshot: watch::Receiver<CycleSnapshot>,
    ) -> Self {
        BetLifecycle {
            store,
            hub,
            cfg,
            snapshot,
            hot: StdRwLock::new(HotBetIndex::new()),
            user_locks: StdMutex::new(HashMap::new()),
            tokens: StdMutex::new(HashMap::new()),
        }
    }

    /// Admit a wager. Preconditions are checked in order and the first
    /// violation wins. During betting the bet binds to the open cycle; in
    /// any other phase it queues unbound for the next cycle.
    pub async fn place_bet(
        &self,
        user: UserId,
        stake: Amount,
        auto_cashout: Option<Multiplier>,
    ) -> Result<BetId, GameError> {
        if stake < self.cfg.min_bet || stake > self.cfg.max_bet {
            return Err(GameError::StakeOutOfRange);
        }
        if let Some(threshold) = auto_cashout {
            if threshold <= Multiplier::ONE {
                return Err(GameError::InvalidAutoThreshold);
            }
        }

        let snap = self.snapshot.borrow().clone();
        let target = match snap.state {
            CycleState::Betting => snap.cycle_id,
            _ => None,
        };

        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let open = self
            .retry(|| self.store.count_open_bets(user, target))
            .await
            .map_err(GameError::from)?;
        if open >= self.cfg.bet_limit_per_cycle {
            return Err(GameError::BetLimitExceeded);
        }

        let bet = BetRecord::pending(user, target, stake, auto_cashout);
        let bet_id = bet.id;
        let new_balance = self
            .retry(|| self.store.debit(user, stake, TxKind::BetDebit, Some(bet_id)))
            .await
            .map_err(GameError::from)?;

        if let Err(err) = self.retry(|| self.store.create_bet(bet.clone())).await {
            error!(bet = %bet_id, error = %err, "bet insert failed after debit, compensating");
            if let Err(refund_err) = self
                .retry(|| self.store.credit(user, stake, TxKind::Deposit, Some(bet_id)))
                .await
            {
                error!(bet = %bet_id, error = %refund_err, "compensating credit failed");
            }
            return Err(err.into());
        }

        self.hub.send_to_user(
            user,
            ServerEvent::WalletUpdate {
                balance: new_balance,
                currency: self.cfg.currency.clone(),
                cause: TxKind::BetDebit.as_str(),
                correlation_id: Some(bet_id),
            },
        );
        self.hub.broadcast(ServerEvent::BetPlaced {
            amount: stake,
            auto_cashout_multiplier: auto_cashout,
        });
        Ok(bet_id)
    }

    /// Settle a bet won at the engine's current multiplier.
    ///
    /// The multiplier is read once at the start; if the cycle crashes
    /// before the settle commits, the crash sweep wins the race and the
    /// caller sees `cycle-ended`. A retry against an already-won bet is
    /// answered idempotently with the recorded payout.
    pub async fn cash_out(
        &self,
        user: UserId,
        bet_id: BetId,
        token: Option<&str>,
    ) -> Result<CashoutReceipt, GameError> {
        let bet = self
            .retry(|| self.store.find_bet(bet_id))
            .await
            .map_err(GameError::from)?
            .ok_or(GameError::NotActive)?;
        if bet.user_id != user {
            return Err(GameError::Forbidden);
        }
        self.check_token(bet_id, user, token)?;

        match bet.state {
            BetState::Active => {}
            BetState::Won => return self.recorded_receipt(&bet).await,
            BetState::Lost => return Err(GameError::CycleEnded),
            BetState::Pending | BetState::Refunded => return Err(GameError::NotActive),
        }

        let snap = self.snapshot.borrow().clone();
        if snap.state != CycleState::Flying || snap.cycle_id != bet.cycle_id {
            return Err(GameError::NotActive);
        }
        let multiplier = snap.multiplier;

        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let settled = match self
            .retry(|| self.store.settle_bet(bet_id, SettleOutcome::Won(multiplier), Utc::now()))
            .await
        {
            Ok(settled) => settled,
            Err(StoreError::AlreadySettled) => {
                // Lost the race to the auto sweep or the crash settlement;
                // report whichever outcome actually landed.
                let current = self
                    .retry(|| self.store.find_bet(bet_id))
                    .await
                    .map_err(GameError::from)?
                    .ok_or(GameError::System)?;
                return match current.state {
                    BetState::Won => self.recorded_receipt(&current).await,
                    _ => Err(GameError::CycleEnded),
                };
            }
            Err(err) => return Err(err.into()),
        };

        self.finish_cashout(&settled).await
    }

    /// Auto-cash-out pass for one emitted tick, in ascending threshold
    /// order. Runs inline on the engine task so settlement for tick t is
    /// done before tick t+Δ is emitted.
    pub async fn sweep(&self, multiplier: Multiplier) {
        let ripe = self.hot_read().ripe(multiplier);
        for entry in ripe {
            match self.auto_cash_out(&entry, multiplier).await {
                Ok(_) => {}
                // lost the race to a concurrent manual cash-out
                Err(GameError::AlreadySettled) => {}
                Err(err) => {
                    warn!(bet = %entry.bet_id, error = %err, "auto cash-out failed");
                }
            }
        }
    }

    async fn auto_cash_out(
        &self,
        entry: &HotBetEntry,
        multiplier: Multiplier,
    ) -> Result<CashoutReceipt, GameError> {
        let lock = self.user_lock(entry.user_id);
        let _guard = lock.lock().await;
        let settled = self
            .retry(|| self.store.settle_bet(entry.bet_id, SettleOutcome::Won(multiplier), Utc::now()))
            .await
            .map_err(GameError::from)?;
        self.finish_cashout(&settled).await
    }

    /// Settle everything still in the hot index as lost. Wallets are not
    /// touched.
    pub async fn settle_losses(&self, at: DateTime<Utc>) {
        let entries = self.hot_write().drain();
        for entry in entries {
            match self
                .retry(|| self.store.settle_bet(entry.bet_id, SettleOutcome::Lost, at))
                .await
            {
                Ok(_) => {
                    self.hub
                        .send_to_user(entry.user_id, ServerEvent::BetLost { bet_id: entry.bet_id });
                }
                // cashed out on the final tick
                Err(StoreError::AlreadySettled) => {}
                Err(err) => {
                    error!(bet = %entry.bet_id, error = %err, "loss settlement failed");
                }
            }
        }
        self.clear_tokens();
    }

    /// Load the freshly activated rows into the hot index and hand each
    /// owner a cash-out activation with its token.
    pub fn hydrate(&self, cycle: CycleId, rows: &[BetRecord]) {
        let mut hot = self.hot_write();
        hot.clear();
        let mut tokens = self.tokens_lock();
        tokens.clear();
        for bet in rows {
            hot.insert(HotBetEntry::from(bet));
            let token = mint_token();
            tokens.insert(
                bet.id,
                MintedToken {
                    token: token.clone(),
                    user_id: bet.user_id,
                    expires_at: Utc::now() + chrono::Duration::seconds(CASHOUT_TOKEN_TTL_SECS),
                },
            );
            self.hub.send_to_user(
                bet.user_id,
                ServerEvent::ActivateCashout {
                    bet_id: bet.id,
                    token: Some(token),
                },
            );
        }
        info!(cycle = %cycle, bets = rows.len(), "hot-bet index hydrated");
    }

    /// Abort a cycle whose lock edge keeps failing: void it, refund every
    /// open stake, and tell everyone something went wrong.
    pub async fn abort_cycle(&self, cycle: CycleId) {
        match self.retry(|| self.store.void_cycle(cycle, Utc::now())).await {
            Ok(refunded) => {
                for bet in refunded {
                    match self
                        .retry(|| self.store.credit(bet.user_id, bet.stake, TxKind::Deposit, Some(bet.id)))
                        .await
                    {
                        Ok(balance) => {
                            self.hub.send_to_user(
                                bet.user_id,
                                ServerEvent::WalletUpdate {
                                    balance,
                                    currency: self.cfg.currency.clone(),
                                    cause: "refund",
                                    correlation_id: Some(bet.id),
                                },
                            );
                        }
                        Err(err) => {
                            error!(bet = %bet.id, error = %err, "refund credit failed");
                        }
                    }
                }
                self.hub.broadcast(ServerEvent::SystemError {
                    error: GameError::System.code(),
                });
            }
            Err(err) => error!(cycle = %cycle, error = %err, "cycle abort failed"),
        }
        self.clear();
    }

    /// Drop all per-cycle state at the close edge.
    pub fn clear(&self) {
        self.hot_write().clear();
        self.clear_tokens();
    }

    /// Active bets (with their cash-out tokens) for connect-time replay.
    pub fn active_bets_for(&self, user: UserId) -> Vec<(BetId, Option<String>)> {
        let entries = self.hot_read().entries_for_user(user);
        let tokens = self.tokens_lock();
        entries
            .iter()
            .map(|entry| {
                (
                    entry.bet_id,
                    tokens.get(&entry.bet_id).map(|minted| minted.token.clone()),
                )
            })
            .collect()
    }

    async fn finish_cashout(&self, settled: &BetRecord) -> Result<CashoutReceipt, GameError> {
        let payout = settled.payout.ok_or(GameError::System)?;
        let multiplier = settled.cashout_multiplier.ok_or(GameError::System)?;
        let new_balance = self
            .retry(|| {
                self.store
                    .credit(settled.user_id, payout, TxKind::CashoutCredit, Some(settled.id))
            })
            .await
            .map_err(GameError::from)?;
        self.hot_write().remove(settled.id);
        self.clear_token(settled.id);

        self.hub.send_to_user(
            settled.user_id,
            ServerEvent::WalletUpdate {
                balance: new_balance,
                currency: self.cfg.currency.clone(),
                cause: TxKind::CashoutCredit.as_str(),
                correlation_id: Some(settled.id),
            },
        );
        self.hub.send_to_user(
            settled.user_id,
            ServerEvent::CashoutSuccess {
                bet_id: settled.id,
                payout,
                multiplier,
                new_balance,
            },
        );
        self.hub.broadcast(ServerEvent::BetCashedOut { multiplier });
        Ok(CashoutReceipt {
            bet_id: settled.id,
            payout,
            multiplier,
            new_balance,
        })
    }

    async fn recorded_receipt(&self, bet: &BetRecord) -> Result<CashoutReceipt, GameError> {
        let payout = bet.payout.ok_or(GameError::System)?;
        let multiplier = bet.cashout_multiplier.ok_or(GameError::System)?;
        let new_balance = self
            .retry(|| self.store.balance_of(bet.user_id))
            .await
            .map_err(GameError::from)?;
        Ok(CashoutReceipt {
            bet_id: bet.id,
            payout,
            multiplier,
            new_balance,
        })
    }

    fn check_token(
        &self,
        bet_id: BetId,
        user: UserId,
        supplied: Option<&str>,
    ) -> Result<(), GameError> {
        let tokens = self.tokens_lock();
        match (tokens.get(&bet_id), supplied) {
            (Some(minted), Some(supplied)) => {
                if minted.user_id == user
                    && minted.token == supplied
                    && minted.expires_at > Utc::now()
                {
                    Ok(())
                } else {
                    Err(GameError::Forbidden)
                }
            }
            (_, None) if self.cfg.require_cashout_token => Err(GameError::Forbidden),
            _ => Ok(()),
        }
    }

    fn user_lock(&self, user: UserId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.user_locks.lock().unwrap_or_else(|err| err.into_inner());
        locks.entry(user).or_default().clone()
    }

    fn hot_read(&self) -> RwLockReadGuard<'_, HotBetIndex> {
        self.hot.read().unwrap_or_else(|err| err.into_inner())
    }

    fn hot_write(&self) -> RwLockWriteGuard<'_, HotBetIndex> {
        self.hot.write().unwrap_or_else(|err| err.into_inner())
    }

    fn tokens_lock(&self) -> MutexGuard<'_, HashMap<BetId, MintedToken>> {
        self.tokens.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn clear_token(&self, bet_id: BetId) {
        self.tokens_lock().remove(&bet_id);
    }

    fn clear_tokens(&self) {
        self.tokens_lock().clear();
    }

    /// Run a store operation under the database timeout, retrying
    /// transient database failures with a short backoff.
    async fn retry<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.cfg.db_timeout, op()).await {
                Ok(result) => result,
                Err(_) => return Err(StoreError::Timeout),
            };
            match result {
                Err(StoreError::Database(err)) if attempt < RETRY_BACKOFF_MS.len() => {
                    warn!(error = %err, attempt, "transient store failure, retrying");
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS[attempt])).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn mint_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CycleRecord, MemoryStore, Page};
    use uuid::Uuid;

    struct Fixture {
        store: Arc<MemoryStore>,
        lifecycle: BetLifecycle,
        snap_tx: watch::Sender<CycleSnapshot>,
        cycle: CycleRecord,
    }

    fn amount(major: f64) -> Amount {
        Amount::try_from_major(major).unwrap()
    }

    fn mult(hundredths: u32) -> Multiplier {
        Multiplier::from_hundredths(hundredths)
    }

    fn test_config() -> Config {
        Config {
            listen_addr: "127.0.0.1:0".into(),
            betting_ms: 100,
            tick_ms: 10,
            crash_display_ms: 10,
            min_bet: amount(1.0),
            max_bet: amount(1_000.0),
            bet_limit_per_cycle: 2,
            currency: "KSH".into(),
            database_url: None,
            auth_secret: "test-secret".into(),
            db_timeout: Duration::from_secs(15),
            require_cashout_token: false,
        }
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(Hub::new());
        let (snap_tx, snap_rx) = watch::channel(CycleSnapshot::default());
        let lifecycle = BetLifecycle::new(
            store.clone(),
            hub,
            Arc::new(test_config()),
            snap_rx,
        );
        let cycle = CycleRecord {
            id: Uuid::new_v4(),
            state: CycleState::Betting,
            seed_hex: "deadbeef".into(),
            hash_hex: String::new(),
            crash_point: None,
            created_at: Utc::now(),
            flew_at: None,
            ended_at: None,
        };
        Fixture { store, lifecycle, snap_tx, cycle }
    }

    impl Fixture {
        async fn open_betting(&self) {
            self.store.insert_cycle(&self.cycle).await.unwrap();
            self.set_phase(CycleState::Betting, 100);
        }

        fn set_phase(&self, state: CycleState, multiplier_hundredths: u32) {
            let _ = self.snap_tx.send(CycleSnapshot {
                cycle_id: Some(self.cycle.id),
                state,
                multiplier: mult(multiplier_hundredths),
                crash_point: None,
                countdown_ms: None,
            });
        }

        async fn fund(&self, user: UserId, major: f64) {
            self.store
                .credit(user, amount(major), TxKind::Deposit, None)
                .await
                .unwrap();
        }

        /// Lock the cycle and hydrate the index, then move to flying at the
        /// given multiplier.
        async fn lock_and_fly(&self, multiplier_hundredths: u32) {
            let rows = self
                .store
                .activate_pending(self.cycle.id, Utc::now())
                .await
                .unwrap();
            self.lifecycle.hydrate(self.cycle.id, &rows);
            self.set_phase(CycleState::Flying, multiplier_hundredths);
        }
    }

    #[tokio::test]
    async fn manual_cash_out_win() {
        let fx = fixture();
        let user = Uuid::new_v4();
        fx.fund(user, 1_000.0).await;
        fx.open_betting().await;

        let bet_id = fx.lifecycle.place_bet(user, amount(100.0), None).await.unwrap();
        assert_eq!(fx.store.balance_of(user).await.unwrap(), amount(900.0));

        fx.lock_and_fly(200).await;
        let receipt = fx.lifecycle.cash_out(user, bet_id, None).await.unwrap();
        assert_eq!(receipt.payout, amount(200.0));
        assert_eq!(receipt.new_balance, amount(1_100.0));
        assert_eq!(receipt.multiplier, mult(200));

        let bet = fx.store.find_bet(bet_id).await.unwrap().unwrap();
        assert_eq!(bet.state, BetState::Won);
        assert_eq!(bet.cashout_multiplier, Some(mult(200)));

        // The later crash settlement must not alter a won bet.
        fx.lifecycle.settle_losses(Utc::now()).await;
        let bet = fx.store.find_bet(bet_id).await.unwrap().unwrap();
        assert_eq!(bet.state, BetState::Won);
        assert_eq!(fx.store.balance_of(user).await.unwrap(), amount(1_100.0));
    }

    #[tokio::test]
    async fn crash_before_cash_out_settles_lost_without_wallet_writes() {
        let fx = fixture();
        let user = Uuid::new_v4();
        fx.fund(user, 1_000.0).await;
        fx.open_betting().await;

        let bet_id = fx.lifecycle.place_bet(user, amount(100.0), None).await.unwrap();
        fx.lock_and_fly(100).await;

        fx.lifecycle.settle_losses(Utc::now()).await;
        let bet = fx.store.find_bet(bet_id).await.unwrap().unwrap();
        assert_eq!(bet.state, BetState::Lost);
        assert_eq!(bet.payout, None);
        assert_eq!(fx.store.balance_of(user).await.unwrap(), amount(900.0));

        // Only the funding deposit and the bet debit exist.
        let history = fx.store.wallet_history(user, Page::default()).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn auto_cash_out_fires_at_threshold() {
        let fx = fixture();
        let user = Uuid::new_v4();
        fx.fund(user, 1_000.0).await;
        fx.open_betting().await;

        let bet_id = fx
            .lifecycle
            .place_bet(user, amount(100.0), Some(mult(250)))
            .await
            .unwrap();
        fx.lock_and_fly(100).await;

        // Below the threshold nothing happens.
        fx.lifecycle.sweep(mult(249)).await;
        let bet = fx.store.find_bet(bet_id).await.unwrap().unwrap();
        assert_eq!(bet.state, BetState::Active);

        // First tick at or above the threshold settles at that multiplier.
        fx.lifecycle.sweep(mult(255)).await;
        let bet = fx.store.find_bet(bet_id).await.unwrap().unwrap();
        assert_eq!(bet.state, BetState::Won);
        assert_eq!(bet.cashout_multiplier, Some(mult(255)));
        assert_eq!(bet.payout, Some(amount(255.0)));
        assert_eq!(fx.store.balance_of(user).await.unwrap(), amount(1_155.0));

        // The subsequent crash does not alter it.
        fx.lifecycle.settle_losses(Utc::now()).await;
        let bet = fx.store.find_bet(bet_id).await.unwrap().unwrap();
        assert_eq!(bet.state, BetState::Won);
    }

    #[tokio::test]
    async fn insufficient_funds_leaves_no_trace() {
        let fx = fixture();
        let user = Uuid::new_v4();
        fx.fund(user, 50.0).await;
        fx.open_betting().await;

        let err = fx.lifecycle.place_bet(user, amount(100.0), None).await.unwrap_err();
        assert_eq!(err, GameError::InsufficientFunds);
        assert_eq!(err.code(), "insufficient-funds");

        assert!(fx
            .store
            .list_bets_by_user(user, Page::default())
            .await
            .unwrap()
            .is_empty());
        let history = fx.store.wallet_history(user, Page::default()).await.unwrap();
        assert_eq!(history.len(), 1, "only the funding deposit");
    }

    #[tokio::test]
    async fn bet_limit_is_enforced_per_cycle() {
        let fx = fixture();
        let user = Uuid::new_v4();
        fx.fund(user, 1_000.0).await;
        fx.open_betting().await;

        fx.lifecycle.place_bet(user, amount(10.0), None).await.unwrap();
        fx.lifecycle.place_bet(user, amount(10.0), None).await.unwrap();
        let err = fx.lifecycle.place_bet(user, amount(10.0), None).await.unwrap_err();
        assert_eq!(err, GameError::BetLimitExceeded);

        // Another user is unaffected.
        let other = Uuid::new_v4();
        fx.fund(other, 100.0).await;
        fx.lifecycle.place_bet(other, amount(10.0), None).await.unwrap();
    }

    #[tokio::test]
    async fn admission_guards_fire_in_order() {
        let fx = fixture();
        let user = Uuid::new_v4();
        fx.fund(user, 1_000.0).await;
        fx.open_betting().await;

        let err = fx.lifecycle.place_bet(user, amount(0.5), None).await.unwrap_err();
        assert_eq!(err, GameError::StakeOutOfRange);
        let err = fx.lifecycle.place_bet(user, amount(2_000.0), None).await.unwrap_err();
        assert_eq!(err, GameError::StakeOutOfRange);
        let err = fx
            .lifecycle
            .place_bet(user, amount(10.0), Some(Multiplier::ONE))
            .await
            .unwrap_err();
        assert_eq!(err, GameError::InvalidAutoThreshold);
    }

    #[tokio::test]
    async fn bets_placed_while_flying_queue_for_next_cycle() {
        let fx = fixture();
        let user = Uuid::new_v4();
        fx.fund(user, 1_000.0).await;
        fx.open_betting().await;
        fx.lock_and_fly(150).await;

        let bet_id = fx.lifecycle.place_bet(user, amount(100.0), None).await.unwrap();
        let bet = fx.store.find_bet(bet_id).await.unwrap().unwrap();
        assert_eq!(bet.state, BetState::Pending);
        assert_eq!(bet.cycle_id, None);

        // It cannot cash out against the current cycle.
        let err = fx.lifecycle.cash_out(user, bet_id, None).await.unwrap_err();
        assert_eq!(err, GameError::NotActive);
    }

    #[tokio::test]
    async fn round_trip_at_one_nets_zero() {
        let fx = fixture();
        let user = Uuid::new_v4();
        fx.fund(user, 1_000.0).await;
        fx.open_betting().await;

        let bet_id = fx.lifecycle.place_bet(user, amount(100.0), None).await.unwrap();
        fx.lock_and_fly(100).await;
        let receipt = fx.lifecycle.cash_out(user, bet_id, None).await.unwrap();
        assert_eq!(receipt.payout, amount(100.0));
        assert_eq!(receipt.new_balance, amount(1_000.0));

        let history = fx.store.wallet_history(user, Page::default()).await.unwrap();
        let debits = history.iter().filter(|tx| tx.kind == TxKind::BetDebit).count();
        let credits = history.iter().filter(|tx| tx.kind == TxKind::CashoutCredit).count();
        assert_eq!((debits, credits), (1, 1));
    }

    #[tokio::test]
    async fn cash_out_is_owner_only() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let intruder = Uuid::new_v4();
        fx.fund(user, 1_000.0).await;
        fx.open_betting().await;

        let bet_id = fx.lifecycle.place_bet(user, amount(100.0), None).await.unwrap();
        fx.lock_and_fly(150).await;

        let err = fx.lifecycle.cash_out(intruder, bet_id, None).await.unwrap_err();
        assert_eq!(err, GameError::Forbidden);
        let bet = fx.store.find_bet(bet_id).await.unwrap().unwrap();
        assert_eq!(bet.state, BetState::Active);
    }

    #[tokio::test]
    async fn duplicate_cash_out_is_idempotent() {
        let fx = fixture();
        let user = Uuid::new_v4();
        fx.fund(user, 1_000.0).await;
        fx.open_betting().await;

        let bet_id = fx.lifecycle.place_bet(user, amount(100.0), None).await.unwrap();
        fx.lock_and_fly(200).await;

        let first = fx.lifecycle.cash_out(user, bet_id, None).await.unwrap();
        let second = fx.lifecycle.cash_out(user, bet_id, None).await.unwrap();
        assert_eq!(second.payout, first.payout);
        assert_eq!(second.new_balance, first.new_balance);

        // Exactly one credit was written.
        let history = fx.store.wallet_history(user, Page::default()).await.unwrap();
        let credits = history.iter().filter(|tx| tx.kind == TxKind::CashoutCredit).count();
        assert_eq!(credits, 1);
    }

    #[tokio::test]
    async fn cash_out_after_crash_reports_cycle_ended() {
        let fx = fixture();
        let user = Uuid::new_v4();
        fx.fund(user, 1_000.0).await;
        fx.open_betting().await;

        let bet_id = fx.lifecycle.place_bet(user, amount(100.0), None).await.unwrap();
        fx.lock_and_fly(180).await;

        // The engine crashes and settles the bet as lost while the snapshot
        // the caller read still says flying.
        fx.lifecycle.settle_losses(Utc::now()).await;
        let err = fx.lifecycle.cash_out(user, bet_id, None).await.unwrap_err();
        assert_eq!(err, GameError::CycleEnded);
        assert_eq!(fx.store.balance_of(user).await.unwrap(), amount(900.0));
    }

    #[tokio::test]
    async fn cash_out_requires_flying_phase() {
        let fx = fixture();
        let user = Uuid::new_v4();
        fx.fund(user, 1_000.0).await;
        fx.open_betting().await;

        let bet_id = fx.lifecycle.place_bet(user, amount(100.0), None).await.unwrap();
        // Still betting: the bet is pending, not active.
        let err = fx.lifecycle.cash_out(user, bet_id, None).await.unwrap_err();
        assert_eq!(err, GameError::NotActive);

        // Crashed phase rejects as well, even for an active bet.
        let rows = fx.store.activate_pending(fx.cycle.id, Utc::now()).await.unwrap();
        fx.lifecycle.hydrate(fx.cycle.id, &rows);
        fx.set_phase(CycleState::Crashed, 150);
        let err = fx.lifecycle.cash_out(user, bet_id, None).await.unwrap_err();
        assert_eq!(err, GameError::NotActive);
    }

    #[tokio::test]
    async fn wrong_cashout_token_is_rejected() {
        let fx = fixture();
        let user = Uuid::new_v4();
        fx.fund(user, 1_000.0).await;
        fx.open_betting().await;

        let bet_id = fx.lifecycle.place_bet(user, amount(100.0), None).await.unwrap();
        fx.lock_and_fly(150).await;

        let err = fx
            .lifecycle
            .cash_out(user, bet_id, Some("not-the-token"))
            .await
            .unwrap_err();
        assert_eq!(err, GameError::Forbidden);

        // The minted token from the activation replay works.
        let (replay_bet, token) = fx.lifecycle.active_bets_for(user).pop().unwrap();
        assert_eq!(replay_bet, bet_id);
        let receipt = fx
            .lifecycle
            .cash_out(user, bet_id, token.as_deref())
            .await
            .unwrap();
        assert_eq!(receipt.payout, amount(150.0));
    }

    #[tokio::test]
    async fn abort_refunds_pending_stakes() {
        let fx = fixture();
        let user = Uuid::new_v4();
        fx.fund(user, 1_000.0).await;
        fx.open_betting().await;

        let bet_id = fx.lifecycle.place_bet(user, amount(100.0), None).await.unwrap();
        assert_eq!(fx.store.balance_of(user).await.unwrap(), amount(900.0));

        fx.lifecycle.abort_cycle(fx.cycle.id).await;
        let bet = fx.store.find_bet(bet_id).await.unwrap().unwrap();
        assert_eq!(bet.state, BetState::Refunded);
        assert_eq!(fx.store.balance_of(user).await.unwrap(), amount(1_000.0));
        assert!(fx.store.find_unfinished_cycle().await.unwrap().is_none());
    }
}
