//! In-memory store.
//!
//! Backs tests and DSN-less development runs. Everything lives under one
//! mutex, which also gives the per-user total ordering the wallet contract
//! asks for. The ledger-sum invariant is checked on every mutation in
//! debug builds.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::money::{Amount, Multiplier};
use crate::store::{
    BetId, BetRecord, BetState, CycleId, CycleRecord, CycleState, Page, SettleOutcome, Store,
    TxKind, UserId, WalletTx,
};

#[derive(Default)]
struct WalletRow {
    balance: Amount,
    version: u64,
}

#[derive(Default)]
struct Inner {
    wallets: HashMap<UserId, WalletRow>,
    txs: Vec<WalletTx>,
    bets: HashMap<BetId, BetRecord>,
    bet_seq: i64,
    cycles: HashMap<CycleId, CycleRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl Inner {
    fn mutate_wallet(
        &mut self,
        user: UserId,
        amount: Amount,
        kind: TxKind,
        correlation: Option<Uuid>,
    ) -> Result<Amount, StoreError> {
        if amount.is_negative() {
            return Err(StoreError::NegativeAmount);
        }
        let row = self.wallets.entry(user).or_default();
        let new_balance = match kind.signed(amount) {
            delta if delta >= 0 => row
                .balance
                .checked_add(Amount::from_cents(delta))
                .ok_or(StoreError::Overflow)?,
            delta => {
                if row.balance < amount {
                    return Err(StoreError::InsufficientFunds);
                }
                row.balance
                    .checked_add(Amount::from_cents(delta))
                    .ok_or(StoreError::Overflow)?
            }
        };
        row.balance = new_balance;
        row.version += 1;
        self.txs.push(WalletTx {
            id: Uuid::new_v4(),
            user_id: user,
            amount,
            kind,
            correlation_id: correlation,
            created_at: Utc::now(),
        });
        debug_assert_eq!(
            self.txs
                .iter()
                .filter(|tx| tx.user_id == user)
                .map(|tx| tx.kind.signed(tx.amount))
                .sum::<i64>(),
            new_balance.cents(),
            "ledger sum diverged from balance"
        );
        Ok(new_balance)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn credit(
        &self,
        user: UserId,
        amount: Amount,
        kind: TxKind,
        correlation: Option<Uuid>,
    ) -> Result<Amount, StoreError> {
        self.lock()?.mutate_wallet(user, amount, kind, correlation)
    }

    async fn debit(
        &self,
        user: UserId,
        amount: Amount,
        kind: TxKind,
        correlation: Option<Uuid>,
    ) -> Result<Amount, StoreError> {
        self.lock()?.mutate_wallet(user, amount, kind, correlation)
    }

    async fn balance_of(&self, user: UserId) -> Result<Amount, StoreError> {
        Ok(self
            .lock()?
            .wallets
            .get(&user)
            .map(|row| row.balance)
            .unwrap_or(Amount::ZERO))
    }

    async fn wallet_history(&self, user: UserId, page: Page) -> Result<Vec<WalletTx>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .txs
            .iter()
            .rev()
            .filter(|tx| tx.user_id == user)
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn create_bet(&self, mut bet: BetRecord) -> Result<BetRecord, StoreError> {
        let mut inner = self.lock()?;
        inner.bet_seq += 1;
        bet.seq = inner.bet_seq;
        inner.bets.insert(bet.id, bet.clone());
        Ok(bet)
    }

    async fn activate_pending(
        &self,
        cycle: CycleId,
        flew_at: DateTime<Utc>,
    ) -> Result<Vec<BetRecord>, StoreError> {
        let mut inner = self.lock()?;
        let row = inner.cycles.get_mut(&cycle).ok_or(StoreError::NotFound)?;
        if row.state != CycleState::Betting {
            return Err(StoreError::IllegalTransition("cycle is not in betting"));
        }
        row.state = CycleState::Flying;
        row.flew_at = Some(flew_at);

        let mut activated = Vec::new();
        for bet in inner.bets.values_mut() {
            let bindable = bet.cycle_id.is_none() || bet.cycle_id == Some(cycle);
            if bet.state == BetState::Pending && bindable {
                bet.state = BetState::Active;
                bet.cycle_id = Some(cycle);
                activated.push(bet.clone());
            }
        }
        activated.sort_by_key(|bet| bet.seq);
        Ok(activated)
    }

    async fn settle_bet(
        &self,
        bet: BetId,
        outcome: SettleOutcome,
        at: DateTime<Utc>,
    ) -> Result<BetRecord, StoreError> {
        let mut inner = self.lock()?;
        let row = inner.bets.get_mut(&bet).ok_or(StoreError::NotFound)?;
        match row.state {
            BetState::Active => {}
            BetState::Won | BetState::Lost | BetState::Refunded => {
                return Err(StoreError::AlreadySettled)
            }
            BetState::Pending => {
                return Err(StoreError::IllegalTransition("pending bet cannot settle"))
            }
        }
        match outcome {
            SettleOutcome::Won(multiplier) => {
                row.state = BetState::Won;
                row.cashout_multiplier = Some(multiplier);
                row.payout = Some(row.stake.mul_multiplier(multiplier));
            }
            SettleOutcome::Lost => row.state = BetState::Lost,
        }
        row.settled_at = Some(at);
        Ok(row.clone())
    }

    async fn find_bet(&self, bet: BetId) -> Result<Option<BetRecord>, StoreError> {
        Ok(self.lock()?.bets.get(&bet).cloned())
    }

    async fn list_active_bets(&self, cycle: CycleId) -> Result<Vec<BetRecord>, StoreError> {
        let inner = self.lock()?;
        let mut rows: Vec<BetRecord> = inner
            .bets
            .values()
            .filter(|bet| bet.state == BetState::Active && bet.cycle_id == Some(cycle))
            .cloned()
            .collect();
        rows.sort_by_key(|bet| bet.seq);
        Ok(rows)
    }

    async fn list_bets_by_user(
        &self,
        user: UserId,
        page: Page,
    ) -> Result<Vec<BetRecord>, StoreError> {
        let inner = self.lock()?;
        let mut rows: Vec<BetRecord> = inner
            .bets
            .values()
            .filter(|bet| bet.user_id == user)
            .cloned()
            .collect();
        rows.sort_by_key(|bet| std::cmp::Reverse(bet.seq));
        Ok(rows.into_iter().skip(page.offset).take(page.limit).collect())
    }

    async fn count_open_bets(
        &self,
        user: UserId,
        cycle: Option<CycleId>,
    ) -> Result<usize, StoreError> {
        let inner = self.lock()?;
        let count = inner
            .bets
            .values()
            .filter(|bet| bet.user_id == user)
            .filter(|bet| match cycle {
                Some(cycle) => {
                    !bet.state.is_terminal()
                        && (bet.cycle_id == Some(cycle) || bet.cycle_id.is_none())
                }
                None => bet.state == BetState::Pending && bet.cycle_id.is_none(),
            })
            .count();
        Ok(count)
    }

    async fn insert_cycle(&self, cycle: &CycleRecord) -> Result<(), StoreError> {
        self.lock()?.cycles.insert(cycle.id, cycle.clone());
        Ok(())
    }

    async fn finish_cycle(
        &self,
        cycle: CycleId,
        crash_point: Multiplier,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let row = inner.cycles.get_mut(&cycle).ok_or(StoreError::NotFound)?;
        if row.state != CycleState::Flying {
            return Err(StoreError::IllegalTransition("cycle is not flying"));
        }
        row.state = CycleState::Crashed;
        row.crash_point = Some(crash_point);
        row.ended_at = Some(ended_at);
        Ok(())
    }

    async fn complete_cycle(&self, cycle: CycleId) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let row = inner.cycles.get_mut(&cycle).ok_or(StoreError::NotFound)?;
        if row.state != CycleState::Crashed {
            return Err(StoreError::IllegalTransition("cycle has not crashed"));
        }
        row.state = CycleState::Completed;
        Ok(())
    }

    async fn find_cycle(&self, cycle: CycleId) -> Result<Option<CycleRecord>, StoreError> {
        Ok(self.lock()?.cycles.get(&cycle).cloned())
    }

    async fn find_unfinished_cycle(&self) -> Result<Option<CycleRecord>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .cycles
            .values()
            .find(|cycle| cycle.state != CycleState::Completed)
            .cloned())
    }

    async fn void_cycle(
        &self,
        cycle: CycleId,
        at: DateTime<Utc>,
    ) -> Result<Vec<BetRecord>, StoreError> {
        let mut inner = self.lock()?;
        let row = inner.cycles.get_mut(&cycle).ok_or(StoreError::NotFound)?;
        row.state = CycleState::Completed;
        row.crash_point = Some(crate::money::Multiplier::ONE);
        row.ended_at = Some(at);

        let mut refunded = Vec::new();
        for bet in inner.bets.values_mut() {
            let in_scope = bet.cycle_id == Some(cycle)
                || (bet.state == BetState::Pending && bet.cycle_id.is_none());
            if in_scope && !bet.state.is_terminal() {
                bet.state = BetState::Refunded;
                bet.settled_at = Some(at);
                refunded.push(bet.clone());
            }
        }
        refunded.sort_by_key(|bet| bet.seq);
        Ok(refunded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Multiplier;

    fn amount(major: f64) -> Amount {
        Amount::try_from_major(major).unwrap()
    }

    fn cycle_record() -> CycleRecord {
        CycleRecord {
            id: Uuid::new_v4(),
            state: CycleState::Betting,
            seed_hex: "deadbeef".into(),
            hash_hex: String::new(),
            crash_point: None,
            created_at: Utc::now(),
            flew_at: None,
            ended_at: None,
        }
    }

    #[tokio::test]
    async fn wallet_balance_tracks_ledger_sum() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store.credit(user, amount(1000.0), TxKind::Deposit, None).await.unwrap();
        store.debit(user, amount(100.0), TxKind::BetDebit, None).await.unwrap();
        store.credit(user, amount(250.0), TxKind::CashoutCredit, None).await.unwrap();
        let balance = store.balance_of(user).await.unwrap();
        assert_eq!(balance, amount(1150.0));

        let history = store.wallet_history(user, Page::default()).await.unwrap();
        let sum: i64 = history.iter().map(|tx| tx.kind.signed(tx.amount)).sum();
        assert_eq!(sum, balance.cents());

        // Newest first, and the page window applies.
        assert_eq!(history[0].kind, TxKind::CashoutCredit);
        let window = store
            .wallet_history(user, Page { limit: 1, offset: 1 })
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].kind, TxKind::BetDebit);
    }

    #[tokio::test]
    async fn debit_never_goes_negative() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store.credit(user, amount(50.0), TxKind::Deposit, None).await.unwrap();
        let err = store.debit(user, amount(100.0), TxKind::BetDebit, None).await.unwrap_err();
        assert!(matches!(err, StoreError::InsufficientFunds));
        assert_eq!(store.balance_of(user).await.unwrap(), amount(50.0));
        // The failed debit leaves no transaction behind.
        assert_eq!(store.wallet_history(user, Page::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn negative_amounts_are_rejected() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let err = store
            .credit(user, Amount::from_cents(-100), TxKind::Deposit, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NegativeAmount));
    }

    #[tokio::test]
    async fn activation_binds_unbound_and_own_cycle_bets_only() {
        let store = MemoryStore::new();
        let cycle = cycle_record();
        store.insert_cycle(&cycle).await.unwrap();
        let other_cycle = Uuid::new_v4();
        let user = Uuid::new_v4();

        let bound = store
            .create_bet(BetRecord::pending(user, Some(cycle.id), amount(10.0), None))
            .await
            .unwrap();
        let unbound = store
            .create_bet(BetRecord::pending(user, None, amount(20.0), None))
            .await
            .unwrap();
        let foreign = store
            .create_bet(BetRecord::pending(user, Some(other_cycle), amount(30.0), None))
            .await
            .unwrap();

        let activated = store.activate_pending(cycle.id, Utc::now()).await.unwrap();
        let ids: Vec<BetId> = activated.iter().map(|bet| bet.id).collect();
        assert_eq!(ids, vec![bound.id, unbound.id]);
        for bet in &activated {
            assert_eq!(bet.state, BetState::Active);
            assert_eq!(bet.cycle_id, Some(cycle.id));
        }
        let listed = store.list_active_bets(cycle.id).await.unwrap();
        assert_eq!(listed.iter().map(|bet| bet.id).collect::<Vec<_>>(), ids);
        let foreign = store.find_bet(foreign.id).await.unwrap().unwrap();
        assert_eq!(foreign.state, BetState::Pending);

        // Second activation attempt hits the state guard.
        let err = store.activate_pending(cycle.id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition(_)));
    }

    #[tokio::test]
    async fn settle_is_at_most_once() {
        let store = MemoryStore::new();
        let cycle = cycle_record();
        store.insert_cycle(&cycle).await.unwrap();
        let user = Uuid::new_v4();
        let bet = store
            .create_bet(BetRecord::pending(user, Some(cycle.id), amount(100.0), None))
            .await
            .unwrap();

        // Pending rows cannot settle.
        let err = store
            .settle_bet(bet.id, SettleOutcome::Lost, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition(_)));

        store.activate_pending(cycle.id, Utc::now()).await.unwrap();
        let won = store
            .settle_bet(bet.id, SettleOutcome::Won(Multiplier::from_hundredths(200)), Utc::now())
            .await
            .unwrap();
        assert_eq!(won.state, BetState::Won);
        assert_eq!(won.payout, Some(amount(200.0)));
        assert_eq!(won.cashout_multiplier, Some(Multiplier::from_hundredths(200)));

        // Re-settling in either direction is rejected and changes nothing.
        let err = store
            .settle_bet(bet.id, SettleOutcome::Lost, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadySettled));
        let row = store.find_bet(bet.id).await.unwrap().unwrap();
        assert_eq!(row.state, BetState::Won);
        assert_eq!(row.payout, Some(amount(200.0)));
    }

    #[tokio::test]
    async fn open_bet_count_follows_target_cycle() {
        let store = MemoryStore::new();
        let cycle = cycle_record();
        store.insert_cycle(&cycle).await.unwrap();
        let user = Uuid::new_v4();

        store
            .create_bet(BetRecord::pending(user, Some(cycle.id), amount(10.0), None))
            .await
            .unwrap();
        store
            .create_bet(BetRecord::pending(user, None, amount(10.0), None))
            .await
            .unwrap();

        assert_eq!(store.count_open_bets(user, Some(cycle.id)).await.unwrap(), 2);
        // Toward the next cycle only the unbound pending bet counts.
        assert_eq!(store.count_open_bets(user, None).await.unwrap(), 1);

        store.activate_pending(cycle.id, Utc::now()).await.unwrap();
        // Active bets are bound, so the next-cycle count drops to zero.
        assert_eq!(store.count_open_bets(user, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn void_cycle_refunds_non_terminal_bets() {
        let store = MemoryStore::new();
        let cycle = cycle_record();
        store.insert_cycle(&cycle).await.unwrap();
        let user = Uuid::new_v4();

        let open = store
            .create_bet(BetRecord::pending(user, Some(cycle.id), amount(10.0), None))
            .await
            .unwrap();
        store.activate_pending(cycle.id, Utc::now()).await.unwrap();
        // Placed after lock, so it stays pending-bound; refund scope still
        // covers it.
        let late = store
            .create_bet(BetRecord::pending(user, Some(cycle.id), amount(10.0), None))
            .await
            .unwrap();
        let refunded = store.void_cycle(cycle.id, Utc::now()).await.unwrap();
        let ids: Vec<BetId> = refunded.iter().map(|bet| bet.id).collect();
        assert_eq!(ids, vec![open.id, late.id]);

        assert!(store.find_unfinished_cycle().await.unwrap().is_none());
        let row = store.find_bet(open.id).await.unwrap().unwrap();
        assert_eq!(row.state, BetState::Refunded);
    }
}
