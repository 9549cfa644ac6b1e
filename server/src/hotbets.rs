//! Hot-bet index: the in-memory projection of the current cycle's active
//! bets. O(1) add and remove, plus an ordered sweep list so auto-cash-out
//! can walk ascending thresholds and stop at the first entry above the
//! current multiplier. Never consulted for durable queries.

use std::collections::{BTreeSet, HashMap};

use crate::money::{Amount, Multiplier};
use crate::store::{BetId, BetRecord, UserId};

/// Sort key for entries without an auto threshold; they sweep last, i.e.
/// never.
const NO_THRESHOLD: u32 = u32::MAX;

#[derive(Debug, Clone)]
pub struct HotBetEntry {
    pub bet_id: BetId,
    pub user_id: UserId,
    pub stake: Amount,
    pub auto_cashout: Option<Multiplier>,
}

impl From<&BetRecord> for HotBetEntry {
    fn from(bet: &BetRecord) -> Self {
        HotBetEntry {
            bet_id: bet.id,
            user_id: bet.user_id,
            stake: bet.stake,
            auto_cashout: bet.auto_cashout,
        }
    }
}

#[derive(Default)]
pub struct HotBetIndex {
    by_bet: HashMap<BetId, HotBetEntry>,
    by_user: HashMap<UserId, Vec<BetId>>,
    sweep: BTreeSet<(u32, BetId)>,
}

impl HotBetIndex {
    pub fn new() -> Self {
        HotBetIndex::default()
    }

    fn sweep_key(entry: &HotBetEntry) -> (u32, BetId) {
        let threshold = entry
            .auto_cashout
            .map(|m| m.hundredths())
            .unwrap_or(NO_THRESHOLD);
        (threshold, entry.bet_id)
    }

    pub fn insert(&mut self, entry: HotBetEntry) {
        self.sweep.insert(Self::sweep_key(&entry));
        self.by_user.entry(entry.user_id).or_default().push(entry.bet_id);
        self.by_bet.insert(entry.bet_id, entry);
    }

    pub fn remove(&mut self, bet_id: BetId) -> Option<HotBetEntry> {
        let entry = self.by_bet.remove(&bet_id)?;
        self.sweep.remove(&Self::sweep_key(&entry));
        if let Some(bets) = self.by_user.get_mut(&entry.user_id) {
            bets.retain(|id| *id != bet_id);
            if bets.is_empty() {
                self.by_user.remove(&entry.user_id);
            }
        }
        Some(entry)
    }

    /// Entries whose auto threshold is at or below the current multiplier,
    /// in ascending threshold order. Early-exits at the first entry above.
    pub fn ripe(&self, multiplier: Multiplier) -> Vec<HotBetEntry> {
        let mut ripe = Vec::new();
        for (threshold, bet_id) in &self.sweep {
            if *threshold == NO_THRESHOLD || *threshold > multiplier.hundredths() {
                break;
            }
            if let Some(entry) = self.by_bet.get(bet_id) {
                ripe.push(entry.clone());
            }
        }
        ripe
    }

    pub fn entries_for_user(&self, user: UserId) -> Vec<HotBetEntry> {
        self.by_user
            .get(&user)
            .into_iter()
            .flatten()
            .filter_map(|bet_id| self.by_bet.get(bet_id))
            .cloned()
            .collect()
    }

    /// Remove and return everything, in insertion-independent sweep order.
    pub fn drain(&mut self) -> Vec<HotBetEntry> {
        let all: Vec<HotBetEntry> = self.by_bet.values().cloned().collect();
        self.clear();
        all
    }

    pub fn clear(&mut self) {
        self.by_bet.clear();
        self.by_user.clear();
        self.sweep.clear();
    }

    pub fn len(&self) -> usize {
        self.by_bet.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_bet.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn entry(threshold: Option<u32>) -> HotBetEntry {
        HotBetEntry {
            bet_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            stake: Amount::from_cents(10_000),
            auto_cashout: threshold.map(Multiplier::from_hundredths),
        }
    }

    #[test]
    fn sweep_walks_ascending_thresholds_with_early_exit() {
        let mut index = HotBetIndex::new();
        let low = entry(Some(150));
        let mid = entry(Some(250));
        let high = entry(Some(900));
        let manual = entry(None);
        for e in [&high, &manual, &low, &mid] {
            index.insert((*e).clone());
        }

        let ripe = index.ripe(Multiplier::from_hundredths(250));
        let ids: Vec<BetId> = ripe.iter().map(|e| e.bet_id).collect();
        assert_eq!(ids, vec![low.bet_id, mid.bet_id]);

        // Nothing ripens below the lowest threshold.
        assert!(index.ripe(Multiplier::from_hundredths(149)).is_empty());
        // Manual-only entries never ripen.
        index.remove(low.bet_id);
        index.remove(mid.bet_id);
        index.remove(high.bet_id);
        assert!(index.ripe(Multiplier::from_hundredths(u32::MAX - 1)).is_empty());
    }

    #[test]
    fn remove_is_complete() {
        let mut index = HotBetIndex::new();
        let e = entry(Some(200));
        index.insert(e.clone());
        assert_eq!(index.len(), 1);
        assert_eq!(index.entries_for_user(e.user_id).len(), 1);

        let removed = index.remove(e.bet_id).unwrap();
        assert_eq!(removed.bet_id, e.bet_id);
        assert!(index.is_empty());
        assert!(index.entries_for_user(e.user_id).is_empty());
        assert!(index.ripe(Multiplier::from_hundredths(u32::MAX - 1)).is_empty());
        assert!(index.remove(e.bet_id).is_none());
    }

    #[test]
    fn drain_empties_the_index() {
        let mut index = HotBetIndex::new();
        index.insert(entry(Some(120)));
        index.insert(entry(None));
        let drained = index.drain();
        assert_eq!(drained.len(), 2);
        assert!(index.is_empty());
    }

    #[test]
    fn user_can_hold_multiple_entries() {
        let mut index = HotBetIndex::new();
        let user = Uuid::new_v4();
        let mut first = entry(Some(130));
        first.user_id = user;
        let mut second = entry(None);
        second.user_id = user;
        index.insert(first.clone());
        index.insert(second.clone());
        assert_eq!(index.entries_for_user(user).len(), 2);
        index.remove(first.bet_id);
        assert_eq!(index.entries_for_user(user).len(), 1);
    }
}
