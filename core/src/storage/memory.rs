use std::collections::{BTreeMap, HashMap};

use anyhow::Result;

use coinshuffle_account::{AccountId, Balance, Holding, PublicKey};

use crate::shuffling::effects::StateDiff;
use crate::shuffling::types::{BlockRecord, Height, Participant, Shuffling, ShufflingId};
use crate::storage::state::{StateStore, fold_balances};

/// Version history of one row. `None` marks a deletion.
#[derive(Clone, Debug)]
struct Versioned<T> {
    versions: BTreeMap<Height, Option<T>>,
}

impl<T> Default for Versioned<T> {
    fn default() -> Self {
        Self {
            versions: BTreeMap::new(),
        }
    }
}

impl<T: Clone> Versioned<T> {
    fn at(&self, height: Height) -> Option<&T> {
        self.versions
            .range(..=height)
            .next_back()
            .and_then(|(_, value)| value.as_ref())
    }

    fn write(&mut self, height: Height, value: Option<T>) {
        self.versions.insert(height, value);
    }

    fn truncate_above(&mut self, height: Height) {
        if let Some(above) = height.checked_add(1) {
            self.versions.split_off(&above);
        }
    }

    fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// In-memory versioned store. Used by tests and the memory-backed devnet.
#[derive(Clone, Debug, Default)]
pub struct MemStore {
    shufflings: BTreeMap<ShufflingId, Versioned<Shuffling>>,
    participants: BTreeMap<(ShufflingId, u8), Versioned<Participant>>,
    balances: HashMap<(AccountId, Holding), Versioned<Balance>>,
    public_keys: HashMap<AccountId, Versioned<PublicKey>>,
    blocks: BTreeMap<Height, BlockRecord>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemStore {
    fn shuffling(&self, id: ShufflingId, height: Height) -> Result<Option<Shuffling>> {
        Ok(self
            .shufflings
            .get(&id)
            .and_then(|rows| rows.at(height))
            .cloned())
    }

    fn shufflings(&self, height: Height) -> Result<Vec<Shuffling>> {
        Ok(self
            .shufflings
            .values()
            .filter_map(|rows| rows.at(height).cloned())
            .collect())
    }

    fn participants(&self, id: ShufflingId, height: Height) -> Result<Vec<Participant>> {
        Ok(self
            .participants
            .range((id, 0)..=(id, u8::MAX))
            .filter_map(|(_, rows)| rows.at(height).cloned())
            .collect())
    }

    fn public_key(&self, account: AccountId, height: Height) -> Result<Option<PublicKey>> {
        Ok(self
            .public_keys
            .get(&account)
            .and_then(|rows| rows.at(height))
            .copied())
    }

    fn balance(&self, account: AccountId, holding: Holding, height: Height) -> Result<Balance> {
        Ok(self
            .balances
            .get(&(account, holding))
            .and_then(|rows| rows.at(height))
            .copied()
            .unwrap_or_default())
    }

    fn block(&self, height: Height) -> Result<Option<BlockRecord>> {
        Ok(self.blocks.get(&height).copied())
    }

    fn tip(&self) -> Result<Option<Height>> {
        Ok(self.blocks.keys().next_back().copied())
    }

    fn apply_diff(&mut self, height: Height, diff: &StateDiff) -> Result<()> {
        let balances = fold_balances(&*self, height, diff)?;

        for (key, balance) in balances {
            self.balances
                .entry(key)
                .or_default()
                .write(height, Some(balance));
        }

        for (account, key) in &diff.public_keys {
            if self.public_key(*account, height)?.is_none() {
                self.public_keys
                    .entry(*account)
                    .or_default()
                    .write(height, Some(*key));
            }
        }

        for shuffling in &diff.shufflings {
            let mut row = shuffling.clone();
            row.height = height;
            self.shufflings
                .entry(row.id)
                .or_default()
                .write(height, Some(row));
        }

        for participant in &diff.participants {
            let mut row = participant.clone();
            row.height = height;
            self.participants
                .entry((row.shuffling_id, row.index))
                .or_default()
                .write(height, Some(row));
        }

        if let Some(record) = diff.block {
            self.blocks.insert(height, record);
        }

        for id in &diff.deleted_shufflings {
            let indexes: Vec<u8> = self
                .participants(*id, height)?
                .iter()
                .map(|p| p.index)
                .collect();
            for index in indexes {
                if let Some(rows) = self.participants.get_mut(&(*id, index)) {
                    rows.write(height, None);
                }
            }
            if let Some(rows) = self.shufflings.get_mut(id) {
                rows.write(height, None);
            }
        }

        Ok(())
    }

    fn rollback_to(&mut self, height: Height) -> Result<()> {
        self.shufflings.values_mut().for_each(|v| v.truncate_above(height));
        self.shufflings.retain(|_, v| !v.is_empty());
        self.participants.values_mut().for_each(|v| v.truncate_above(height));
        self.participants.retain(|_, v| !v.is_empty());
        self.balances.values_mut().for_each(|v| v.truncate_above(height));
        self.balances.retain(|_, v| !v.is_empty());
        self.public_keys.values_mut().for_each(|v| v.truncate_above(height));
        self.public_keys.retain(|_, v| !v.is_empty());
        if let Some(above) = height.checked_add(1) {
            self.blocks.split_off(&above);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shuffling::types::Stage;
    use coinshuffle_account::LedgerEvent;

    fn row(id: u64, stage: Stage) -> Shuffling {
        Shuffling {
            id: ShufflingId(id),
            full_hash: [id as u8; 32],
            holding: Holding::Coin,
            issuer_id: AccountId(1),
            amount: 10,
            participant_count: 3,
            blocks_remaining: Some(5),
            stage,
            assignee: Some(AccountId(1)),
            recipient_public_keys: vec![],
            registrant_count: 1,
            height: 0,
        }
    }

    #[test]
    fn reads_are_as_of_height() {
        let mut store = MemStore::new();
        let mut diff = StateDiff::default();
        diff.shufflings.push(row(1, Stage::Registration));
        store.apply_diff(10, &diff).unwrap();

        let mut diff = StateDiff::default();
        diff.shufflings.push(row(1, Stage::Processing));
        store.apply_diff(12, &diff).unwrap();

        assert!(store.shuffling(ShufflingId(1), 9).unwrap().is_none());
        let at_11 = store.shuffling(ShufflingId(1), 11).unwrap().unwrap();
        assert_eq!(at_11.stage, Stage::Registration);
        assert_eq!(at_11.height, 10);
        assert_eq!(
            store.shuffling(ShufflingId(1), 12).unwrap().unwrap().stage,
            Stage::Processing
        );
    }

    #[test]
    fn rollback_discards_newer_versions() {
        let mut store = MemStore::new();
        let alice = AccountId(5);
        let mut diff = StateDiff::default();
        diff.change_balance(alice, Holding::Coin, 100, 100, LedgerEvent::Genesis, None);
        store.apply_diff(1, &diff).unwrap();
        store.apply_diff(3, &diff).unwrap();

        assert_eq!(store.balance(alice, Holding::Coin, 3).unwrap().confirmed, 200);
        store.rollback_to(2).unwrap();
        assert_eq!(store.balance(alice, Holding::Coin, 3).unwrap().confirmed, 100);
    }

    #[test]
    fn deletion_hides_rows_from_then_on() {
        let mut store = MemStore::new();
        let mut diff = StateDiff::default();
        diff.shufflings.push(row(1, Stage::Done));
        diff.participants
            .push(Participant::new(ShufflingId(1), AccountId(1), 0));
        store.apply_diff(4, &diff).unwrap();

        let mut delete = StateDiff::default();
        delete.deleted_shufflings.push(ShufflingId(1));
        store.apply_diff(6, &delete).unwrap();

        assert_eq!(store.shufflings(5).unwrap().len(), 1);
        assert!(store.shufflings(6).unwrap().is_empty());
        assert!(store.participants(ShufflingId(1), 6).unwrap().is_empty());
        assert_eq!(store.participants(ShufflingId(1), 5).unwrap().len(), 1);
    }

    #[test]
    fn overflow_leaves_store_untouched() {
        let mut store = MemStore::new();
        let alice = AccountId(5);
        let mut diff = StateDiff::default();
        diff.change_balance(alice, Holding::Coin, i64::MAX, 0, LedgerEvent::Genesis, None);
        store.apply_diff(1, &diff).unwrap();

        let mut bad = StateDiff::default();
        bad.shufflings.push(row(2, Stage::Registration));
        bad.change_balance(alice, Holding::Coin, 1, 0, LedgerEvent::Genesis, None);
        assert!(store.apply_diff(2, &bad).is_err());
        assert!(store.shuffling(ShufflingId(2), 2).unwrap().is_none());
    }

    #[test]
    fn block_records_are_exact_and_roll_back() {
        let mut store = MemStore::new();
        for height in 1..=3 {
            let diff = StateDiff {
                block: Some(BlockRecord {
                    generator: Some(AccountId(height)),
                }),
                ..Default::default()
            };
            store.apply_diff(height, &diff).unwrap();
        }
        assert_eq!(store.tip().unwrap(), Some(3));
        assert_eq!(store.block(4).unwrap(), None);

        store.rollback_to(1).unwrap();
        assert_eq!(store.tip().unwrap(), Some(1));
        assert_eq!(store.block(2).unwrap(), None);
        assert_eq!(
            store.block(1).unwrap().unwrap().generator,
            Some(AccountId(1))
        );
    }

    #[test]
    fn public_key_is_set_once() {
        let mut store = MemStore::new();
        let mut diff = StateDiff::default();
        diff.public_keys.push((AccountId(1), [1u8; 32]));
        store.apply_diff(1, &diff).unwrap();

        let mut again = StateDiff::default();
        again.public_keys.push((AccountId(1), [2u8; 32]));
        store.apply_diff(2, &again).unwrap();
        assert_eq!(store.public_key(AccountId(1), 2).unwrap(), Some([1u8; 32]));
    }
}
