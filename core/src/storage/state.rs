use std::collections::HashMap;
use std::collections::hash_map::Entry;

use anyhow::{Context, Result};

use coinshuffle_account::{AccountId, Balance, Holding, PublicKey};

use crate::shuffling::effects::StateDiff;
use crate::shuffling::errors::{self, ShufflingError};
use crate::shuffling::participant::ParticipantList;
use crate::shuffling::types::{BlockRecord, Height, Participant, Shuffling, ShufflingId};

/// Height-versioned ledger state.
///
/// Every read is "as of" a height: it returns the newest version written at
/// or below it. Writes only happen through [`StateStore::apply_diff`], so a
/// diff is either fully visible at its height or not at all.
pub trait StateStore {
    fn shuffling(&self, id: ShufflingId, height: Height) -> Result<Option<Shuffling>>;

    /// All shufflings not deleted as of `height`, ordered by id.
    fn shufflings(&self, height: Height) -> Result<Vec<Shuffling>>;

    /// Participants of `id` as of `height`, in registration order.
    fn participants(&self, id: ShufflingId, height: Height) -> Result<Vec<Participant>>;

    fn public_key(&self, account: AccountId, height: Height) -> Result<Option<PublicKey>>;

    /// Zero when the account never held `holding`.
    fn balance(&self, account: AccountId, holding: Holding, height: Height) -> Result<Balance>;

    /// Record of the block at exactly `height`.
    fn block(&self, height: Height) -> Result<Option<BlockRecord>>;

    /// Highest height with a block record, if any block was stored.
    fn tip(&self) -> Result<Option<Height>>;

    fn apply_diff(&mut self, height: Height, diff: &StateDiff) -> Result<()>;

    /// Discards every version written above `height`.
    fn rollback_to(&mut self, height: Height) -> Result<()>;
}

/// A read-only view of a store at one height.
pub struct Snapshot<'a, S: StateStore + ?Sized> {
    pub store: &'a S,
    pub height: Height,
}

impl<S: StateStore + ?Sized> Clone for Snapshot<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: StateStore + ?Sized> Copy for Snapshot<'_, S> {}

impl<'a, S: StateStore + ?Sized> Snapshot<'a, S> {
    pub fn new(store: &'a S, height: Height) -> Self {
        Self { store, height }
    }

    pub fn shuffling(&self, id: ShufflingId) -> errors::Result<Option<Shuffling>> {
        Ok(self.store.shuffling(id, self.height)?)
    }

    pub fn require_shuffling(&self, id: ShufflingId) -> errors::Result<Shuffling> {
        self.shuffling(id)?
            .ok_or(ShufflingError::UnknownShuffling(id))
    }

    pub fn shufflings(&self) -> errors::Result<Vec<Shuffling>> {
        Ok(self.store.shufflings(self.height)?)
    }

    pub fn participants(&self, id: ShufflingId) -> errors::Result<ParticipantList> {
        let rows = self.store.participants(id, self.height)?;
        ParticipantList::from_rows(id, rows)
    }

    pub fn public_key(&self, account: AccountId) -> errors::Result<Option<PublicKey>> {
        Ok(self.store.public_key(account, self.height)?)
    }

    pub fn require_public_key(&self, account: AccountId) -> errors::Result<PublicKey> {
        self.public_key(account)?
            .ok_or(ShufflingError::MissingPublicKey(account))
    }

    pub fn balance(&self, account: AccountId, holding: Holding) -> errors::Result<Balance> {
        Ok(self.store.balance(account, holding, self.height)?)
    }

    /// Generators of up to `count` blocks below this height, most recent
    /// first. Genesis blocks contribute nothing.
    pub fn previous_generators(&self, count: usize) -> errors::Result<Vec<AccountId>> {
        let mut generators = Vec::with_capacity(count);
        for height in (1..self.height).rev().take(count) {
            let record = self
                .store
                .block(height)?
                .with_context(|| format!("no block record at height {height}"))?;
            generators.extend(record.generator);
        }
        Ok(generators)
    }
}

/// Folds the diff's balance deltas onto the balances stored at `height`.
///
/// Fails on overflow before anything is written, so callers can apply the
/// result unconditionally.
pub(crate) fn fold_balances<S: StateStore + ?Sized>(
    store: &S,
    height: Height,
    diff: &StateDiff,
) -> Result<HashMap<(AccountId, Holding), Balance>> {
    let mut balances: HashMap<(AccountId, Holding), Balance> = HashMap::new();
    for change in &diff.balance_changes {
        let key = (change.account, change.holding);
        let balance = match balances.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(store.balance(change.account, change.holding, height)?)
            }
        };
        balance
            .apply(change.confirmed, change.unconfirmed)
            .with_context(|| {
                format!(
                    "balance of account {} ({:?}) for {:?}",
                    change.account, change.holding, change.event
                )
            })?;
    }
    Ok(balances)
}
