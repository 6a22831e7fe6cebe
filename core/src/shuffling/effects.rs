//! Effects produced by the engine.
//!
//! The engine never writes to a store. Each transaction or block produces a
//! [`StateDiff`] which the caller commits atomically at the block height,
//! after which the queued [`ShufflingEvent`]s are delivered to observers.

use coinshuffle_account::{AccountId, Holding, LedgerEvent, PublicKey};

use crate::shuffling::types::{BlockRecord, Participant, Shuffling, ShufflingId};

/// Signed delta on one (account, holding) balance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BalanceChange {
    pub account: AccountId,
    pub holding: Holding,
    pub confirmed: i64,
    pub unconfirmed: i64,
    pub event: LedgerEvent,
    pub shuffling_id: Option<ShufflingId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShufflingEvent {
    Created { issuer: AccountId },
    ParticipantRegistered { account: AccountId },
    ProcessingAssigned { assignee: AccountId },
    ParticipantProcessed { account: AccountId },
    ProcessingFinished,
    ParticipantVerified { account: AccountId },
    BlameStarted { assignee: AccountId },
    ParticipantCancelled { account: AccountId },
    Done,
    Cancelled { blamed: Option<AccountId> },
    Deleted,
}

/// Receives engine events after their diff has been committed.
pub trait ShufflingObserver: Send + Sync {
    fn notify(&self, shuffling_id: ShufflingId, event: &ShufflingEvent);
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateDiff {
    /// Full rows; the last write for an id wins.
    pub shufflings: Vec<Shuffling>,
    /// Shufflings (and their participants) to tombstone.
    pub deleted_shufflings: Vec<ShufflingId>,
    pub participants: Vec<Participant>,
    pub balance_changes: Vec<BalanceChange>,
    /// Accounts whose public key becomes known. Ignored if already set.
    pub public_keys: Vec<(AccountId, PublicKey)>,
    pub events: Vec<(ShufflingId, ShufflingEvent)>,
    /// Record of the block this diff closes, if any.
    pub block: Option<BlockRecord>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.shufflings.is_empty()
            && self.deleted_shufflings.is_empty()
            && self.participants.is_empty()
            && self.balance_changes.is_empty()
            && self.public_keys.is_empty()
            && self.events.is_empty()
            && self.block.is_none()
    }

    pub fn merge(&mut self, other: StateDiff) {
        self.shufflings.extend(other.shufflings);
        self.deleted_shufflings.extend(other.deleted_shufflings);
        self.participants.extend(other.participants);
        self.balance_changes.extend(other.balance_changes);
        self.public_keys.extend(other.public_keys);
        self.events.extend(other.events);
        if other.block.is_some() {
            self.block = other.block;
        }
    }

    pub fn change_balance(
        &mut self,
        account: AccountId,
        holding: Holding,
        confirmed: i64,
        unconfirmed: i64,
        event: LedgerEvent,
        shuffling_id: Option<ShufflingId>,
    ) {
        if confirmed == 0 && unconfirmed == 0 {
            return;
        }
        self.balance_changes.push(BalanceChange {
            account,
            holding,
            confirmed,
            unconfirmed,
            event,
            shuffling_id,
        });
    }

    /// Net delta this diff applies to one balance.
    pub fn balance_delta(&self, account: AccountId, holding: Holding) -> (i64, i64) {
        self.balance_changes
            .iter()
            .filter(|c| c.account == account && c.holding == holding)
            .fold((0, 0), |(c, u), change| {
                (c + change.confirmed, u + change.unconfirmed)
            })
    }

    pub fn emit(&mut self, shuffling_id: ShufflingId, event: ShufflingEvent) {
        self.events.push((shuffling_id, event));
    }

    /// The newest queued row for `id`, if this diff touches it.
    pub fn shuffling(&self, id: ShufflingId) -> Option<&Shuffling> {
        self.shufflings.iter().rev().find(|s| s.id == id)
    }
}
