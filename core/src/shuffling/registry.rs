//! Lookups over the shuffling table as of a height.

use coinshuffle_account::{AccountId, Holding};

use crate::shuffling::effects::StateDiff;
use crate::shuffling::errors::{Result, ShufflingError};
use crate::shuffling::participant::ParticipantList;
use crate::shuffling::types::{Shuffling, ShufflingId, Stage};
use crate::storage::state::{Snapshot, StateStore};

/// A shuffling together with its participants, loaded for mutation.
#[derive(Clone, Debug)]
pub struct ShufflingAggregate {
    pub shuffling: Shuffling,
    pub participants: ParticipantList,
}

impl ShufflingAggregate {
    pub fn id(&self) -> ShufflingId {
        self.shuffling.id
    }

    /// Hash echoed by every message after registration.
    pub fn state_hash(&self) -> [u8; 32] {
        self.participants
            .state_hash(&self.shuffling.recipient_public_keys)
    }

    pub fn is_last(&self, account: AccountId) -> bool {
        self.participants.is_last(account)
    }

    /// Queues the shuffling row and all participant rows.
    pub fn write_to(self, diff: &mut StateDiff) {
        diff.shufflings.push(self.shuffling);
        diff.participants.extend(self.participants.into_rows());
    }
}

/// Read-side queries of the shuffling table.
pub struct ShuffleRegistry<'a, S: StateStore + ?Sized> {
    snapshot: Snapshot<'a, S>,
}

impl<'a, S: StateStore + ?Sized> ShuffleRegistry<'a, S> {
    pub fn new(snapshot: Snapshot<'a, S>) -> Self {
        Self { snapshot }
    }

    pub fn get(&self, id: ShufflingId) -> Result<Option<Shuffling>> {
        self.snapshot.shuffling(id)
    }

    pub fn load(&self, id: ShufflingId) -> Result<ShufflingAggregate> {
        let shuffling = self.snapshot.require_shuffling(id)?;
        let participants = self.snapshot.participants(id)?;
        if participants.len() != usize::from(shuffling.registrant_count) {
            return Err(ShufflingError::CorruptParticipants(id));
        }
        Ok(ShufflingAggregate {
            shuffling,
            participants,
        })
    }

    /// Registration references a shuffling by the full hash of its creation.
    pub fn get_by_full_hash(&self, full_hash: &[u8; 32]) -> Result<Option<Shuffling>> {
        Ok(self
            .snapshot
            .shufflings()?
            .into_iter()
            .find(|s| &s.full_hash == full_hash))
    }

    pub fn all(&self) -> Result<Vec<Shuffling>> {
        self.snapshot.shufflings()
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.all()?.len())
    }

    /// Shufflings still counting down a deadline.
    pub fn active(&self) -> Result<Vec<Shuffling>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|s| s.blocks_remaining.is_some())
            .collect())
    }

    pub fn active_count(&self) -> Result<usize> {
        Ok(self.active()?.len())
    }

    pub fn by_stage(&self, stage: Stage) -> Result<Vec<Shuffling>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|s| s.stage == stage)
            .collect())
    }

    pub fn by_holding(
        &self,
        holding: Holding,
        stage: Option<Stage>,
        include_finished: bool,
    ) -> Result<Vec<Shuffling>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|s| s.holding == holding)
            .filter(|s| stage.is_none_or(|stage| s.stage == stage))
            .filter(|s| include_finished || s.is_active())
            .collect())
    }

    /// Shufflings the account has registered for.
    pub fn by_participant(
        &self,
        account: AccountId,
        include_finished: bool,
    ) -> Result<Vec<Shuffling>> {
        let mut out = Vec::new();
        for shuffling in self.all()? {
            if !include_finished && !shuffling.is_active() {
                continue;
            }
            if self.snapshot.participants(shuffling.id)?.contains(account) {
                out.push(shuffling);
            }
        }
        Ok(out)
    }

    /// Active shufflings currently waiting on `account`.
    pub fn assigned_to(&self, account: AccountId) -> Result<Vec<Shuffling>> {
        Ok(self
            .active()?
            .into_iter()
            .filter(|s| s.assignee == Some(account))
            .collect())
    }
}
