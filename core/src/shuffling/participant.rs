use std::collections::HashMap;

use sha2::{Digest, Sha256};

use coinshuffle_account::{AccountId, PublicKey};

use crate::shuffling::errors::{Result, ShufflingError};
use crate::shuffling::types::{Participant, ParticipantState, ShufflingId};

/// Ordered registrants of one shuffling.
///
/// Keeps registration order and an account index side by side, so lookups
/// by account and walks by position are both O(1).
#[derive(Clone, Debug, Default)]
pub struct ParticipantList {
    shuffling_id: ShufflingId,
    participants: Vec<Participant>,
    index: HashMap<AccountId, usize>,
}

impl ParticipantList {
    pub fn new(shuffling_id: ShufflingId) -> Self {
        Self {
            shuffling_id,
            participants: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Rebuilds the list from stored rows, checking that indexes are
    /// contiguous and each row points at its successor.
    pub fn from_rows(shuffling_id: ShufflingId, mut rows: Vec<Participant>) -> Result<Self> {
        rows.sort_by_key(|p| p.index);
        let corrupt = || ShufflingError::CorruptParticipants(shuffling_id);

        let mut index = HashMap::with_capacity(rows.len());
        for (position, row) in rows.iter().enumerate() {
            if row.shuffling_id != shuffling_id || usize::from(row.index) != position {
                return Err(corrupt());
            }
            let expected_next = rows.get(position + 1).map(|next| next.account_id);
            if row.next_account_id != expected_next {
                return Err(corrupt());
            }
            if index.insert(row.account_id, position).is_some() {
                return Err(corrupt());
            }
        }

        Ok(Self {
            shuffling_id,
            participants: rows,
            index,
        })
    }

    pub fn shuffling_id(&self) -> ShufflingId {
        self.shuffling_id
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn contains(&self, account: AccountId) -> bool {
        self.index.contains_key(&account)
    }

    pub fn position(&self, account: AccountId) -> Option<usize> {
        self.index.get(&account).copied()
    }

    pub fn get(&self, account: AccountId) -> Option<&Participant> {
        self.position(account).map(|i| &self.participants[i])
    }

    pub fn get_mut(&mut self, account: AccountId) -> Option<&mut Participant> {
        self.position(account).map(|i| &mut self.participants[i])
    }

    pub fn require(&self, account: AccountId) -> Result<&Participant> {
        self.get(account).ok_or(ShufflingError::NotParticipant {
            shuffling: self.shuffling_id,
            account,
        })
    }

    pub fn require_mut(&mut self, account: AccountId) -> Result<&mut Participant> {
        let shuffling = self.shuffling_id;
        self.get_mut(account)
            .ok_or(ShufflingError::NotParticipant { shuffling, account })
    }

    pub fn at(&self, position: usize) -> Option<&Participant> {
        self.participants.get(position)
    }

    pub fn first(&self) -> Option<&Participant> {
        self.participants.first()
    }

    pub fn last(&self) -> Option<&Participant> {
        self.participants.last()
    }

    pub fn is_last(&self, account: AccountId) -> bool {
        self.last().is_some_and(|p| p.account_id == account)
    }

    pub fn previous(&self, account: AccountId) -> Option<&Participant> {
        let position = self.position(account)?;
        position.checked_sub(1).map(|i| &self.participants[i])
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Participant> {
        self.participants.iter()
    }

    pub fn account_ids(&self) -> impl Iterator<Item = AccountId> + '_ {
        self.participants.iter().map(|p| p.account_id)
    }

    /// Appends a registrant and links the previous tail to it.
    pub fn register(&mut self, account: AccountId) -> Result<&Participant> {
        if self.contains(account) {
            return Err(ShufflingError::rejected(format!(
                "account {account} is already registered"
            )));
        }
        let position = self.participants.len();
        let index = u8::try_from(position)
            .map_err(|_| ShufflingError::CorruptParticipants(self.shuffling_id))?;

        if let Some(tail) = self.participants.last_mut() {
            tail.next_account_id = Some(account);
        }
        self.participants
            .push(Participant::new(self.shuffling_id, account, index));
        self.index.insert(account, position);
        Ok(&self.participants[position])
    }

    pub fn count_in(&self, state: ParticipantState) -> usize {
        self.participants.iter().filter(|p| p.state == state).count()
    }

    pub fn all_in(&self, state: ParticipantState) -> bool {
        !self.is_empty() && self.participants.iter().all(|p| p.state == state)
    }

    /// SHA-256 over participant ids in order, then every recipient key.
    ///
    /// Before recipients are disclosed this is the hash of the ids alone.
    pub fn state_hash(&self, recipient_public_keys: &[PublicKey]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for account in self.account_ids() {
            hasher.update(account.to_le_bytes());
        }
        for key in recipient_public_keys {
            hasher.update(key);
        }
        hasher.finalize().into()
    }

    pub fn into_rows(self) -> Vec<Participant> {
        self.participants
    }
}
