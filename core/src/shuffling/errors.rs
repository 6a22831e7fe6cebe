use coinshuffle_account::{AccountError, AccountId};
use coinshuffle_privacy::CryptoError;

use crate::shuffling::types::{ParticipantState, ShufflingId, Stage};

pub type Result<T, E = ShufflingError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ShufflingError {
    /// The transaction fails validation and must not enter the ledger.
    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("illegal stage transition {from:?} -> {to:?}")]
    IllegalTransition { from: Stage, to: Stage },

    #[error("stage {stage:?} does not allow assignee {assignee:?}")]
    IllegalAssignee {
        stage: Stage,
        assignee: Option<AccountId>,
    },

    #[error("stage {stage:?} does not allow {blocks} blocks remaining")]
    IllegalDeadline { stage: Stage, blocks: u16 },

    #[error("participant {account} cannot move from {from:?} to {to:?}")]
    IllegalParticipantState {
        account: AccountId,
        from: ParticipantState,
        to: ParticipantState,
    },

    #[error("state hash mismatch: expected {expected}, got {actual}")]
    StateHashMismatch { expected: String, actual: String },

    #[error("shuffling {0} not found")]
    UnknownShuffling(ShufflingId),

    #[error("account {account} is not a participant of shuffling {shuffling}")]
    NotParticipant {
        shuffling: ShufflingId,
        account: AccountId,
    },

    #[error("no public key registered for account {0}")]
    MissingPublicKey(AccountId),

    #[error("participant list of shuffling {0} is corrupt")]
    CorruptParticipants(ShufflingId),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Account(#[from] AccountError),

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl ShufflingError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        ShufflingError::Rejected(reason.into())
    }

    pub fn state_hash_mismatch(expected: &[u8; 32], actual: &[u8; 32]) -> Self {
        ShufflingError::StateHashMismatch {
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        }
    }

    /// True for validation failures; anything else points at a bug or a
    /// broken store.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ShufflingError::Rejected(_)
                | ShufflingError::StateHashMismatch { .. }
                | ShufflingError::UnknownShuffling(_)
                | ShufflingError::NotParticipant { .. }
                | ShufflingError::Codec(_)
        )
    }
}
