use std::fmt;

use serde::{Deserialize, Serialize};

use coinshuffle_account::{AccountId, Holding, PublicKey};
use coinshuffle_privacy::KeySeed;

use crate::shuffling::errors::{Result, ShufflingError};

/// Block height. Every stored row is versioned by the height that wrote it.
pub type Height = u64;

// ============================================================================
// Identifiers
// ============================================================================

/// Id of the creating transaction.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ShufflingId(pub u64);

impl ShufflingId {
    /// Nonce bound into every onion layer of this shuffling.
    pub fn nonce(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for ShufflingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Stage
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Registration,
    Processing,
    Verification,
    Blame,
    Cancelled,
    Done,
}

impl Stage {
    pub fn code(self) -> u8 {
        match self {
            Stage::Registration => 0,
            Stage::Processing => 1,
            Stage::Verification => 2,
            Stage::Blame => 3,
            Stage::Cancelled => 4,
            Stage::Done => 5,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Stage::Registration),
            1 => Ok(Stage::Processing),
            2 => Ok(Stage::Verification),
            3 => Ok(Stage::Blame),
            4 => Ok(Stage::Cancelled),
            5 => Ok(Stage::Done),
            other => Err(ShufflingError::Codec(format!("unknown stage code {other}"))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Cancelled | Stage::Done)
    }
}

// ============================================================================
// Participant state
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticipantState {
    Registered,
    Processed,
    Verified,
    Cancelled,
}

impl ParticipantState {
    pub fn code(self) -> u8 {
        match self {
            ParticipantState::Registered => 0,
            ParticipantState::Processed => 1,
            ParticipantState::Verified => 2,
            ParticipantState::Cancelled => 3,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(ParticipantState::Registered),
            1 => Ok(ParticipantState::Processed),
            2 => Ok(ParticipantState::Verified),
            3 => Ok(ParticipantState::Cancelled),
            other => Err(ShufflingError::Codec(format!(
                "unknown participant state code {other}"
            ))),
        }
    }

    /// REGISTERED -> PROCESSED -> VERIFIED, and a processed or verified
    /// participant may still cancel by revealing its seeds.
    pub fn can_become(self, next: ParticipantState) -> bool {
        matches!(
            (self, next),
            (ParticipantState::Registered, ParticipantState::Processed)
                | (ParticipantState::Processed, ParticipantState::Verified)
                | (ParticipantState::Processed, ParticipantState::Cancelled)
                | (ParticipantState::Verified, ParticipantState::Cancelled)
        )
    }
}

// ============================================================================
// Rows
// ============================================================================

/// One shuffling as stored at a given height.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shuffling {
    pub id: ShufflingId,
    #[serde(with = "hex::serde")]
    pub full_hash: [u8; 32],
    pub holding: Holding,
    pub issuer_id: AccountId,
    /// Base units moved per participant.
    pub amount: i64,
    pub participant_count: u8,
    /// `None` once the shuffling reached a terminal stage.
    pub blocks_remaining: Option<u16>,
    pub stage: Stage,
    pub assignee: Option<AccountId>,
    pub recipient_public_keys: Vec<PublicKey>,
    pub registrant_count: u8,
    /// Height of the last write. Stamped by the store on commit.
    pub height: Height,
}

impl Shuffling {
    pub fn is_full(&self) -> bool {
        self.registrant_count >= self.participant_count
    }

    pub fn is_active(&self) -> bool {
        !self.stage.is_terminal()
    }
}

/// One registrant of a shuffling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub shuffling_id: ShufflingId,
    pub account_id: AccountId,
    /// Registration order, starting at zero.
    pub index: u8,
    pub next_account_id: Option<AccountId>,
    pub state: ParticipantState,
    /// Published processing output. For the last participant these are the
    /// recipient public keys.
    pub data: Vec<Vec<u8>>,
    pub key_seeds: Vec<KeySeed>,
    pub height: Height,
}

impl Participant {
    pub fn new(shuffling_id: ShufflingId, account_id: AccountId, index: u8) -> Self {
        Self {
            shuffling_id,
            account_id,
            index,
            next_account_id: None,
            state: ParticipantState::Registered,
            data: Vec::new(),
            key_seeds: Vec::new(),
            height: 0,
        }
    }

    pub fn set_state(&mut self, next: ParticipantState) -> Result<()> {
        if !self.state.can_become(next) {
            return Err(ShufflingError::IllegalParticipantState {
                account: self.account_id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// BLAKE3 over the published entries, in order.
    pub fn data_digest(&self) -> [u8; 32] {
        data_digest(&self.data)
    }

    pub fn has_revealed(&self) -> bool {
        self.state == ParticipantState::Cancelled
    }
}

pub fn data_digest(data: &[Vec<u8>]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for entry in data {
        hasher.update(&(entry.len() as u32).to_le_bytes());
        hasher.update(entry);
    }
    hasher.finalize().into()
}

// ============================================================================
// Block context
// ============================================================================

/// What the ledger tells the engine about the block being applied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockContext {
    pub height: Height,
    pub generator: AccountId,
    /// Generators of the preceding blocks, most recent first.
    pub previous_generators: Vec<AccountId>,
    /// Bytes of transaction payload already in this block.
    pub payload_length: usize,
    pub transaction_count: usize,
}

impl BlockContext {
    pub fn new(height: Height, generator: AccountId) -> Self {
        Self {
            height,
            generator,
            ..Default::default()
        }
    }
}

/// Persisted per height so forfeit payouts can be re-derived from the chain.
///
/// Genesis blocks have no generator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub generator: Option<AccountId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_codes_round_trip() {
        for stage in [
            Stage::Registration,
            Stage::Processing,
            Stage::Verification,
            Stage::Blame,
            Stage::Cancelled,
            Stage::Done,
        ] {
            assert_eq!(Stage::from_code(stage.code()).unwrap(), stage);
        }
        assert!(Stage::from_code(6).is_err());
    }

    #[test]
    fn participant_state_graph() {
        use ParticipantState::*;
        assert!(Registered.can_become(Processed));
        assert!(Processed.can_become(Verified));
        assert!(Verified.can_become(Cancelled));
        assert!(!Registered.can_become(Verified));
        assert!(!Registered.can_become(Cancelled));
        assert!(!Cancelled.can_become(Processed));
    }

    #[test]
    fn digest_separates_entries() {
        let a = vec![vec![1u8, 2], vec![3u8]];
        let b = vec![vec![1u8], vec![2u8, 3]];
        assert_ne!(data_digest(&a), data_digest(&b));
    }
}
