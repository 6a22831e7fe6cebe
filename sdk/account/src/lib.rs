//! Account primitives shared by the shuffling engine and its stores.
//!
//! Account ids are 64-bit and derived from the account's X25519 public key,
//! so any node can map a disclosed recipient key to the account it funds.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

mod holding;

pub use holding::{Holding, HoldingType};

/// Raw X25519 public key bytes.
pub type PublicKey = [u8; 32];

/// Base units per whole coin.
pub const ONE_COIN: i64 = 100_000_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("unknown holding type code {0}")]
    UnknownHoldingType(u8),
    #[error("coin holding must use holding id 0, got {0}")]
    CoinHoldingId(u64),
    #[error("balance overflow")]
    Overflow,
}

/// The public "address" of an account.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct AccountId(pub u64);

impl AccountId {
    /// SHA-256 of the public key, first eight bytes read little-endian.
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let digest = Sha256::digest(public_key);
        let mut id = [0u8; 8];
        id.copy_from_slice(&digest[..8]);
        AccountId(u64::from_le_bytes(id))
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0.to_be_bytes())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rejects non-reduced encodings of a Curve25519 u-coordinate.
///
/// A canonical key has the top bit clear and encodes a value below
/// 2^255 - 19. The all-zero key is refused as well since it yields a
/// zero shared secret.
pub fn is_canonical_public_key(bytes: &[u8]) -> bool {
    let Ok(key) = <&PublicKey>::try_from(bytes) else {
        return false;
    };
    if key[31] & 0x80 != 0 {
        return false;
    }
    if key.iter().all(|b| *b == 0) {
        return false;
    }
    // p = 2^255 - 19 = 0x7fff..ffed (little-endian: ed ff .. ff 7f)
    let at_least_p = key[31] == 0x7f && key[1..31].iter().all(|b| *b == 0xff) && key[0] >= 0xed;
    !at_least_p
}

/// Confirmed and spendable (unconfirmed) balance of one holding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub confirmed: i64,
    pub unconfirmed: i64,
}

impl Balance {
    pub fn apply(&mut self, confirmed: i64, unconfirmed: i64) -> Result<(), AccountError> {
        self.confirmed = self
            .confirmed
            .checked_add(confirmed)
            .ok_or(AccountError::Overflow)?;
        self.unconfirmed = self
            .unconfirmed
            .checked_add(unconfirmed)
            .ok_or(AccountError::Overflow)?;
        Ok(())
    }
}

/// Why a balance moved. Recorded with every balance delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerEvent {
    Genesis,
    ShufflingRegistration,
    ShufflingDistribution,
    ShufflingCancellation,
    ShufflingPenalty,
    BlockGenerated,
}
