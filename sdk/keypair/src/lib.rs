use chacha20poly1305::aead::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use coinshuffle_account::{AccountId, PublicKey};

/// An account's private key.
/// NEVER expose this struct's internals.
#[derive(Clone)]
pub struct Keypair {
    secret: StaticSecret,
}

impl Keypair {
    /// Generates a fresh random account key.
    pub fn new_random() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Reconstructs a key from raw secret bytes. X25519 clamping is applied
    /// when the key is used, so any 32 bytes are accepted.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(seed),
        }
    }

    /// Brain-wallet style derivation: SHA-256 of the passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self::from_seed(Sha256::digest(passphrase.as_bytes()).into())
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        X25519PublicKey::from(&self.secret).to_bytes()
    }

    /// Returns the public Account ID (The "Address").
    pub fn account_id(&self) -> AccountId {
        AccountId::from_public_key(&self.public_key())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("account_id", &self.account_id())
            .finish_non_exhaustive()
    }
}
