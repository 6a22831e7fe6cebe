//! Coinshuffle Privacy SDK
//!
//! Anonymous encryption for onion layers: the sender derives a one-time
//! ephemeral key from a *key seed*, so the layer can later be opened either
//! by the recipient's static secret or, during blame, by anyone holding the
//! revealed seed and the recipient's public key.
//!
//! ```text
//! Flow:
//! 1. seed          = SHA-256(sender_secret || recipient_pk || nonce)
//! 2. (esk, epk)    = X25519 key pair from seed
//! 3. shared secret = ECDH(esk, recipient_pk) = ECDH(recipient_sk, epk)
//! 4. key || iv     = HKDF-SHA256(salt = epk, ikm = shared, "coinshuffle-anon-v1")
//! 5. Output        = epk || ChaCha20-Poly1305(key, iv, plaintext)
//! ```

pub mod anonymous;

pub use anonymous::{
    AnonymouslyEncryptedData, CryptoError, KeySeed, LAYER_OVERHEAD, key_seed, public_key_from_seed,
};
