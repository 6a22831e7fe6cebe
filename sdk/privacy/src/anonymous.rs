use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

/// Secret from which one layer's ephemeral key pair is derived.
pub type KeySeed = [u8; 32];

/// Bytes each layer adds: ephemeral public key plus the Poly1305 tag.
pub const LAYER_OVERHEAD: usize = 32 + 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encrypted data too short: {0} bytes")]
    Truncated(usize),
    #[error("key seed does not match the layer's ephemeral key")]
    SeedMismatch,
    #[error("shared secret is not contributory (low-order public key)")]
    NonContributory,
    #[error("encryption failure")]
    EncryptionFailed,
    #[error("decryption failure (bad key or mac)")]
    DecryptionFailed,
}

/// SHA-256(secret || their_public || nonce).
pub fn key_seed(secret: &[u8; 32], their_public: &[u8; 32], nonce: &[u8]) -> KeySeed {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(their_public);
    hasher.update(nonce);
    hasher.finalize().into()
}

pub fn public_key_from_seed(seed: &KeySeed) -> [u8; 32] {
    PublicKey::from(&StaticSecret::from(*seed)).to_bytes()
}

/// One onion layer as published on the ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnonymouslyEncryptedData {
    public_key: [u8; 32],
    ciphertext: Vec<u8>,
}

impl AnonymouslyEncryptedData {
    /// Encrypts `plaintext` for `their_public`. Deterministic in
    /// (secret, their_public, nonce, plaintext).
    pub fn encrypt(
        plaintext: &[u8],
        secret: &[u8; 32],
        their_public: &[u8; 32],
        nonce: &[u8],
    ) -> Result<Self, CryptoError> {
        let seed = key_seed(secret, their_public, nonce);
        let ephemeral = StaticSecret::from(seed);
        let public_key = PublicKey::from(&ephemeral).to_bytes();

        let shared = ephemeral.diffie_hellman(&PublicKey::from(*their_public));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }

        let (cipher, iv) = layer_cipher(shared.as_bytes(), &public_key);
        let ciphertext = cipher
            .encrypt(&iv, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok(Self {
            public_key,
            ciphertext,
        })
    }

    /// Opens the layer with the recipient's static secret.
    pub fn decrypt(&self, recipient_secret: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
        let secret = StaticSecret::from(*recipient_secret);
        let shared = secret.diffie_hellman(&PublicKey::from(self.public_key));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        self.open(shared.as_bytes())
    }

    /// Opens the layer with a revealed seed and the recipient's public key.
    pub fn decrypt_with_seed(
        &self,
        seed: &KeySeed,
        their_public: &[u8; 32],
    ) -> Result<Vec<u8>, CryptoError> {
        let ephemeral = StaticSecret::from(*seed);
        if PublicKey::from(&ephemeral).to_bytes() != self.public_key {
            return Err(CryptoError::SeedMismatch);
        }
        let shared = ephemeral.diffie_hellman(&PublicKey::from(*their_public));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        self.open(shared.as_bytes())
    }

    fn open(&self, shared: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
        let (cipher, iv) = layer_cipher(shared, &self.public_key);
        cipher
            .decrypt(&iv, self.ciphertext.as_slice())
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Ephemeral public key of this layer.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < LAYER_OVERHEAD {
            return Err(CryptoError::Truncated(bytes.len()));
        }
        let (public_key, ciphertext) = bytes.split_at(32);
        let mut key = [0u8; 32];
        key.copy_from_slice(public_key);
        Ok(Self {
            public_key: key,
            ciphertext: ciphertext.to_vec(),
        })
    }

    /// Output = epk || ciphertext || tag
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.ciphertext.len());
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.ciphertext);
        out
    }
}

/// The key is unique per ephemeral key pair, so a derived IV never repeats.
fn layer_cipher(shared: &[u8; 32], ephemeral_public: &[u8; 32]) -> (ChaCha20Poly1305, Nonce) {
    let hk = Hkdf::<Sha256>::new(Some(ephemeral_public.as_slice()), shared);
    let mut okm = [0u8; 44]; // 32 bytes Key + 12 bytes IV
    hk.expand(b"coinshuffle-anon-v1", &mut okm)
        .expect("HKDF expand failed");
    let key = Key::from_slice(&okm[0..32]);
    let iv = *Nonce::from_slice(&okm[32..44]);
    (ChaCha20Poly1305::new(key), iv)
}
