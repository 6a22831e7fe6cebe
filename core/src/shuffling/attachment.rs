//! Transaction attachments for the six shuffling message kinds.
//!
//! Wire format: one tag byte followed by the wincode-encoded body.

use sha2::{Digest, Sha256};
use wincode::{SchemaRead, SchemaWrite};

use coinshuffle_account::{AccountId, Holding, HoldingType, PublicKey};
use coinshuffle_privacy::KeySeed;

use crate::shuffling::errors::{Result, ShufflingError};
use crate::shuffling::types::ShufflingId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttachmentKind {
    Creation,
    Registration,
    Processing,
    Recipients,
    Verification,
    Cancellation,
}

impl AttachmentKind {
    pub fn tag(self) -> u8 {
        match self {
            AttachmentKind::Creation => 0,
            AttachmentKind::Registration => 1,
            AttachmentKind::Processing => 2,
            AttachmentKind::Recipients => 3,
            AttachmentKind::Verification => 4,
            AttachmentKind::Cancellation => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(AttachmentKind::Creation),
            1 => Ok(AttachmentKind::Registration),
            2 => Ok(AttachmentKind::Processing),
            3 => Ok(AttachmentKind::Recipients),
            4 => Ok(AttachmentKind::Verification),
            5 => Ok(AttachmentKind::Cancellation),
            other => Err(ShufflingError::Codec(format!("unknown attachment tag {other}"))),
        }
    }
}

// ============================================================================
// Bodies
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, SchemaRead, SchemaWrite)]
pub struct ShufflingCreation {
    pub holding_type: u8,
    pub holding_id: u64,
    pub amount: i64,
    pub participant_count: u8,
    pub registration_period: u16,
}

impl ShufflingCreation {
    pub fn holding(&self) -> Result<Holding> {
        let holding_type = HoldingType::from_code(self.holding_type)?;
        Ok(Holding::from_parts(holding_type, self.holding_id)?)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, SchemaRead, SchemaWrite)]
pub struct ShufflingRegistration {
    pub shuffling_full_hash: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq, SchemaRead, SchemaWrite)]
pub struct ShufflingProcessing {
    pub shuffling_id: u64,
    pub data: Vec<Vec<u8>>,
    pub state_hash: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq, SchemaRead, SchemaWrite)]
pub struct ShufflingRecipients {
    pub shuffling_id: u64,
    pub recipient_public_keys: Vec<PublicKey>,
    pub state_hash: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq, SchemaRead, SchemaWrite)]
pub struct ShufflingVerification {
    pub shuffling_id: u64,
    pub state_hash: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq, SchemaRead, SchemaWrite)]
pub struct ShufflingCancellation {
    pub shuffling_id: u64,
    pub blame_data: Vec<Vec<u8>>,
    pub key_seeds: Vec<KeySeed>,
    pub state_hash: [u8; 32],
    pub cancelling_account_id: u64,
}

impl ShufflingCancellation {
    pub fn cancelling_account(&self) -> AccountId {
        AccountId(self.cancelling_account_id)
    }
}

// ============================================================================
// Attachment
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShufflingAttachment {
    Creation(ShufflingCreation),
    Registration(ShufflingRegistration),
    Processing(ShufflingProcessing),
    Recipients(ShufflingRecipients),
    Verification(ShufflingVerification),
    Cancellation(ShufflingCancellation),
}

impl ShufflingAttachment {
    pub fn creation(
        holding: Holding,
        amount: i64,
        participant_count: u8,
        registration_period: u16,
    ) -> Self {
        ShufflingAttachment::Creation(ShufflingCreation {
            holding_type: holding.holding_type().code(),
            holding_id: holding.id(),
            amount,
            participant_count,
            registration_period,
        })
    }

    pub fn registration(shuffling_full_hash: [u8; 32]) -> Self {
        ShufflingAttachment::Registration(ShufflingRegistration {
            shuffling_full_hash,
        })
    }

    pub fn verification(shuffling_id: ShufflingId, state_hash: [u8; 32]) -> Self {
        ShufflingAttachment::Verification(ShufflingVerification {
            shuffling_id: shuffling_id.0,
            state_hash,
        })
    }

    pub fn kind(&self) -> AttachmentKind {
        match self {
            ShufflingAttachment::Creation(_) => AttachmentKind::Creation,
            ShufflingAttachment::Registration(_) => AttachmentKind::Registration,
            ShufflingAttachment::Processing(_) => AttachmentKind::Processing,
            ShufflingAttachment::Recipients(_) => AttachmentKind::Recipients,
            ShufflingAttachment::Verification(_) => AttachmentKind::Verification,
            ShufflingAttachment::Cancellation(_) => AttachmentKind::Cancellation,
        }
    }

    /// Target shuffling. Creation and registration do not carry an id.
    pub fn shuffling_id(&self) -> Option<ShufflingId> {
        match self {
            ShufflingAttachment::Creation(_) | ShufflingAttachment::Registration(_) => None,
            ShufflingAttachment::Processing(a) => Some(ShufflingId(a.shuffling_id)),
            ShufflingAttachment::Recipients(a) => Some(ShufflingId(a.shuffling_id)),
            ShufflingAttachment::Verification(a) => Some(ShufflingId(a.shuffling_id)),
            ShufflingAttachment::Cancellation(a) => Some(ShufflingId(a.shuffling_id)),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = match self {
            ShufflingAttachment::Creation(a) => wincode::serialize(a),
            ShufflingAttachment::Registration(a) => wincode::serialize(a),
            ShufflingAttachment::Processing(a) => wincode::serialize(a),
            ShufflingAttachment::Recipients(a) => wincode::serialize(a),
            ShufflingAttachment::Verification(a) => wincode::serialize(a),
            ShufflingAttachment::Cancellation(a) => wincode::serialize(a),
        }
        .map_err(codec)?;

        let mut out = Vec::with_capacity(1 + body.len());
        out.push(self.kind().tag());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (tag, body) = bytes
            .split_first()
            .ok_or_else(|| ShufflingError::Codec("empty attachment".into()))?;

        Ok(match AttachmentKind::from_tag(*tag)? {
            AttachmentKind::Creation => {
                ShufflingAttachment::Creation(wincode::deserialize(body).map_err(codec)?)
            }
            AttachmentKind::Registration => {
                ShufflingAttachment::Registration(wincode::deserialize(body).map_err(codec)?)
            }
            AttachmentKind::Processing => {
                ShufflingAttachment::Processing(wincode::deserialize(body).map_err(codec)?)
            }
            AttachmentKind::Recipients => {
                ShufflingAttachment::Recipients(wincode::deserialize(body).map_err(codec)?)
            }
            AttachmentKind::Verification => {
                ShufflingAttachment::Verification(wincode::deserialize(body).map_err(codec)?)
            }
            AttachmentKind::Cancellation => {
                ShufflingAttachment::Cancellation(wincode::deserialize(body).map_err(codec)?)
            }
        })
    }
}

fn codec(err: impl std::fmt::Display) -> ShufflingError {
    ShufflingError::Codec(err.to_string())
}

// ============================================================================
// Transaction envelope
// ============================================================================

/// A shuffling attachment as carried by a ledger transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShufflingTransaction {
    pub id: u64,
    pub full_hash: [u8; 32],
    pub sender: AccountId,
    pub attachment: ShufflingAttachment,
}

impl ShufflingTransaction {
    /// Full hash is SHA-256(sender || nonce || encoded attachment); the id is
    /// its first eight bytes read little-endian.
    pub fn new(sender: AccountId, nonce: u64, attachment: ShufflingAttachment) -> Result<Self> {
        let encoded = attachment.encode()?;
        let mut hasher = Sha256::new();
        hasher.update(sender.to_le_bytes());
        hasher.update(nonce.to_le_bytes());
        hasher.update(&encoded);
        let full_hash: [u8; 32] = hasher.finalize().into();

        let mut id = [0u8; 8];
        id.copy_from_slice(&full_hash[..8]);
        Ok(Self {
            id: u64::from_le_bytes(id),
            full_hash,
            sender,
            attachment,
        })
    }

    pub fn decode(sender: AccountId, nonce: u64, bytes: &[u8]) -> Result<Self> {
        Self::new(sender, nonce, ShufflingAttachment::decode(bytes)?)
    }

    /// Encoded attachment size, used against block payload limits.
    pub fn payload_size(&self) -> Result<usize> {
        Ok(self.attachment.encode()?.len())
    }
}
