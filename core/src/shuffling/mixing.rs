//! Onion mixing round and recipient disclosure.
//!
//! ```text
//!  participant 0        participant 1             participant N-1 (last)
//! ┌──────────────┐    ┌──────────────────┐       ┌─────────────────────┐
//! │ wrap own key │──► │ peel one layer   │ ─...─►│ peel last layer     │
//! │ for 1..N-1   │    │ + wrap own key   │       │ + add own key       │
//! └──────────────┘    │ for 2..N-1, sort │       │ = recipient keys    │
//!                     └──────────────────┘       └─────────────────────┘
//! ```
//!
//! Participant `i` publishes `i + 1` entries of `32 + 48 * (N - i - 1)` bytes.
//! A participant that cannot peel its inbound set publishes nothing, which
//! hands the shuffling to the blame phase.

use std::collections::HashSet;

use log::{debug, warn};

use coinshuffle_account::{AccountId, PublicKey, is_canonical_public_key};
use coinshuffle_config::ProtocolConfig;
use coinshuffle_keypair::Keypair;
use coinshuffle_privacy::{AnonymouslyEncryptedData, LAYER_OVERHEAD};

use crate::shuffling::attachment::{
    ShufflingAttachment, ShufflingProcessing, ShufflingRecipients,
};
use crate::shuffling::blame::start_blame;
use crate::shuffling::effects::{ShufflingEvent, StateDiff};
use crate::shuffling::errors::{Result, ShufflingError};
use crate::shuffling::registry::{ShuffleRegistry, ShufflingAggregate};
use crate::shuffling::types::{ParticipantState, ShufflingId, Stage};
use crate::storage::state::{Snapshot, StateStore};

/// Size of every entry published by participant `index` out of `count`.
pub fn entry_len(count: usize, index: usize) -> usize {
    32 + LAYER_OVERHEAD * count.saturating_sub(index + 1)
}

/// Largest processing payload any participant of a `count`-party shuffling
/// publishes.
pub fn max_processing_payload(count: usize) -> usize {
    (0..count)
        .map(|i| (i + 1) * entry_len(count, i))
        .max()
        .unwrap_or(0)
}

// ============================================================================
// Participant side
// ============================================================================

/// Builds this account's processing (or, when last, recipients) message.
///
/// Protocol faults in the inbound data never fail the call: they produce an
/// empty message. Errors are reserved for misuse (wrong stage, not the
/// assignee) and store failures.
pub fn process<S: StateStore + ?Sized>(
    snapshot: Snapshot<'_, S>,
    shuffling_id: ShufflingId,
    keypair: &Keypair,
    recipient_public_key: &PublicKey,
) -> Result<ShufflingAttachment> {
    let aggregate = ShuffleRegistry::new(snapshot).load(shuffling_id)?;
    let account = keypair.account_id();

    if aggregate.shuffling.stage != Stage::Processing {
        return Err(ShufflingError::rejected(format!(
            "shuffling {shuffling_id} is in {:?}, not processing",
            aggregate.shuffling.stage
        )));
    }
    if aggregate.shuffling.assignee != Some(account) {
        return Err(ShufflingError::rejected(format!(
            "account {account} is not the assignee of shuffling {shuffling_id}"
        )));
    }

    let participants = &aggregate.participants;
    let count = participants.len();
    let index = participants
        .position(account)
        .ok_or(ShufflingError::NotParticipant {
            shuffling: shuffling_id,
            account,
        })?;
    let is_last = index + 1 == count;
    let state_hash = aggregate.state_hash();

    let empty = || {
        if is_last {
            ShufflingAttachment::Recipients(ShufflingRecipients {
                shuffling_id: shuffling_id.0,
                recipient_public_keys: Vec::new(),
                state_hash,
            })
        } else {
            ShufflingAttachment::Processing(ShufflingProcessing {
                shuffling_id: shuffling_id.0,
                data: Vec::new(),
                state_hash,
            })
        }
    };

    let inbound = participants
        .previous(account)
        .map(|p| p.data.as_slice())
        .unwrap_or_default();
    if inbound.len() != index {
        debug!(
            "shuffling {shuffling_id}: expected {index} inbound entries, got {}",
            inbound.len()
        );
        return Ok(empty());
    }

    let secret = keypair.secret_bytes();
    let expected_len = entry_len(count, index);
    let mut output = Vec::with_capacity(index + 1);
    for blob in inbound {
        let peeled = AnonymouslyEncryptedData::from_bytes(blob)
            .and_then(|layer| layer.decrypt(&secret));
        match peeled {
            Ok(bytes) if bytes.len() == expected_len => output.push(bytes),
            Ok(bytes) => {
                debug!(
                    "shuffling {shuffling_id}: peeled entry has {} bytes, expected {expected_len}",
                    bytes.len()
                );
                return Ok(empty());
            }
            Err(err) => {
                debug!("shuffling {shuffling_id}: cannot peel inbound entry: {err}");
                return Ok(empty());
            }
        }
    }

    let nonce = shuffling_id.nonce();
    let mut token = recipient_public_key.to_vec();
    for downstream in participants.iter().skip(index + 1).rev() {
        let their_public = snapshot.require_public_key(downstream.account_id)?;
        token = AnonymouslyEncryptedData::encrypt(&token, &secret, &their_public, &nonce)?
            .to_bytes();
    }
    output.push(token);
    output.sort();

    if has_duplicates(&output) {
        warn!("shuffling {shuffling_id}: duplicate entries after peeling");
        return Ok(empty());
    }

    if !is_last {
        return Ok(ShufflingAttachment::Processing(ShufflingProcessing {
            shuffling_id: shuffling_id.0,
            data: output,
            state_hash,
        }));
    }

    let mut recipient_public_keys = Vec::with_capacity(count);
    let mut recipients = HashSet::with_capacity(count);
    for bytes in &output {
        if !is_canonical_public_key(bytes) {
            warn!("shuffling {shuffling_id}: recovered a non-canonical recipient key");
            return Ok(empty());
        }
        let key: PublicKey = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ShufflingError::Codec("recipient key length".into()))?;
        let recipient = AccountId::from_public_key(&key);
        if !recipients.insert(recipient) || collides(snapshot, recipient, &key)? {
            warn!("shuffling {shuffling_id}: recipient account {recipient} collides");
            return Ok(empty());
        }
        recipient_public_keys.push(key);
    }

    Ok(ShufflingAttachment::Recipients(ShufflingRecipients {
        shuffling_id: shuffling_id.0,
        recipient_public_keys,
        state_hash,
    }))
}

fn has_duplicates(sorted: &[Vec<u8>]) -> bool {
    sorted.windows(2).any(|pair| pair[0] == pair[1])
}

/// The account exists under a different key.
pub(crate) fn collides<S: StateStore + ?Sized>(
    snapshot: Snapshot<'_, S>,
    account: AccountId,
    key: &PublicKey,
) -> Result<bool> {
    Ok(snapshot
        .public_key(account)?
        .is_some_and(|existing| &existing != key))
}

// ============================================================================
// Ledger side
// ============================================================================

/// Ascending raw byte order with no repeats.
fn is_strictly_sorted<T: Ord>(items: &[T]) -> bool {
    items.windows(2).all(|pair| pair[0] < pair[1])
}

fn check_turn(
    aggregate: &ShufflingAggregate,
    sender: AccountId,
    state_hash: &[u8; 32],
) -> Result<()> {
    let shuffling = &aggregate.shuffling;
    if shuffling.stage != Stage::Processing {
        return Err(ShufflingError::rejected(format!(
            "shuffling {} is in {:?}, not processing",
            shuffling.id, shuffling.stage
        )));
    }
    if shuffling.assignee != Some(sender) {
        return Err(ShufflingError::rejected(format!(
            "account {sender} is not the assignee of shuffling {}",
            shuffling.id
        )));
    }
    let participant = aggregate.participants.require(sender)?;
    if participant.state != ParticipantState::Registered {
        return Err(ShufflingError::rejected(format!(
            "participant {sender} already processed"
        )));
    }
    let expected = aggregate.state_hash();
    if &expected != state_hash {
        return Err(ShufflingError::state_hash_mismatch(&expected, state_hash));
    }
    Ok(())
}

pub(crate) fn validate_processing(
    aggregate: &ShufflingAggregate,
    sender: AccountId,
    message: &ShufflingProcessing,
) -> Result<()> {
    check_turn(aggregate, sender, &message.state_hash)?;
    if aggregate.is_last(sender) {
        return Err(ShufflingError::rejected(
            "last participant must submit recipients",
        ));
    }
    if message.data.is_empty() {
        return Ok(());
    }

    let count = aggregate.participants.len();
    let index = aggregate
        .participants
        .position(sender)
        .ok_or(ShufflingError::CorruptParticipants(aggregate.id()))?;
    if message.data.len() != index + 1 {
        return Err(ShufflingError::rejected(format!(
            "expected {} entries, got {}",
            index + 1,
            message.data.len()
        )));
    }
    let expected_len = entry_len(count, index);
    if message.data.iter().any(|entry| entry.len() != expected_len) {
        return Err(ShufflingError::rejected(format!(
            "every entry must be {expected_len} bytes"
        )));
    }
    if !is_strictly_sorted(&message.data) {
        return Err(ShufflingError::rejected("duplicate or unsorted entries"));
    }
    Ok(())
}

pub(crate) fn apply_processing(
    aggregate: &mut ShufflingAggregate,
    sender: AccountId,
    message: &ShufflingProcessing,
    protocol: &ProtocolConfig,
    diff: &mut StateDiff,
) -> Result<()> {
    let id = aggregate.id();
    let participant = aggregate.participants.require_mut(sender)?;
    participant.data = message.data.clone();
    participant.set_state(ParticipantState::Processed)?;
    let next = participant.next_account_id;
    diff.emit(id, ShufflingEvent::ParticipantProcessed { account: sender });

    if message.data.is_empty() {
        debug!("shuffling {id}: participant {sender} published nothing");
        return start_blame(aggregate, sender, protocol, diff);
    }

    let next = next.ok_or(ShufflingError::CorruptParticipants(id))?;
    aggregate.shuffling.assignee = Some(next);
    aggregate
        .shuffling
        .reset_deadline(protocol.processing_deadline);
    diff.emit(id, ShufflingEvent::ProcessingAssigned { assignee: next });
    Ok(())
}

pub(crate) fn validate_recipients(
    aggregate: &ShufflingAggregate,
    sender: AccountId,
    message: &ShufflingRecipients,
) -> Result<()> {
    check_turn(aggregate, sender, &message.state_hash)?;
    if !aggregate.is_last(sender) {
        return Err(ShufflingError::rejected(
            "only the last participant submits recipients",
        ));
    }
    let keys = &message.recipient_public_keys;
    if keys.is_empty() {
        return Ok(());
    }
    if keys.len() != aggregate.participants.len() {
        return Err(ShufflingError::rejected(format!(
            "expected {} recipient keys, got {}",
            aggregate.participants.len(),
            keys.len()
        )));
    }
    if keys.iter().any(|key| !is_canonical_public_key(key)) {
        return Err(ShufflingError::rejected("non-canonical recipient key"));
    }
    if !is_strictly_sorted(keys) {
        return Err(ShufflingError::rejected("duplicate or unsorted recipient keys"));
    }
    Ok(())
}

pub(crate) fn apply_recipients(
    aggregate: &mut ShufflingAggregate,
    sender: AccountId,
    message: &ShufflingRecipients,
    protocol: &ProtocolConfig,
    diff: &mut StateDiff,
) -> Result<()> {
    let id = aggregate.id();
    let keys = &message.recipient_public_keys;
    let participant = aggregate.participants.require_mut(sender)?;
    participant.data = keys.iter().map(|key| key.to_vec()).collect();
    participant.set_state(ParticipantState::Processed)?;
    diff.emit(id, ShufflingEvent::ParticipantProcessed { account: sender });

    if keys.is_empty() {
        debug!("shuffling {id}: last participant {sender} disclosed no recipients");
        return start_blame(aggregate, sender, protocol, diff);
    }

    for key in keys {
        diff.public_keys.push((AccountId::from_public_key(key), *key));
    }
    let count = aggregate.shuffling.participant_count;
    aggregate.shuffling.recipient_public_keys = keys.clone();
    aggregate.shuffling.set_stage(
        Stage::Verification,
        None,
        protocol.verification_deadline(count),
    )?;
    diff.emit(id, ShufflingEvent::ProcessingFinished);
    Ok(())
}
