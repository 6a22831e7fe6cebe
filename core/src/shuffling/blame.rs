//! Key-seed revelation and blame attribution.
//!
//! Once a shuffling enters BLAME, every participant that published onion
//! data reveals the seeds of the layers it built. Anyone can then replay
//! each participant's chain from public data alone:
//!
//! ```text
//! for i in 0..N-1 with published data:
//!     entry = data_i[ epk == pk(seed_i[0]) ]          missing -> blame i
//!     for k in i+1..N:
//!         bytes = open(entry, seed_i[k-i-1], pk_k)    fails   -> blame i
//!         k last:  canonical, unique, no collision    else    -> blame i
//!                  in recipient keys                  else    -> blame k
//!         k empty: stop this chain
//!         bytes in data_k                             else    -> blame k
//! nobody found -> blame the assignee (the accuser)
//! ```

use std::collections::HashSet;

use log::{debug, info, warn};

use coinshuffle_account::{AccountId, PublicKey, is_canonical_public_key};
use coinshuffle_config::ProtocolConfig;
use coinshuffle_keypair::Keypair;
use coinshuffle_privacy::{AnonymouslyEncryptedData, KeySeed, key_seed, public_key_from_seed};

use crate::shuffling::attachment::{ShufflingAttachment, ShufflingCancellation};
use crate::shuffling::effects::{ShufflingEvent, StateDiff};
use crate::shuffling::errors::{Result, ShufflingError};
use crate::shuffling::mixing::{collides, entry_len};
use crate::shuffling::registry::{ShuffleRegistry, ShufflingAggregate};
use crate::shuffling::types::{
    BlockContext, Participant, ParticipantState, ShufflingId, Stage, data_digest,
};
use crate::shuffling::settlement;
use crate::storage::state::{Snapshot, StateStore};

/// Moves the shuffling to BLAME, waiting on `assignee`'s accusation to be
/// resolved.
pub(crate) fn start_blame(
    aggregate: &mut ShufflingAggregate,
    assignee: AccountId,
    protocol: &ProtocolConfig,
    diff: &mut StateDiff,
) -> Result<()> {
    let deadline = protocol.verification_deadline(aggregate.shuffling.participant_count);
    aggregate
        .shuffling
        .set_stage(Stage::Blame, Some(assignee), deadline)?;
    info!(
        "shuffling {} entered blame, started by {assignee}",
        aggregate.id()
    );
    diff.emit(aggregate.id(), ShufflingEvent::BlameStarted { assignee });
    Ok(())
}

// ============================================================================
// Participant side
// ============================================================================

/// Builds the cancellation message revealing this account's key seeds.
///
/// `state_hash` must be the hash the caller observed; a mismatch means the
/// caller acts on a stale view and is refused outright.
pub fn reveal_key_seeds<S: StateStore + ?Sized>(
    snapshot: Snapshot<'_, S>,
    shuffling_id: ShufflingId,
    keypair: &Keypair,
    cancelling_account: AccountId,
    state_hash: &[u8; 32],
) -> Result<ShufflingAttachment> {
    let aggregate = ShuffleRegistry::new(snapshot).load(shuffling_id)?;
    let expected = aggregate.state_hash();
    if &expected != state_hash {
        return Err(ShufflingError::state_hash_mismatch(&expected, state_hash));
    }
    if !matches!(
        aggregate.shuffling.stage,
        Stage::Processing | Stage::Verification | Stage::Blame
    ) {
        return Err(ShufflingError::rejected(format!(
            "shuffling {shuffling_id} is in {:?}, nothing to reveal",
            aggregate.shuffling.stage
        )));
    }

    let account = keypair.account_id();
    let participants = &aggregate.participants;
    let participant = participants.require(account)?;
    if participants.is_last(account) {
        return Err(ShufflingError::rejected(
            "the last participant has no layers to reveal",
        ));
    }
    if participant.data.is_empty() {
        return Err(ShufflingError::rejected(format!(
            "participant {account} published no data"
        )));
    }

    let secret = keypair.secret_bytes();
    let nonce = shuffling_id.nonce();
    let mut downstream_keys = Vec::new();
    for downstream in participants.iter().skip(usize::from(participant.index) + 1) {
        downstream_keys.push(snapshot.require_public_key(downstream.account_id)?);
    }
    let key_seeds: Vec<KeySeed> = downstream_keys
        .iter()
        .map(|their_public| key_seed(&secret, their_public, &nonce))
        .collect();

    match recover_own_token(participant, &key_seeds, &downstream_keys) {
        Some(token) => debug!(
            "shuffling {shuffling_id}: participant {account} recovered its {}-byte token",
            token.len()
        ),
        None => warn!("shuffling {shuffling_id}: participant {account} cannot find its own token"),
    }

    Ok(ShufflingAttachment::Cancellation(ShufflingCancellation {
        shuffling_id: shuffling_id.0,
        blame_data: participant.data.clone(),
        key_seeds,
        state_hash: expected,
        cancelling_account_id: cancelling_account.0,
    }))
}

/// Peels the entry this participant authored all the way down to the
/// recipient key it wrapped.
fn recover_own_token(
    participant: &Participant,
    key_seeds: &[KeySeed],
    downstream_keys: &[PublicKey],
) -> Option<Vec<u8>> {
    let mut layer = find_own_entry(participant, key_seeds.first()?)?;
    let mut bytes = Vec::new();
    for (position, (seed, their_public)) in key_seeds.iter().zip(downstream_keys).enumerate() {
        bytes = layer.decrypt_with_seed(seed, their_public).ok()?;
        if position + 1 < key_seeds.len() {
            layer = AnonymouslyEncryptedData::from_bytes(&bytes).ok()?;
        }
    }
    Some(bytes)
}

fn find_own_entry(
    participant: &Participant,
    first_seed: &KeySeed,
) -> Option<AnonymouslyEncryptedData> {
    let own_public = public_key_from_seed(first_seed);
    participant
        .data
        .iter()
        .filter_map(|blob| AnonymouslyEncryptedData::from_bytes(blob).ok())
        .find(|layer| layer.public_key() == &own_public)
}

// ============================================================================
// Ledger side
// ============================================================================

pub(crate) fn validate_cancellation(
    aggregate: &ShufflingAggregate,
    sender: AccountId,
    message: &ShufflingCancellation,
) -> Result<()> {
    let shuffling = &aggregate.shuffling;
    if !matches!(
        shuffling.stage,
        Stage::Processing | Stage::Verification | Stage::Blame
    ) {
        return Err(ShufflingError::rejected(format!(
            "shuffling {} is in {:?}, cannot cancel",
            shuffling.id, shuffling.stage
        )));
    }
    let expected = aggregate.state_hash();
    if expected != message.state_hash {
        return Err(ShufflingError::state_hash_mismatch(
            &expected,
            &message.state_hash,
        ));
    }

    let participant = aggregate.participants.require(sender)?;
    if aggregate.is_last(sender) {
        return Err(ShufflingError::rejected(
            "the last participant cannot cancel",
        ));
    }
    if participant.data.is_empty() {
        return Err(ShufflingError::rejected(format!(
            "participant {sender} published no data"
        )));
    }
    if participant.has_revealed() {
        return Err(ShufflingError::rejected(format!(
            "participant {sender} already revealed"
        )));
    }

    let cancelling = message.cancelling_account();
    let expected_canceller = if shuffling.stage == Stage::Blame {
        shuffling.assignee
    } else {
        Some(sender)
    };
    if Some(cancelling) != expected_canceller {
        return Err(ShufflingError::rejected(format!(
            "cancelling account {cancelling} does not match {expected_canceller:?}"
        )));
    }

    if data_digest(&message.blame_data) != participant.data_digest() {
        return Err(ShufflingError::rejected(
            "revealed data differs from published data",
        ));
    }
    let expected_seeds = aggregate.participants.len() - usize::from(participant.index) - 1;
    if message.key_seeds.len() != expected_seeds {
        return Err(ShufflingError::rejected(format!(
            "expected {expected_seeds} key seeds, got {}",
            message.key_seeds.len()
        )));
    }
    Ok(())
}

pub(crate) fn apply_cancellation<S: StateStore + ?Sized>(
    snapshot: Snapshot<'_, S>,
    block: &BlockContext,
    aggregate: &mut ShufflingAggregate,
    sender: AccountId,
    message: &ShufflingCancellation,
    protocol: &ProtocolConfig,
    diff: &mut StateDiff,
) -> Result<()> {
    let id = aggregate.id();
    let participant = aggregate.participants.require_mut(sender)?;
    participant.key_seeds = message.key_seeds.clone();
    participant.set_state(ParticipantState::Cancelled)?;
    diff.emit(id, ShufflingEvent::ParticipantCancelled { account: sender });

    if aggregate.shuffling.stage == Stage::Blame {
        let deadline = protocol.verification_deadline(aggregate.shuffling.participant_count);
        aggregate.shuffling.reset_deadline(deadline);
    } else {
        start_blame(aggregate, sender, protocol, diff)?;
    }

    if all_revealed(aggregate) {
        debug!("shuffling {id}: every participant with data revealed");
        settlement::cancel(snapshot, block, aggregate, protocol, diff)?;
    }
    Ok(())
}

/// Every non-last participant that published data has revealed its seeds.
fn all_revealed(aggregate: &ShufflingAggregate) -> bool {
    let count = aggregate.participants.len();
    aggregate
        .participants
        .iter()
        .take(count.saturating_sub(1))
        .filter(|p| !p.data.is_empty())
        .all(Participant::has_revealed)
}

// ============================================================================
// Blame
// ============================================================================

/// The account at fault, computed from public state only.
pub fn blame<S: StateStore + ?Sized>(
    snapshot: Snapshot<'_, S>,
    aggregate: &ShufflingAggregate,
) -> Result<Option<AccountId>> {
    let shuffling = &aggregate.shuffling;
    match shuffling.stage {
        Stage::Registration | Stage::Done => Ok(None),
        Stage::Processing | Stage::Cancelled => Ok(shuffling.assignee),
        Stage::Verification => Ok(aggregate
            .participants
            .iter()
            .find(|p| p.state != ParticipantState::Verified)
            .map(|p| p.account_id)),
        Stage::Blame => blame_walk(snapshot, aggregate),
    }
}

fn blame_walk<S: StateStore + ?Sized>(
    snapshot: Snapshot<'_, S>,
    aggregate: &ShufflingAggregate,
) -> Result<Option<AccountId>> {
    let participants = &aggregate.participants;
    let recipient_keys = &aggregate.shuffling.recipient_public_keys;
    let count = participants.len();

    let mut public_keys = Vec::with_capacity(count);
    for participant in participants.iter() {
        public_keys.push(snapshot.require_public_key(participant.account_id)?);
    }

    let mut recovered = HashSet::new();
    for (i, participant) in participants.iter().enumerate().take(count.saturating_sub(1)) {
        if participant.data.is_empty() {
            continue;
        }
        let culprit = Some(participant.account_id);
        if participant.key_seeds.len() != count - i - 1 {
            return Ok(culprit);
        }
        let Some(mut layer) = find_own_entry(participant, &participant.key_seeds[0]) else {
            return Ok(culprit);
        };

        for k in (i + 1)..count {
            let Some(next) = participants.at(k) else {
                break;
            };
            let seed = &participant.key_seeds[k - i - 1];
            let Ok(bytes) = layer.decrypt_with_seed(seed, &public_keys[k]) else {
                return Ok(culprit);
            };

            if k + 1 == count {
                let Ok(key) = <PublicKey>::try_from(bytes.as_slice()) else {
                    return Ok(culprit);
                };
                if !is_canonical_public_key(&key) {
                    return Ok(culprit);
                }
                let recipient = AccountId::from_public_key(&key);
                if !recovered.insert(recipient) || collides(snapshot, recipient, &key)? {
                    return Ok(culprit);
                }
                if next.data.is_empty() {
                    break;
                }
                if !recipient_keys.contains(&key) {
                    return Ok(Some(next.account_id));
                }
            } else {
                if bytes.len() != entry_len(count, k) {
                    return Ok(culprit);
                }
                if next.data.is_empty() {
                    break;
                }
                if !next.data.contains(&bytes) {
                    return Ok(Some(next.account_id));
                }
                match AnonymouslyEncryptedData::from_bytes(&bytes) {
                    Ok(peeled) => layer = peeled,
                    Err(_) => return Ok(culprit),
                }
            }
        }
    }

    Ok(aggregate.shuffling.assignee)
}
