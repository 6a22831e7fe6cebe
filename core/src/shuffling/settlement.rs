//! Moving balances once a shuffling ends.
//!
//! Registration only locks funds (unconfirmed balance). On success the
//! locked amount leaves every participant's confirmed balance and lands on
//! the recipients. On cancellation the lock is released, except for the
//! blamed participant's deposit which is paid out to block generators.

use std::collections::HashSet;

use log::{info, warn};

use coinshuffle_account::{AccountId, Holding, LedgerEvent, is_canonical_public_key};
use coinshuffle_config::ProtocolConfig;

use crate::shuffling::blame::{blame, start_blame};
use crate::shuffling::effects::{ShufflingEvent, StateDiff};
use crate::shuffling::errors::{Result, ShufflingError};
use crate::shuffling::mixing::collides;
use crate::shuffling::registry::ShufflingAggregate;
use crate::shuffling::types::{BlockContext, ShufflingId, Stage};
use crate::storage::state::{Snapshot, StateStore};

/// Number of preceding generators that share a forfeited deposit.
pub const FORFEIT_RECIPIENTS: usize = 3;

/// Pays out a fully verified shuffling.
///
/// Recipient keys are checked once more; a bad set sends the shuffling to
/// blame with the last participant as assignee instead.
pub(crate) fn distribute<S: StateStore + ?Sized>(
    snapshot: Snapshot<'_, S>,
    aggregate: &mut ShufflingAggregate,
    protocol: &ProtocolConfig,
    diff: &mut StateDiff,
) -> Result<()> {
    let id = aggregate.id();
    if !recipients_are_valid(snapshot, aggregate)? {
        let last = aggregate
            .participants
            .last()
            .map(|p| p.account_id)
            .ok_or(ShufflingError::CorruptParticipants(id))?;
        warn!("shuffling {id}: recipient keys failed re-validation, blaming {last}");
        return start_blame(aggregate, last, protocol, diff);
    }

    let shuffling = &aggregate.shuffling;
    let holding = shuffling.holding;
    let amount = shuffling.amount;
    let deposit = protocol.deposit;
    let event = LedgerEvent::ShufflingDistribution;

    for participant in aggregate.participants.iter() {
        let account = participant.account_id;
        diff.change_balance(account, holding, -amount, 0, event, Some(id));
        if !holding.is_coin() {
            diff.change_balance(account, Holding::Coin, -deposit, 0, event, Some(id));
        }
    }
    for key in &shuffling.recipient_public_keys {
        let recipient = AccountId::from_public_key(key);
        diff.public_keys.push((recipient, *key));
        diff.change_balance(recipient, holding, amount, amount, event, Some(id));
        if !holding.is_coin() {
            diff.change_balance(recipient, Holding::Coin, deposit, deposit, event, Some(id));
        }
    }

    aggregate.shuffling.set_stage(Stage::Done, None, 0)?;
    info!(
        "shuffling {id} done: {} recipients received {amount} of {holding:?}",
        aggregate.shuffling.recipient_public_keys.len()
    );
    diff.emit(id, ShufflingEvent::Done);
    Ok(())
}

fn recipients_are_valid<S: StateStore + ?Sized>(
    snapshot: Snapshot<'_, S>,
    aggregate: &ShufflingAggregate,
) -> Result<bool> {
    let keys = &aggregate.shuffling.recipient_public_keys;
    if keys.len() != usize::from(aggregate.shuffling.participant_count) {
        return Ok(false);
    }
    let mut accounts = HashSet::with_capacity(keys.len());
    for key in keys {
        let account = AccountId::from_public_key(key);
        if !is_canonical_public_key(key)
            || !accounts.insert(account)
            || collides(snapshot, account, key)?
        {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Cancels the shuffling at `block`, forfeiting the blamed participant's
/// deposit.
pub(crate) fn cancel<S: StateStore + ?Sized>(
    snapshot: Snapshot<'_, S>,
    block: &BlockContext,
    aggregate: &mut ShufflingAggregate,
    protocol: &ProtocolConfig,
    diff: &mut StateDiff,
) -> Result<()> {
    let id = aggregate.id();
    let blamed = blame(snapshot, aggregate)?;
    let holding = aggregate.shuffling.holding;
    let amount = aggregate.shuffling.amount;
    let deposit = protocol.deposit;
    let event = LedgerEvent::ShufflingCancellation;

    for participant in aggregate.participants.iter() {
        let account = participant.account_id;
        diff.change_balance(account, holding, 0, amount, event, Some(id));
        if !holding.is_coin() && Some(account) != blamed {
            diff.change_balance(account, Holding::Coin, 0, deposit, event, Some(id));
        }
    }

    if let Some(culprit) = blamed {
        let penalty = LedgerEvent::ShufflingPenalty;
        if holding.is_coin() {
            // the deposit was locked as part of the amount just released
            diff.change_balance(culprit, Holding::Coin, -deposit, -deposit, penalty, Some(id));
        } else {
            diff.change_balance(culprit, Holding::Coin, -deposit, 0, penalty, Some(id));
        }
        pay_forfeit(block, deposit, id, diff);
    }

    aggregate.shuffling.set_stage(Stage::Cancelled, blamed, 0)?;
    match blamed {
        Some(culprit) => info!("shuffling {id} cancelled, blamed {culprit}"),
        None => info!("shuffling {id} cancelled, nobody blamed"),
    }
    diff.emit(id, ShufflingEvent::Cancelled { blamed });
    Ok(())
}

/// A quarter to each of the three preceding generators, the rest to the
/// current one. Shares of genesis blocks, which have no generator, stay
/// with the current generator too.
fn pay_forfeit(
    block: &BlockContext,
    deposit: i64,
    id: ShufflingId,
    diff: &mut StateDiff,
) {
    let share = deposit / 4;
    let event = LedgerEvent::BlockGenerated;
    let mut paid = 0;
    for generator in block.previous_generators.iter().take(FORFEIT_RECIPIENTS) {
        diff.change_balance(*generator, Holding::Coin, share, share, event, Some(id));
        paid += share;
    }
    let rest = deposit - paid;
    diff.change_balance(block.generator, Holding::Coin, rest, rest, event, Some(id));
}
