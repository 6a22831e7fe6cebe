use log::debug;

use coinshuffle_config::{BlockLimits, ProtocolConfig, RetentionPolicy};

use crate::shuffling::effects::{ShufflingEvent, StateDiff};
use crate::shuffling::errors::Result;
use crate::shuffling::registry::ShuffleRegistry;
use crate::shuffling::settlement;
use crate::shuffling::types::{BlockContext, Shuffling, Stage};
use crate::storage::state::{Snapshot, StateStore};

/// The block cannot take any further transaction.
pub fn block_is_full(block: &BlockContext, limits: &BlockLimits) -> bool {
    block.transaction_count >= limits.max_transactions_per_block
        || block.payload_length
            > limits
                .max_payload_length
                .saturating_sub(limits.min_transaction_size)
}

/// The block has no room left for this shuffling's next message, so its
/// countdown is paused for the block.
pub fn shuffling_is_full(shuffling: &Shuffling, block: &BlockContext, limits: &BlockLimits) -> bool {
    let message_size = if shuffling.stage == Stage::Registration {
        limits.min_transaction_size + 1 + 32
    } else {
        limits.non_registration_tx_size
    };
    block.payload_length + message_size > limits.max_payload_length
}

/// Runs after every applied block: counts down active shufflings and
/// cancels those that reach zero.
pub(crate) fn on_block_applied<S: StateStore + ?Sized>(
    snapshot: Snapshot<'_, S>,
    block: &BlockContext,
    protocol: &ProtocolConfig,
    limits: &BlockLimits,
) -> Result<StateDiff> {
    let mut diff = StateDiff::default();
    let registry = ShuffleRegistry::new(snapshot);

    if protocol.retention == RetentionPolicy::DeleteFinished {
        for finished in registry.all()?.iter().filter(|s| !s.is_active()) {
            // keep the terminal row readable at the height that wrote it
            if finished.height < block.height {
                diff.deleted_shufflings.push(finished.id);
                diff.emit(finished.id, ShufflingEvent::Deleted);
            }
        }
    }

    if block_is_full(block, limits) {
        debug!("block {} is full, deadlines paused", block.height);
        return Ok(diff);
    }

    for shuffling in registry.active()? {
        if shuffling_is_full(&shuffling, block, limits) {
            continue;
        }
        let remaining = shuffling.blocks_remaining.unwrap_or(0).saturating_sub(1);
        if remaining > 0 {
            let mut row = shuffling;
            row.blocks_remaining = Some(remaining);
            diff.shufflings.push(row);
            continue;
        }

        debug!(
            "shuffling {} timed out in {:?}",
            shuffling.id, shuffling.stage
        );
        let mut aggregate = registry.load(shuffling.id)?;
        settlement::cancel(snapshot, block, &mut aggregate, protocol, &mut diff)?;
        aggregate.write_to(&mut diff);
    }

    Ok(diff)
}
