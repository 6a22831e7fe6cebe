//! Block Processor
//!
//! Minimal ledger driver around the engine: applies an ordered list of
//! shuffling transactions at the next height, commits each accepted one,
//! then runs the deadline monitor.
//!
//! ```text
//! apply_block(generator, txs)
//!   │
//!   ├─ for tx in txs ──► engine.on_transaction ──► commit @ height
//!   │                         │ rejected
//!   │                         └──► TxResult { success: false }
//!   │
//!   └─ engine.on_block_applied ──► commit @ height (+ BlockRecord)
//! ```
//!
//! The generator of every block is stored with it, so the generators that
//! share a forfeited deposit are read back from the chain rather than kept
//! in memory.

use std::collections::HashSet;

use log::{debug, info};

use coinshuffle_account::{AccountId, Balance, Holding, LedgerEvent, PublicKey};

use crate::shuffling::attachment::{AttachmentKind, ShufflingTransaction};
use crate::shuffling::deadline::block_is_full;
use crate::shuffling::effects::{ShufflingEvent, StateDiff};
use crate::shuffling::engine::ShufflingEngine;
use crate::shuffling::errors::Result;
use crate::shuffling::settlement::FORFEIT_RECIPIENTS;
use crate::shuffling::types::{BlockContext, BlockRecord, Height, ShufflingId};
use crate::storage::state::{Snapshot, StateStore};

// ============================================================================
// Execution Results
// ============================================================================

/// Outcome of one transaction in a block.
#[derive(Debug, Clone)]
pub struct TxResult {
    pub tx_id: u64,
    pub sender: AccountId,
    pub kind: AttachmentKind,
    pub shuffling_id: Option<ShufflingId>,
    pub success: bool,
    /// Rejection reason if the transaction was dropped
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BlockReport {
    pub height: Height,
    pub results: Vec<TxResult>,
    /// Every event committed in this block, in order.
    pub events: Vec<(ShufflingId, ShufflingEvent)>,
}

impl BlockReport {
    pub fn accepted(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn rejected(&self) -> usize {
        self.results.len() - self.accepted()
    }
}

// ============================================================================
// Block Processor
// ============================================================================

pub struct BlockProcessor<'a, S: StateStore + ?Sized> {
    engine: &'a ShufflingEngine,
    store: &'a mut S,
    height: Height,
}

impl<'a, S: StateStore + ?Sized> BlockProcessor<'a, S> {
    /// Starts on top of `height`, the last block already in `store`.
    pub fn new(engine: &'a ShufflingEngine, store: &'a mut S, height: Height) -> Self {
        Self {
            engine,
            store,
            height,
        }
    }

    /// Continues on top of the highest block recorded in `store`.
    pub fn resume(engine: &'a ShufflingEngine, store: &'a mut S) -> Result<Self> {
        let height = store.tip()?.unwrap_or(0);
        Ok(Self::new(engine, store, height))
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn snapshot(&self) -> Snapshot<'_, S> {
        Snapshot::new(&*self.store, self.height)
    }

    pub fn balance(&self, account: AccountId, holding: Holding) -> Result<Balance> {
        self.snapshot().balance(account, holding)
    }

    /// Publishes keys and credits balances in a block of its own.
    pub fn apply_genesis(
        &mut self,
        allocations: &[(PublicKey, Holding, i64)],
    ) -> Result<BlockReport> {
        let mut diff = StateDiff {
            block: Some(BlockRecord::default()),
            ..Default::default()
        };
        for (key, holding, amount) in allocations {
            let account = AccountId::from_public_key(key);
            diff.public_keys.push((account, *key));
            diff.change_balance(account, *holding, *amount, *amount, LedgerEvent::Genesis, None);
        }
        self.height += 1;
        self.engine.commit(&mut *self.store, self.height, &diff)?;
        info!(
            "genesis at height {} funded {} allocations",
            self.height,
            allocations.len()
        );
        Ok(BlockReport {
            height: self.height,
            ..Default::default()
        })
    }

    /// Applies `txs` in order as the next block.
    pub fn apply_block(
        &mut self,
        generator: AccountId,
        txs: &[ShufflingTransaction],
    ) -> Result<BlockReport> {
        let height = self.height + 1;
        let mut block = BlockContext::new(height, generator);
        block.previous_generators =
            Snapshot::new(&*self.store, height).previous_generators(FORFEIT_RECIPIENTS)?;
        let mut report = BlockReport {
            height,
            ..Default::default()
        };
        // one shuffling action per account per block
        let mut acted: HashSet<(ShufflingId, AccountId)> = HashSet::new();

        for tx in txs {
            let mut result = TxResult {
                tx_id: tx.id,
                sender: tx.sender,
                kind: tx.attachment.kind(),
                shuffling_id: tx.attachment.shuffling_id(),
                success: false,
                error: None,
            };

            if block_is_full(&block, self.engine.limits()) {
                result.error = Some("block is full".to_string());
                report.results.push(result);
                continue;
            }
            if let Some(id) = result.shuffling_id {
                if acted.contains(&(id, tx.sender)) {
                    result.error =
                        Some(format!("{} already acted on {id} in this block", tx.sender));
                    report.results.push(result);
                    continue;
                }
            }

            let outcome = {
                let snapshot = Snapshot::new(&*self.store, height);
                self.engine.on_transaction(snapshot, &block, tx)
            };
            match outcome {
                Ok(diff) => {
                    self.engine.commit(&mut *self.store, height, &diff)?;
                    block.payload_length += tx.payload_size()?;
                    block.transaction_count += 1;
                    report.events.extend(diff.events);
                    if let Some(id) = result.shuffling_id {
                        acted.insert((id, tx.sender));
                    }
                    result.success = true;
                }
                Err(err) if err.is_rejection() => {
                    debug!("tx {} from {} rejected: {err}", tx.id, tx.sender);
                    result.error = Some(err.to_string());
                }
                Err(err) => return Err(err),
            }
            report.results.push(result);
        }

        let mut diff = {
            let snapshot = Snapshot::new(&*self.store, height);
            self.engine.on_block_applied(snapshot, &block)?
        };
        diff.block = Some(BlockRecord {
            generator: Some(generator),
        });
        self.engine.commit(&mut *self.store, height, &diff)?;
        report.events.extend(diff.events);

        self.height = height;
        debug!(
            "block {height}: {} accepted, {} rejected",
            report.accepted(),
            report.rejected()
        );
        Ok(report)
    }

    /// Pops blocks above `height`.
    pub fn rollback_to(&mut self, height: Height) -> Result<()> {
        self.store.rollback_to(height)?;
        self.height = height.min(self.height);
        Ok(())
    }
}
