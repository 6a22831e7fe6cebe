use std::sync::atomic::{AtomicU64, Ordering};

use coinshuffle_account::{AccountId, Balance, Holding, ONE_COIN, PublicKey};
use coinshuffle_config::{BlockLimits, ProtocolConfig};
use coinshuffle_keypair::Keypair;

use crate::shuffling::attachment::{ShufflingAttachment, ShufflingTransaction};
use crate::shuffling::engine::ShufflingEngine;
use crate::shuffling::registry::{ShuffleRegistry, ShufflingAggregate};
use crate::shuffling::types::{Height, ShufflingId};
use crate::storage::memory::MemStore;
use crate::storage::processor::{BlockProcessor, BlockReport};
use crate::storage::state::StateStore;

pub const AMOUNT: i64 = 2_000 * ONE_COIN;
pub const FUNDS: i64 = 10_000 * ONE_COIN;

static NONCE: AtomicU64 = AtomicU64::new(1);

pub type Chain<'a> = BlockProcessor<'a, MemStore>;

pub fn engine() -> ShufflingEngine {
    ShufflingEngine::new(ProtocolConfig::default(), BlockLimits::default())
}

pub fn deposit() -> i64 {
    ProtocolConfig::default().deposit
}

/// Generator of the block at `height`.
pub fn generator_at(height: Height) -> AccountId {
    AccountId(900 + height)
}

/// Participants of one shuffling plus the recipient keys they will disclose.
pub struct Party {
    pub members: Vec<Keypair>,
    pub recipients: Vec<Keypair>,
}

impl Party {
    pub fn new(tag: &str, size: usize) -> Self {
        Self {
            members: (0..size)
                .map(|i| Keypair::from_passphrase(&format!("{tag} member {i}")))
                .collect(),
            recipients: (0..size)
                .map(|i| Keypair::from_passphrase(&format!("{tag} recipient {i}")))
                .collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn account(&self, i: usize) -> AccountId {
        self.members[i].account_id()
    }

    pub fn recipient(&self, i: usize) -> AccountId {
        self.recipients[i].account_id()
    }

    pub fn recipient_key(&self, i: usize) -> PublicKey {
        self.recipients[i].public_key()
    }

    /// Publishes every member's key with `FUNDS` coins.
    pub fn fund<S: StateStore + ?Sized>(&self, chain: &mut BlockProcessor<'_, S>) {
        self.fund_with(chain, &[(Holding::Coin, FUNDS)]);
    }

    pub fn fund_with<S: StateStore + ?Sized>(
        &self,
        chain: &mut BlockProcessor<'_, S>,
        holdings: &[(Holding, i64)],
    ) {
        let allocations: Vec<_> = self
            .members
            .iter()
            .flat_map(|m| holdings.iter().map(|(h, a)| (m.public_key(), *h, *a)))
            .collect();
        chain.apply_genesis(&allocations).unwrap();
    }
}

pub fn tx(sender: &Keypair, attachment: ShufflingAttachment) -> ShufflingTransaction {
    let nonce = NONCE.fetch_add(1, Ordering::Relaxed);
    ShufflingTransaction::new(sender.account_id(), nonce, attachment).unwrap()
}

pub fn next_block<S: StateStore + ?Sized>(
    chain: &mut BlockProcessor<'_, S>,
    txs: &[ShufflingTransaction],
) -> BlockReport {
    let generator = generator_at(chain.height() + 1);
    chain.apply_block(generator, txs).unwrap()
}

/// Applies `txs` as one block, asserting all of them were accepted.
pub fn accept<S: StateStore + ?Sized>(
    chain: &mut BlockProcessor<'_, S>,
    txs: &[ShufflingTransaction],
) -> BlockReport {
    let report = next_block(chain, txs);
    for result in &report.results {
        assert!(
            result.success,
            "{:?} from {} rejected: {:?}",
            result.kind, result.sender, result.error
        );
    }
    report
}

/// Applies `tx` alone, asserting it was rejected; returns the reason.
pub fn reject<S: StateStore + ?Sized>(
    chain: &mut BlockProcessor<'_, S>,
    tx: ShufflingTransaction,
) -> String {
    let report = next_block(chain, &[tx]);
    let result = &report.results[0];
    assert!(!result.success, "{:?} unexpectedly accepted", result.kind);
    result.error.clone().unwrap()
}

pub fn idle<S: StateStore + ?Sized>(chain: &mut BlockProcessor<'_, S>, blocks: u64) {
    for _ in 0..blocks {
        next_block(chain, &[]);
    }
}

pub fn aggregate<S: StateStore + ?Sized>(
    chain: &BlockProcessor<'_, S>,
    id: ShufflingId,
) -> ShufflingAggregate {
    ShuffleRegistry::new(chain.snapshot()).load(id).unwrap()
}

pub fn balance<S: StateStore + ?Sized>(
    chain: &BlockProcessor<'_, S>,
    account: AccountId,
    holding: Holding,
) -> Balance {
    chain.balance(account, holding).unwrap()
}

pub fn create<S: StateStore + ?Sized>(
    chain: &mut BlockProcessor<'_, S>,
    party: &Party,
    holding: Holding,
    registration_period: u16,
) -> ShufflingId {
    let creation = tx(
        &party.members[0],
        ShufflingAttachment::creation(holding, AMOUNT, party.size() as u8, registration_period),
    );
    accept(chain, &[creation.clone()]);
    ShufflingId(creation.id)
}

/// Registers members 1.. in one block.
pub fn register_all<S: StateStore + ?Sized>(
    chain: &mut BlockProcessor<'_, S>,
    party: &Party,
    id: ShufflingId,
) {
    let full_hash = aggregate(chain, id).shuffling.full_hash;
    let txs: Vec<_> = party.members[1..]
        .iter()
        .map(|m| tx(m, ShufflingAttachment::registration(full_hash)))
        .collect();
    accept(chain, &txs);
}

/// Funds the party, creates a coin shuffling and fills it.
pub fn start<S: StateStore + ?Sized>(
    chain: &mut BlockProcessor<'_, S>,
    party: &Party,
) -> ShufflingId {
    party.fund(chain);
    let id = create(chain, party, Holding::Coin, 10);
    register_all(chain, party, id);
    id
}

/// Message member `i` would honestly send now.
pub fn processing_message<S: StateStore + ?Sized>(
    engine: &ShufflingEngine,
    chain: &BlockProcessor<'_, S>,
    party: &Party,
    id: ShufflingId,
    i: usize,
) -> ShufflingAttachment {
    engine
        .process(chain.snapshot(), id, &party.members[i], &party.recipient_key(i))
        .unwrap()
}

pub fn process<S: StateStore + ?Sized>(
    engine: &ShufflingEngine,
    chain: &mut BlockProcessor<'_, S>,
    party: &Party,
    id: ShufflingId,
    i: usize,
) {
    let message = processing_message(engine, chain, party, id, i);
    accept(chain, &[tx(&party.members[i], message)]);
}

pub fn process_all<S: StateStore + ?Sized>(
    engine: &ShufflingEngine,
    chain: &mut BlockProcessor<'_, S>,
    party: &Party,
    id: ShufflingId,
) {
    for i in 0..party.size() {
        process(engine, chain, party, id, i);
    }
}

pub fn verify<S: StateStore + ?Sized>(
    engine: &ShufflingEngine,
    chain: &mut BlockProcessor<'_, S>,
    party: &Party,
    id: ShufflingId,
    i: usize,
) {
    let message = engine.verify(chain.snapshot(), id).unwrap();
    accept(chain, &[tx(&party.members[i], message)]);
}

/// Member `i` reveals its seeds, naming `cancelling` as the accuser.
pub fn reveal<S: StateStore + ?Sized>(
    engine: &ShufflingEngine,
    chain: &mut BlockProcessor<'_, S>,
    party: &Party,
    id: ShufflingId,
    i: usize,
    cancelling: AccountId,
) -> BlockReport {
    let state_hash = aggregate(chain, id).state_hash();
    let message = engine
        .reveal_key_seeds(chain.snapshot(), id, &party.members[i], cancelling, &state_hash)
        .unwrap();
    accept(chain, &[tx(&party.members[i], message)])
}
