use tempfile::TempDir;

use coinshuffle_account::Holding;
use coinshuffle_config::{BlockLimits, ProtocolConfig, RetentionPolicy};

use crate::shuffling::engine::ShufflingEngine;
use crate::shuffling::registry::ShuffleRegistry;
use crate::shuffling::tests::common::*;
use crate::shuffling::types::{ParticipantState, Stage};
use crate::storage::db::RocksDbStore;
use crate::storage::memory::MemStore;
use crate::storage::processor::BlockProcessor;
use crate::storage::state::{Snapshot, StateStore};

/// Create a temporary DB; the directory lives as long as the returned guard.
fn temp_db() -> (TempDir, RocksDbStore) {
    let dir = TempDir::new().unwrap();
    let db = RocksDbStore::open(dir.path()).unwrap();
    (dir, db)
}

#[test]
fn rocksdb_rollback_restores_the_previous_turn() {
    let engine = engine();
    let (_dir, mut db) = temp_db();
    let mut chain = BlockProcessor::new(&engine, &mut db, 0);
    let party = Party::new("rollback", 3);

    party.fund(&mut chain);
    let id = create(&mut chain, &party, Holding::Coin, 10);
    let full_hash = ShuffleRegistry::new(chain.snapshot())
        .get(id)
        .unwrap()
        .unwrap()
        .full_hash;
    let txs: Vec<_> = party.members[1..]
        .iter()
        .map(|m| tx(m, crate::shuffling::attachment::ShufflingAttachment::registration(full_hash)))
        .collect();
    accept(&mut chain, &txs);
    let filled_at = chain.height();

    let message = engine
        .process(chain.snapshot(), id, &party.members[0], &party.recipient_key(0))
        .unwrap();
    accept(&mut chain, &[tx(&party.members[0], message.clone())]);
    let registry = ShuffleRegistry::new(chain.snapshot());
    assert_eq!(
        registry.get(id).unwrap().unwrap().assignee,
        Some(party.account(1))
    );

    chain.rollback_to(filled_at).unwrap();
    assert_eq!(chain.height(), filled_at);
    let agg = ShuffleRegistry::new(chain.snapshot()).load(id).unwrap();
    assert_eq!(agg.shuffling.assignee, Some(party.account(0)));
    assert_eq!(
        agg.participants.get(party.account(0)).unwrap().state,
        ParticipantState::Registered
    );
    assert!(agg.participants.get(party.account(0)).unwrap().data.is_empty());

    // the same message applies again on the restored chain
    accept(&mut chain, &[tx(&party.members[0], message)]);
    assert_eq!(
        ShuffleRegistry::new(chain.snapshot())
            .get(id)
            .unwrap()
            .unwrap()
            .assignee,
        Some(party.account(1))
    );
}

#[test]
fn rocksdb_keeps_history_of_deleted_shufflings() {
    let protocol = ProtocolConfig {
        retention: RetentionPolicy::DeleteFinished,
        ..ProtocolConfig::default()
    };
    let engine = ShufflingEngine::new(protocol, BlockLimits::default());
    let (_dir, mut db) = temp_db();
    let mut chain = BlockProcessor::new(&engine, &mut db, 0);
    let party = Party::new("tombstone", 3);
    party.fund(&mut chain);

    let id = create(&mut chain, &party, Holding::Coin, 1);
    let created_at = chain.height();
    assert_eq!(
        ShuffleRegistry::new(chain.snapshot())
            .get(id)
            .unwrap()
            .unwrap()
            .stage,
        Stage::Cancelled
    );
    idle(&mut chain, 1);

    let snapshot = chain.snapshot();
    assert!(snapshot.shuffling(id).unwrap().is_none());
    assert!(snapshot.shufflings().unwrap().is_empty());
    assert!(snapshot.participants(id).unwrap().is_empty());
    let history = Snapshot::new(snapshot.store, created_at);
    assert_eq!(history.participants(id).unwrap().len(), 1);

    chain.rollback_to(created_at).unwrap();
    assert!(chain.snapshot().shuffling(id).unwrap().is_some());
}

#[test]
fn memory_and_rocksdb_agree() {
    fn run<S: StateStore + ?Sized>(store: &mut S) -> Vec<(Stage, Option<u16>, i64, i64)> {
        let engine = engine();
        let mut chain = BlockProcessor::new(&engine, store, 0);
        let party = Party::new("agree", 3);
        let id = start(&mut chain, &party);
        process(&engine, &mut chain, &party, id, 0);
        idle(&mut chain, 2);

        let agg = ShuffleRegistry::new(chain.snapshot()).load(id).unwrap();
        (0..3)
            .map(|i| {
                let b = chain.balance(party.account(i), Holding::Coin).unwrap();
                (agg.shuffling.stage, agg.shuffling.blocks_remaining, b.confirmed, b.unconfirmed)
            })
            .collect()
    }

    let mut memory = MemStore::new();
    let (_dir, mut db) = temp_db();
    assert_eq!(run(&mut memory), run(&mut db));
}

#[test]
fn rocksdb_records_generators_and_resumes_from_its_tip() {
    let engine = engine();
    let (_dir, mut db) = temp_db();
    assert_eq!(db.tip().unwrap(), None);
    {
        let mut chain = BlockProcessor::new(&engine, &mut db, 0);
        Party::new("tip", 3).fund(&mut chain);
        idle(&mut chain, 2);
    }
    assert_eq!(db.tip().unwrap(), Some(3));
    assert_eq!(db.block(1).unwrap().unwrap().generator, None);
    assert_eq!(db.block(3).unwrap().unwrap().generator, Some(generator_at(3)));

    let mut chain = BlockProcessor::resume(&engine, &mut db).unwrap();
    assert_eq!(chain.height(), 3);
    let above = Snapshot::new(chain.snapshot().store, 4);
    // the genesis block at height 1 has no generator to pay
    assert_eq!(
        above.previous_generators(3).unwrap(),
        vec![generator_at(3), generator_at(2)]
    );

    chain.rollback_to(2).unwrap();
    idle(&mut chain, 1);
    drop(chain);
    assert_eq!(db.tip().unwrap(), Some(3));
    assert_eq!(db.block(3).unwrap().unwrap().generator, Some(generator_at(3)));
}
