use coinshuffle_account::Holding;

use crate::shuffling::registry::ShuffleRegistry;
use crate::shuffling::tests::common::*;
use crate::shuffling::types::Stage;
use crate::storage::memory::MemStore;
use crate::storage::processor::BlockProcessor;

#[test]
fn queries_follow_the_shuffling_through_its_stages() {
    let engine = engine();
    let mut store = MemStore::new();
    let mut chain = BlockProcessor::new(&engine, &mut store, 0);
    let party = Party::new("queries", 3);
    let outsider = Party::new("outsider", 3);
    outsider.fund(&mut chain);

    let id = start(&mut chain, &party);
    let other = create(&mut chain, &outsider, Holding::Coin, 50);

    let registry = ShuffleRegistry::new(chain.snapshot());
    assert_eq!(registry.count().unwrap(), 2);
    assert_eq!(registry.active_count().unwrap(), 2);
    assert_eq!(registry.by_stage(Stage::Processing).unwrap().len(), 1);
    assert_eq!(registry.by_stage(Stage::Registration).unwrap()[0].id, other);
    assert_eq!(
        registry
            .by_holding(Holding::Coin, Some(Stage::Processing), false)
            .unwrap()
            .len(),
        1
    );
    assert!(registry.by_holding(Holding::Asset(1), None, true).unwrap().is_empty());
    assert_eq!(registry.assigned_to(party.account(0)).unwrap()[0].id, id);
    assert_eq!(registry.by_participant(party.account(2), false).unwrap()[0].id, id);
    assert!(registry.by_participant(outsider.account(1), true).unwrap().is_empty());
    let full_hash = registry.get(id).unwrap().unwrap().full_hash;
    assert_eq!(registry.get_by_full_hash(&full_hash).unwrap().unwrap().id, id);

    process_all(&engine, &mut chain, &party, id);
    for i in 0..3 {
        verify(&engine, &mut chain, &party, id, i);
    }

    let registry = ShuffleRegistry::new(chain.snapshot());
    assert_eq!(registry.active_count().unwrap(), 1);
    assert!(registry.by_participant(party.account(2), false).unwrap().is_empty());
    assert_eq!(registry.by_participant(party.account(2), true).unwrap().len(), 1);
    assert_eq!(
        registry.by_holding(Holding::Coin, None, true).unwrap().len(),
        2
    );
    assert!(registry.assigned_to(party.account(0)).unwrap().is_empty());
}

#[test]
fn reads_are_answered_as_of_a_height() {
    let engine = engine();
    let mut store = MemStore::new();
    let mut chain = BlockProcessor::new(&engine, &mut store, 0);
    let party = Party::new("asof", 3);
    party.fund(&mut chain);
    let before = chain.height();

    let id = create(&mut chain, &party, Holding::Coin, 10);
    register_all(&mut chain, &party, id);

    let snapshot = chain.snapshot();
    let past = crate::storage::state::Snapshot::new(snapshot.store, before);
    assert!(ShuffleRegistry::new(past).get(id).unwrap().is_none());
    assert_eq!(
        past.balance(party.account(0), Holding::Coin).unwrap().unconfirmed,
        FUNDS
    );

    let created = crate::storage::state::Snapshot::new(snapshot.store, before + 1);
    let agg = ShuffleRegistry::new(created).load(id).unwrap();
    assert_eq!(agg.shuffling.stage, Stage::Registration);
    assert_eq!(agg.participants.len(), 1);

    let now = ShuffleRegistry::new(snapshot).load(id).unwrap();
    assert_eq!(now.shuffling.stage, Stage::Processing);
    assert_eq!(now.participants.len(), 3);
}
