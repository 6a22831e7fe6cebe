use std::collections::HashSet;
use std::sync::Arc;

use coinshuffle_account::{Balance, Holding};

use crate::shuffler::Shuffler;
use crate::shuffling::attachment::ShufflingAttachment;
use crate::shuffling::effects::ShufflingEvent;
use crate::shuffling::tests::common::*;
use crate::shuffling::types::{ParticipantState, Stage};
use crate::storage::memory::MemStore;
use crate::storage::processor::BlockProcessor;

#[test]
fn three_honest_participants_reach_done() {
    let engine = engine();
    let mut store = MemStore::new();
    let mut chain = BlockProcessor::new(&engine, &mut store, 0);
    let party = Party::new("honest", 3);

    let id = start(&mut chain, &party);
    let agg = aggregate(&chain, id);
    assert_eq!(agg.shuffling.stage, Stage::Processing);
    assert_eq!(agg.shuffling.assignee, Some(party.account(0)));

    process(&engine, &mut chain, &party, id, 0);
    assert_eq!(aggregate(&chain, id).shuffling.assignee, Some(party.account(1)));
    process(&engine, &mut chain, &party, id, 1);
    assert_eq!(aggregate(&chain, id).shuffling.assignee, Some(party.account(2)));

    let last = processing_message(&engine, &chain, &party, id, 2);
    assert!(matches!(last, ShufflingAttachment::Recipients(_)));
    accept(&mut chain, &[tx(&party.members[2], last)]);

    let agg = aggregate(&chain, id);
    assert_eq!(agg.shuffling.stage, Stage::Verification);
    assert_eq!(agg.shuffling.assignee, None);
    let disclosed: HashSet<_> = agg.shuffling.recipient_public_keys.iter().copied().collect();
    let expected: HashSet<_> = (0..3).map(|i| party.recipient_key(i)).collect();
    assert_eq!(disclosed, expected);

    for i in 0..3 {
        verify(&engine, &mut chain, &party, id, i);
    }

    let agg = aggregate(&chain, id);
    assert_eq!(agg.shuffling.stage, Stage::Done);
    assert_eq!(agg.shuffling.blocks_remaining, None);
    assert_eq!(agg.shuffling.recipient_public_keys.len(), 3);
    assert!(agg.participants.all_in(ParticipantState::Verified));

    for i in 0..3 {
        assert_eq!(
            balance(&chain, party.account(i), Holding::Coin),
            Balance {
                confirmed: FUNDS - AMOUNT,
                unconfirmed: FUNDS - AMOUNT,
            }
        );
        assert_eq!(
            balance(&chain, party.recipient(i), Holding::Coin),
            Balance {
                confirmed: AMOUNT,
                unconfirmed: AMOUNT,
            }
        );
        let snapshot = chain.snapshot();
        assert_eq!(
            snapshot.public_key(party.recipient(i)).unwrap(),
            Some(party.recipient_key(i))
        );
    }
}

#[test]
fn processing_starts_exactly_when_the_last_registrant_joins() {
    let engine = engine();
    let mut store = MemStore::new();
    let mut chain = BlockProcessor::new(&engine, &mut store, 0);
    let party = Party::new("registration", 4);
    party.fund(&mut chain);

    let id = create(&mut chain, &party, Holding::Coin, 10);
    let full_hash = aggregate(&chain, id).shuffling.full_hash;
    let agg = aggregate(&chain, id);
    assert_eq!(agg.shuffling.stage, Stage::Registration);
    assert_eq!(agg.shuffling.registrant_count, 1);
    assert_eq!(agg.participants.len(), 1);

    for i in 1..4 {
        let report = accept(
            &mut chain,
            &[tx(&party.members[i], ShufflingAttachment::registration(full_hash))],
        );
        let agg = aggregate(&chain, id);
        assert_eq!(usize::from(agg.shuffling.registrant_count), i + 1);
        let started = report
            .events
            .iter()
            .any(|(_, e)| matches!(e, ShufflingEvent::ProcessingAssigned { .. }));
        if i < 3 {
            assert_eq!(agg.shuffling.stage, Stage::Registration);
            assert!(!started);
        } else {
            assert_eq!(agg.shuffling.stage, Stage::Processing);
            assert_eq!(agg.shuffling.assignee, Some(party.account(0)));
            assert!(started);
        }
    }

    // funds are locked, not spent
    let locked = balance(&chain, party.account(3), Holding::Coin);
    assert_eq!(locked.confirmed, FUNDS);
    assert_eq!(locked.unconfirmed, FUNDS - AMOUNT);
}

#[test]
fn asset_shuffling_moves_amount_and_deposit_to_recipients() {
    let engine = engine();
    let mut store = MemStore::new();
    let mut chain = BlockProcessor::new(&engine, &mut store, 0);
    let party = Party::new("asset", 3);
    let asset = Holding::Asset(7);
    party.fund_with(&mut chain, &[(Holding::Coin, FUNDS), (asset, AMOUNT)]);

    let id = create(&mut chain, &party, asset, 10);
    register_all(&mut chain, &party, id);
    let locked = balance(&chain, party.account(1), Holding::Coin);
    assert_eq!(locked.unconfirmed, FUNDS - deposit());

    process_all(&engine, &mut chain, &party, id);
    for i in 0..3 {
        verify(&engine, &mut chain, &party, id, i);
    }
    assert_eq!(aggregate(&chain, id).shuffling.stage, Stage::Done);

    for i in 0..3 {
        assert_eq!(balance(&chain, party.account(i), asset), Balance::default());
        assert_eq!(
            balance(&chain, party.account(i), Holding::Coin).confirmed,
            FUNDS - deposit()
        );
        assert_eq!(
            balance(&chain, party.recipient(i), asset),
            Balance {
                confirmed: AMOUNT,
                unconfirmed: AMOUNT,
            }
        );
        assert_eq!(
            balance(&chain, party.recipient(i), Holding::Coin).unconfirmed,
            deposit()
        );
    }
}

#[test]
fn shuffler_agents_drive_a_shuffling_to_done() {
    let shuffler = Arc::new(Shuffler::new());
    let mut engine = engine();
    engine.add_observer(shuffler.clone());
    let mut store = MemStore::new();
    let mut chain = BlockProcessor::new(&engine, &mut store, 0);
    let party = Party::new("agents", 5);
    party.fund(&mut chain);

    let creation = shuffler
        .create(
            &party.members[0],
            party.recipient_key(0),
            Holding::Coin,
            AMOUNT,
            5,
            10,
        )
        .unwrap();
    let id = crate::shuffling::types::ShufflingId(creation.id);
    let full_hash = creation.full_hash;
    accept(&mut chain, &[creation]);

    let registrations: Vec<_> = (1..5)
        .map(|i| {
            shuffler
                .register(chain.snapshot(), &party.members[i], party.recipient_key(i), full_hash)
                .unwrap()
        })
        .collect();
    accept(&mut chain, &registrations);
    assert_eq!(shuffler.session_count(), 5);

    for _ in 0..20 {
        let messages = shuffler.next_messages(&engine, chain.snapshot()).unwrap();
        if messages.is_empty() {
            break;
        }
        accept(&mut chain, &messages);
    }

    let agg = aggregate(&chain, id);
    assert_eq!(agg.shuffling.stage, Stage::Done);
    assert_eq!(shuffler.session_count(), 0);
    for i in 0..5 {
        assert_eq!(balance(&chain, party.recipient(i), Holding::Coin).confirmed, AMOUNT);
    }
}
