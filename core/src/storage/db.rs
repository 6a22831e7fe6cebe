use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rocksdb::{ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;

use coinshuffle_account::{AccountId, Balance, Holding, PublicKey};

use crate::shuffling::effects::StateDiff;
use crate::shuffling::types::{BlockRecord, Height, Participant, Shuffling, ShufflingId};
use crate::storage::state::{StateStore, fold_balances};

const CF_SHUFFLINGS: &str = "shufflings";
const CF_PARTICIPANTS: &str = "participants";
const CF_BALANCES: &str = "balances";
const CF_PUBLIC_KEYS: &str = "public_keys";
const CF_BLOCKS: &str = "blocks";

const ALL_FAMILIES: [&str; 5] = [
    CF_SHUFFLINGS,
    CF_PARTICIPANTS,
    CF_BALANCES,
    CF_PUBLIC_KEYS,
    CF_BLOCKS,
];

/// RocksDB-backed versioned store.
///
/// Every key ends with the big-endian height of the write, so the newest
/// version at or below a height is one reverse seek away:
///
/// ```text
/// shufflings:    id(8)                  || height(8) -> json Option<Shuffling>
/// participants:  shuffling_id(8) idx(1) || height(8) -> json Option<Participant>
/// balances:      account(8) holding(9)  || height(8) -> json Balance
/// public_keys:   account(8)             || height(8) -> 32 bytes
/// blocks:                                  height(8) -> json BlockRecord
/// ```
#[derive(Clone)]
pub struct RocksDbStore {
    db: Arc<DB>,
}

impl RocksDbStore {
    /// Opens the database at the specified path, creating it if missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = ALL_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, families)
            .map_err(|e| anyhow::anyhow!("Failed to open RocksDB: {}", e))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Newest value under `prefix` written at or below `height`.
    fn latest(&self, family: &str, prefix: &[u8], height: Height) -> Result<Option<Box<[u8]>>> {
        let cf = self
            .db
            .cf_handle(family)
            .with_context(|| format!("{family} CF missing"))?;

        let seek = versioned_key(prefix, height);
        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&seek, Direction::Reverse));

        match iter.next() {
            Some(item) => {
                let (key, value) = item?;
                if key.len() == seek.len() && key.starts_with(prefix) {
                    Ok(Some(value))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    /// Newest version at or below `height` of every row under `prefix`,
    /// keyed by the row part of the key.
    fn scan_latest(
        &self,
        family: &str,
        prefix: &[u8],
        height: Height,
    ) -> Result<BTreeMap<Vec<u8>, Box<[u8]>>> {
        let cf = self
            .db
            .cf_handle(family)
            .with_context(|| format!("{family} CF missing"))?;

        let mut rows = BTreeMap::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            let (row, written_at) = split_versioned_key(&key)?;
            if written_at <= height {
                // keys ascend by height within a row, so the last one wins
                rows.insert(row.to_vec(), value);
            }
        }
        Ok(rows)
    }
}

fn versioned_key(row: &[u8], height: Height) -> Vec<u8> {
    let mut key = Vec::with_capacity(row.len() + 8);
    key.extend_from_slice(row);
    key.extend_from_slice(&height.to_be_bytes());
    key
}

fn split_versioned_key(key: &[u8]) -> Result<(&[u8], Height)> {
    let split = key
        .len()
        .checked_sub(8)
        .context("versioned key shorter than its height suffix")?;
    let (row, height) = key.split_at(split);
    let height: [u8; 8] = height.try_into().context("invalid height suffix")?;
    Ok((row, Height::from_be_bytes(height)))
}

fn shuffling_key(id: ShufflingId) -> [u8; 8] {
    id.0.to_be_bytes()
}

fn participant_key(id: ShufflingId, index: u8) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[..8].copy_from_slice(&id.0.to_be_bytes());
    key[8] = index;
    key
}

fn balance_key(account: AccountId, holding: Holding) -> [u8; 17] {
    let mut key = [0u8; 17];
    key[..8].copy_from_slice(&account.0.to_be_bytes());
    key[8..].copy_from_slice(&holding.key_bytes());
    key
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).context("corrupt row")
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).context("failed to serialize row")
}

impl StateStore for RocksDbStore {
    fn shuffling(&self, id: ShufflingId, height: Height) -> Result<Option<Shuffling>> {
        match self.latest(CF_SHUFFLINGS, &shuffling_key(id), height)? {
            Some(bytes) => decode::<Option<Shuffling>>(&bytes),
            None => Ok(None),
        }
    }

    fn shufflings(&self, height: Height) -> Result<Vec<Shuffling>> {
        let mut out = Vec::new();
        for bytes in self.scan_latest(CF_SHUFFLINGS, &[], height)?.values() {
            if let Some(row) = decode::<Option<Shuffling>>(bytes)? {
                out.push(row);
            }
        }
        Ok(out)
    }

    fn participants(&self, id: ShufflingId, height: Height) -> Result<Vec<Participant>> {
        let mut out = Vec::new();
        for bytes in self
            .scan_latest(CF_PARTICIPANTS, &shuffling_key(id), height)?
            .values()
        {
            if let Some(row) = decode::<Option<Participant>>(bytes)? {
                out.push(row);
            }
        }
        Ok(out)
    }

    fn public_key(&self, account: AccountId, height: Height) -> Result<Option<PublicKey>> {
        match self.latest(CF_PUBLIC_KEYS, &account.0.to_be_bytes(), height)? {
            Some(bytes) => {
                let key: PublicKey = bytes
                    .as_ref()
                    .try_into()
                    .context("invalid public key length")?;
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    fn balance(&self, account: AccountId, holding: Holding, height: Height) -> Result<Balance> {
        match self.latest(CF_BALANCES, &balance_key(account, holding), height)? {
            Some(bytes) => decode(&bytes),
            None => Ok(Balance::default()),
        }
    }

    fn block(&self, height: Height) -> Result<Option<BlockRecord>> {
        let cf = self.db.cf_handle(CF_BLOCKS).context("blocks CF missing")?;
        match self.db.get_cf(cf, height.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn tip(&self) -> Result<Option<Height>> {
        let cf = self.db.cf_handle(CF_BLOCKS).context("blocks CF missing")?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                let (_, height) = split_versioned_key(&key)?;
                Ok(Some(height))
            }
            None => Ok(None),
        }
    }

    fn apply_diff(&mut self, height: Height, diff: &StateDiff) -> Result<()> {
        let balances = fold_balances(&*self, height, diff)?;

        let cf_shufflings = self
            .db
            .cf_handle(CF_SHUFFLINGS)
            .context("shufflings CF missing")?;
        let cf_participants = self
            .db
            .cf_handle(CF_PARTICIPANTS)
            .context("participants CF missing")?;
        let cf_balances = self
            .db
            .cf_handle(CF_BALANCES)
            .context("balances CF missing")?;
        let cf_public_keys = self
            .db
            .cf_handle(CF_PUBLIC_KEYS)
            .context("public_keys CF missing")?;
        let cf_blocks = self.db.cf_handle(CF_BLOCKS).context("blocks CF missing")?;

        let mut batch = WriteBatch::default();

        for ((account, holding), balance) in &balances {
            batch.put_cf(
                cf_balances,
                versioned_key(&balance_key(*account, *holding), height),
                encode(balance)?,
            );
        }

        let mut keyed = HashSet::new();
        for (account, key) in &diff.public_keys {
            if keyed.insert(*account) && self.public_key(*account, height)?.is_none() {
                batch.put_cf(
                    cf_public_keys,
                    versioned_key(&account.0.to_be_bytes(), height),
                    key,
                );
            }
        }

        for shuffling in &diff.shufflings {
            let mut row = shuffling.clone();
            row.height = height;
            batch.put_cf(
                cf_shufflings,
                versioned_key(&shuffling_key(row.id), height),
                encode(&Some(row))?,
            );
        }

        for participant in &diff.participants {
            let mut row = participant.clone();
            row.height = height;
            batch.put_cf(
                cf_participants,
                versioned_key(&participant_key(row.shuffling_id, row.index), height),
                encode(&Some(row))?,
            );
        }

        if let Some(record) = &diff.block {
            batch.put_cf(cf_blocks, height.to_be_bytes(), encode(record)?);
        }

        for id in &diff.deleted_shufflings {
            let mut indexes: HashSet<u8> = self
                .participants(*id, height)?
                .iter()
                .map(|p| p.index)
                .collect();
            indexes.extend(
                diff.participants
                    .iter()
                    .filter(|p| p.shuffling_id == *id)
                    .map(|p| p.index),
            );
            for index in indexes {
                batch.put_cf(
                    cf_participants,
                    versioned_key(&participant_key(*id, index), height),
                    encode(&None::<Participant>)?,
                );
            }
            batch.put_cf(
                cf_shufflings,
                versioned_key(&shuffling_key(*id), height),
                encode(&None::<Shuffling>)?,
            );
        }

        self.db.write(batch).context("failed to commit state diff")?;
        Ok(())
    }

    fn rollback_to(&mut self, height: Height) -> Result<()> {
        let mut batch = WriteBatch::default();
        for family in ALL_FAMILIES {
            let cf = self
                .db
                .cf_handle(family)
                .with_context(|| format!("{family} CF missing"))?;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item?;
                let (_, written_at) = split_versioned_key(&key)?;
                if written_at > height {
                    batch.delete_cf(cf, &key);
                }
            }
        }
        self.db.write(batch).context("failed to roll back")?;
        Ok(())
    }
}
