// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Disk snapshot layer of the UTXO set.

use crate::codec::{self, write_compact_size};
use crate::coins::Coin;
use crate::primitives::{Hash256, OutPoint};
use parking_lot::RwLock;
use rocksdb::{
    ColumnFamilyDescriptor, MultiThreaded, Options, TransactionDB, TransactionDBOptions,
};
use std::collections::HashMap;
use std::path::Path;
use triomphe::Arc;

pub type DB = TransactionDB<MultiThreaded>;

pub const COINS_CF: &str = "coins";
pub const BLOCK_INDEX_CF: &str = "block_index";

/// Sentinel key holding the hash of the block the coin set is consistent with
const BEST_BLOCK_KEY: &[u8] = b"B";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtxoStoreErr {
    Db(String),
    Corruption(&'static str),
}

impl From<rocksdb::Error> for UtxoStoreErr {
    fn from(err: rocksdb::Error) -> Self {
        UtxoStoreErr::Db(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoinWrite {
    Upsert(Coin),
    Erase,
}

/// Persistent key-value snapshot of the confirmed coin set. Writes are
/// batch-atomic together with the best-block pointer.
pub trait UtxoStore: Send + Sync {
    fn get_coin(&self, out: &OutPoint) -> Result<Option<Coin>, UtxoStoreErr>;
    fn best_block(&self) -> Result<Option<Hash256>, UtxoStoreErr>;
    fn batch_write(
        &self,
        changes: Vec<(OutPoint, CoinWrite)>,
        best_block: Hash256,
    ) -> Result<(), UtxoStoreErr>;
}

/// Coin keys: txid bytes followed by the compact-size output index
#[must_use]
pub fn coin_key(out: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(37);
    key.extend_from_slice(&out.txid.0);
    write_compact_size(&mut key, u64::from(out.vout));
    key
}

/// Open (or create) the node database with all column families.
pub fn open_node_db<P: AsRef<Path>>(path: P) -> Result<Arc<DB>, UtxoStoreErr> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);

    let cfs = vec![
        ColumnFamilyDescriptor::new(COINS_CF, Options::default()),
        ColumnFamilyDescriptor::new(BLOCK_INDEX_CF, Options::default()),
    ];

    let db = DB::open_cf_descriptors(&opts, &TransactionDBOptions::default(), path, cfs)?;
    Ok(Arc::new(db))
}

#[derive(Clone)]
pub struct RocksDbUtxoStore {
    db: Arc<DB>,
}

impl RocksDbUtxoStore {
    #[must_use]
    pub fn new(db: Arc<DB>) -> Self {
        Self { db }
    }
}

impl UtxoStore for RocksDbUtxoStore {
    fn get_coin(&self, out: &OutPoint) -> Result<Option<Coin>, UtxoStoreErr> {
        let cf = self
            .db
            .cf_handle(COINS_CF)
            .ok_or(UtxoStoreErr::Corruption("missing coins column family"))?;
        let Some(bytes) = self.db.get_cf(&cf, coin_key(out))? else {
            return Ok(None);
        };
        let coin = codec::deserialize::<Coin>(&bytes)
            .map_err(|_| UtxoStoreErr::Corruption("undecodable coin record"))?;
        Ok(Some(coin))
    }

    fn best_block(&self) -> Result<Option<Hash256>, UtxoStoreErr> {
        let cf = self
            .db
            .cf_handle(COINS_CF)
            .ok_or(UtxoStoreErr::Corruption("missing coins column family"))?;
        let Some(bytes) = self.db.get_cf(&cf, BEST_BLOCK_KEY)? else {
            return Ok(None);
        };
        let hash = codec::deserialize::<Hash256>(&bytes)
            .map_err(|_| UtxoStoreErr::Corruption("undecodable best block record"))?;
        Ok(Some(hash))
    }

    fn batch_write(
        &self,
        changes: Vec<(OutPoint, CoinWrite)>,
        best_block: Hash256,
    ) -> Result<(), UtxoStoreErr> {
        let cf = self
            .db
            .cf_handle(COINS_CF)
            .ok_or(UtxoStoreErr::Corruption("missing coins column family"))?;
        let txn = self.db.transaction();
        for (out, write) in changes {
            match write {
                CoinWrite::Upsert(coin) => {
                    txn.put_cf(&cf, coin_key(&out), codec::serialize(&coin))?;
                }
                CoinWrite::Erase => {
                    txn.delete_cf(&cf, coin_key(&out))?;
                }
            }
        }
        txn.put_cf(&cf, BEST_BLOCK_KEY, codec::serialize(&best_block))?;
        txn.commit()?;
        Ok(())
    }
}

/// Memory-only store for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryUtxoStore {
    inner: RwLock<MemoryUtxoInner>,
}

#[derive(Default)]
struct MemoryUtxoInner {
    coins: HashMap<OutPoint, Coin>,
    best_block: Option<Hash256>,
}

impl MemoryUtxoStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unspent coins currently persisted. Test hook.
    #[must_use]
    pub fn coin_count(&self) -> usize {
        self.inner.read().coins.len()
    }

    /// Deterministic snapshot of the persisted set. Test hook for the
    /// connect-then-disconnect equality property.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(OutPoint, Coin)> {
        let inner = self.inner.read();
        let mut coins: Vec<_> = inner.coins.iter().map(|(k, v)| (*k, v.clone())).collect();
        coins.sort_by_key(|(out, _)| *out);
        coins
    }
}

impl UtxoStore for MemoryUtxoStore {
    fn get_coin(&self, out: &OutPoint) -> Result<Option<Coin>, UtxoStoreErr> {
        Ok(self.inner.read().coins.get(out).cloned())
    }

    fn best_block(&self) -> Result<Option<Hash256>, UtxoStoreErr> {
        Ok(self.inner.read().best_block)
    }

    fn batch_write(
        &self,
        changes: Vec<(OutPoint, CoinWrite)>,
        best_block: Hash256,
    ) -> Result<(), UtxoStoreErr> {
        let mut inner = self.inner.write();
        for (out, write) in changes {
            match write {
                CoinWrite::Upsert(coin) => {
                    inner.coins.insert(out, coin);
                }
                CoinWrite::Erase => {
                    inner.coins.remove(&out);
                }
            }
        }
        inner.best_block = Some(best_block);
        Ok(())
    }
}
