// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! The layered UTXO set.
//!
//! Three views compose bottom-up: the disk snapshot ([`store::UtxoStore`]),
//! the in-memory [`CoinsCache`], and the transactional [`CoinsOverlay`] used
//! while speculatively connecting a block. Mutations roll back by dropping
//! the overlay; they become durable by merging down and eventually flushing.
//!
//! A failed read from the disk snapshot aborts the process: continuing would
//! risk committing state derived from a coin set we cannot trust.

mod store;

pub use store::*;

use crate::codec::{self, read_compact_size, write_compact_size, Decodable, DecodeError, Encodable,
    Reader};
use crate::consensus::{value_with_interest, Money};
use crate::primitives::{Hash256, OutPoint, TxOut};
use log::error;
use parking_lot::RwLock;
use std::collections::{hash_map::Entry, HashMap};
use std::sync::Arc;

/// Entry must be written to the parent on flush
pub const ENTRY_DIRTY: u8 = 0b01;
/// The parent view has never seen this entry; a spent FRESH entry can simply
/// be dropped instead of flushed
pub const ENTRY_FRESH: u8 = 0b10;

/// A single unspent (or, inside a cache layer, freshly spent) output.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Coin {
    pub output: TxOut,
    pub height: u32,
    pub coinbase: bool,
    pub spent: bool,
}

impl Coin {
    #[must_use]
    pub fn new(output: TxOut, height: u32, coinbase: bool) -> Self {
        Self {
            output,
            height,
            coinbase,
            spent: false,
        }
    }

    /// The coin's spendable value at `valuation_height`, interest applied.
    #[must_use]
    pub fn value_at(&self, valuation_height: u32) -> Money {
        value_with_interest(
            self.output.value,
            i64::from(self.height),
            i64::from(valuation_height),
        )
    }

    /// Approximate heap footprint, for the cache memory budget.
    #[must_use]
    pub fn dynamic_usage(&self) -> usize {
        48 + self.output.script_pubkey.len()
    }
}

// Disk layout: varint(height << 1 | coinbase) followed by the output. The
// spent marker is a cache-layer concept and is never persisted.
impl Encodable for Coin {
    fn consensus_encode(&self, w: &mut Vec<u8>) {
        let code = (u64::from(self.height) << 1) | u64::from(self.coinbase);
        write_compact_size(w, code);
        self.output.consensus_encode(w);
    }
}

impl Decodable for Coin {
    fn consensus_decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let code = read_compact_size(r)?;
        let height = u32::try_from(code >> 1)
            .map_err(|_| DecodeError::Malformed("coin height out of range"))?;
        Ok(Self {
            output: TxOut::consensus_decode(r)?,
            height,
            coinbase: code & 1 == 1,
            spent: false,
        })
    }
}

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub coin: Coin,
    pub flags: u8,
}

pub type CoinsMap = HashMap<OutPoint, CacheEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoinsErr {
    /// `add_coin` without `overwrite` hit an existing unspent coin
    OverwriteCoin,
    /// A child layer's FRESH marker contradicts this layer's state
    FreshMisapplied,
}

fn fatal_io(err: &UtxoStoreErr) -> ! {
    error!("fatal UTXO database error: {err:?}");
    std::process::abort();
}

/// In-memory cache over the disk snapshot. Lazily populated; bounded by the
/// caller through [`CoinsCache::cached_bytes`] and [`CoinsCache::flush`].
pub struct CoinsCache {
    store: Arc<dyn UtxoStore>,
    map: CoinsMap,
    best_block: Option<Hash256>,
    cached_bytes: usize,
}

impl CoinsCache {
    /// Reads the best-block pointer eagerly; a store that cannot answer is
    /// fatal.
    #[must_use]
    pub fn new(store: Arc<dyn UtxoStore>) -> Self {
        let best_block = match store.best_block() {
            Ok(best) => best,
            Err(err) => fatal_io(&err),
        };
        Self {
            store,
            map: CoinsMap::default(),
            best_block,
            cached_bytes: 0,
        }
    }

    #[must_use]
    pub fn best_block(&self) -> Option<Hash256> {
        self.best_block
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = Some(hash);
    }

    #[must_use]
    pub fn cached_bytes(&self) -> usize {
        self.cached_bytes
    }

    fn fetch(&mut self, out: &OutPoint) -> Option<&mut CacheEntry> {
        if self.map.contains_key(out) {
            return self.map.get_mut(out);
        }
        let coin = match self.store.get_coin(out) {
            Ok(coin) => coin?,
            Err(err) => fatal_io(&err),
        };
        self.cached_bytes += coin.dynamic_usage();
        let entry = self.map.entry(*out).or_insert(CacheEntry { coin, flags: 0 });
        Some(entry)
    }

    /// Walks layers top-down. Returns `Some` with `spent = true` for a coin
    /// this layer knows to be spent, `None` for a truly unknown outpoint.
    pub fn get_coin(&mut self, out: &OutPoint) -> Option<Coin> {
        self.fetch(out).map(|entry| entry.coin.clone())
    }

    /// True iff the outpoint resolves to an unspent coin.
    pub fn have_coin(&mut self, out: &OutPoint) -> bool {
        self.get_coin(out).map_or(false, |coin| !coin.spent)
    }

    pub fn add_coin(&mut self, out: OutPoint, coin: Coin, overwrite: bool) -> Result<(), CoinsErr> {
        debug_assert!(!coin.spent);
        add_coin_to(&mut self.map, &mut self.cached_bytes, out, coin, overwrite)
    }

    /// Marks the entry spent and returns the previous coin.
    pub fn spend_coin(&mut self, out: &OutPoint) -> Option<Coin> {
        self.fetch(out)?;
        spend_coin_in(&mut self.map, &mut self.cached_bytes, out)
    }

    /// Merge a child layer's changes into this one with the flag arithmetic
    /// described in the module docs.
    pub fn batch_write(&mut self, child: CoinsMap, best_block: Hash256) -> Result<(), CoinsErr> {
        for (out, child_entry) in child {
            if child_entry.flags & ENTRY_DIRTY == 0 {
                continue;
            }
            match self.map.entry(out) {
                Entry::Vacant(slot) => {
                    // A FRESH child spend never existed as far as this layer
                    // is concerned; drop it entirely.
                    if !(child_entry.flags & ENTRY_FRESH != 0 && child_entry.coin.spent) {
                        self.cached_bytes += child_entry.coin.dynamic_usage();
                        slot.insert(CacheEntry {
                            coin: child_entry.coin,
                            flags: ENTRY_DIRTY | (child_entry.flags & ENTRY_FRESH),
                        });
                    }
                }
                Entry::Occupied(mut slot) => {
                    if child_entry.flags & ENTRY_FRESH != 0 && !slot.get().coin.spent {
                        return Err(CoinsErr::FreshMisapplied);
                    }
                    if slot.get().flags & ENTRY_FRESH != 0 && child_entry.coin.spent {
                        self.cached_bytes = self
                            .cached_bytes
                            .saturating_sub(slot.get().coin.dynamic_usage());
                        slot.remove();
                    } else {
                        let keep_fresh = slot.get().flags & ENTRY_FRESH;
                        self.cached_bytes = self
                            .cached_bytes
                            .saturating_sub(slot.get().coin.dynamic_usage());
                        self.cached_bytes += child_entry.coin.dynamic_usage();
                        slot.insert(CacheEntry {
                            coin: child_entry.coin,
                            flags: ENTRY_DIRTY | keep_fresh,
                        });
                    }
                }
            }
        }
        self.best_block = Some(best_block);
        Ok(())
    }

    /// Push every dirty entry down to the disk snapshot and drop the cache.
    pub fn flush(&mut self) -> Result<(), UtxoStoreErr> {
        let Some(best_block) = self.best_block else {
            // Nothing was ever connected; nothing to persist.
            self.map.clear();
            self.cached_bytes = 0;
            return Ok(());
        };

        let mut changes = Vec::with_capacity(self.map.len());
        for (out, entry) in self.map.drain() {
            if entry.flags & ENTRY_DIRTY == 0 {
                continue;
            }
            if entry.coin.spent {
                if entry.flags & ENTRY_FRESH == 0 {
                    changes.push((out, CoinWrite::Erase));
                }
            } else {
                changes.push((out, CoinWrite::Upsert(entry.coin)));
            }
        }
        self.cached_bytes = 0;
        self.store.batch_write(changes, best_block)
    }
}

fn add_coin_to(
    map: &mut CoinsMap,
    cached_bytes: &mut usize,
    out: OutPoint,
    coin: Coin,
    overwrite: bool,
) -> Result<(), CoinsErr> {
    let mut fresh = false;
    match map.entry(out) {
        Entry::Occupied(mut slot) => {
            if !overwrite {
                if !slot.get().coin.spent {
                    return Err(CoinsErr::OverwriteCoin);
                }
                // Re-adding over a spent entry whose spentness has not been
                // flushed: the parent still holds the old coin, so the entry
                // cannot become FRESH.
                fresh = slot.get().flags & ENTRY_DIRTY == 0;
            }
            *cached_bytes = cached_bytes.saturating_sub(slot.get().coin.dynamic_usage());
            *cached_bytes += coin.dynamic_usage();
            let flags = slot.get().flags | ENTRY_DIRTY | if fresh { ENTRY_FRESH } else { 0 };
            slot.insert(CacheEntry { coin, flags });
        }
        Entry::Vacant(slot) => {
            if !overwrite {
                fresh = true;
            }
            *cached_bytes += coin.dynamic_usage();
            slot.insert(CacheEntry {
                coin,
                flags: ENTRY_DIRTY | if fresh { ENTRY_FRESH } else { 0 },
            });
        }
    }
    Ok(())
}

fn spend_coin_in(map: &mut CoinsMap, cached_bytes: &mut usize, out: &OutPoint) -> Option<Coin> {
    let entry = map.get_mut(out)?;
    if entry.coin.spent {
        return None;
    }
    let previous = entry.coin.clone();
    if entry.flags & ENTRY_FRESH != 0 {
        *cached_bytes = cached_bytes.saturating_sub(entry.coin.dynamic_usage());
        map.remove(out);
    } else {
        entry.flags |= ENTRY_DIRTY;
        entry.coin.spent = true;
    }
    Some(previous)
}

/// Speculative layer over the shared cache. Used by connect-block and every
/// parallel validation worker; dropped to roll back, merged down to commit.
pub struct CoinsOverlay<'a> {
    parent: &'a RwLock<CoinsCache>,
    map: CoinsMap,
    best_block: Option<Hash256>,
    cached_bytes: usize,
}

impl<'a> CoinsOverlay<'a> {
    #[must_use]
    pub fn new(parent: &'a RwLock<CoinsCache>) -> Self {
        let best_block = parent.read().best_block();
        Self {
            parent,
            map: CoinsMap::default(),
            best_block,
            cached_bytes: 0,
        }
    }

    #[must_use]
    pub fn best_block(&self) -> Option<Hash256> {
        self.best_block
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = Some(hash);
    }

    fn fetch(&mut self, out: &OutPoint) -> Option<&mut CacheEntry> {
        if self.map.contains_key(out) {
            return self.map.get_mut(out);
        }
        let coin = self.parent.write().get_coin(out)?;
        self.cached_bytes += coin.dynamic_usage();
        Some(self.map.entry(*out).or_insert(CacheEntry { coin, flags: 0 }))
    }

    pub fn get_coin(&mut self, out: &OutPoint) -> Option<Coin> {
        self.fetch(out).map(|entry| entry.coin.clone())
    }

    pub fn have_coin(&mut self, out: &OutPoint) -> bool {
        self.get_coin(out).map_or(false, |coin| !coin.spent)
    }

    pub fn add_coin(&mut self, out: OutPoint, coin: Coin, overwrite: bool) -> Result<(), CoinsErr> {
        add_coin_to(&mut self.map, &mut self.cached_bytes, out, coin, overwrite)
    }

    pub fn spend_coin(&mut self, out: &OutPoint) -> Option<Coin> {
        self.fetch(out)?;
        spend_coin_in(&mut self.map, &mut self.cached_bytes, out)
    }

    /// Merge into the shared cache. Consumes the overlay; the write lock is
    /// held only for the merge itself.
    pub fn commit(self) -> Result<(), CoinsErr> {
        let best_block = self
            .best_block
            .expect("overlay committed without a best block");
        self.parent.write().batch_write(self.map, best_block)
    }

    /// Roll back by dropping all accumulated mutations.
    pub fn discard(self) {}
}

/// Spent-coin record for one transaction, in input order.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct TxUndo {
    pub spent: Vec<Coin>,
}

/// Everything needed to disconnect a block: the coins its non-coinbase
/// inputs consumed, per transaction, in block order.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct BlockUndo {
    pub tx_undos: Vec<TxUndo>,
}

impl Encodable for TxUndo {
    fn consensus_encode(&self, w: &mut Vec<u8>) {
        codec::write_seq(w, &self.spent);
    }
}

impl Decodable for TxUndo {
    fn consensus_decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            spent: codec::read_seq(r)?,
        })
    }
}

impl Encodable for BlockUndo {
    fn consensus_encode(&self, w: &mut Vec<u8>) {
        codec::write_seq(w, &self.tx_undos);
    }
}

impl Decodable for BlockUndo {
    fn consensus_decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            tx_undos: codec::read_seq(r)?,
        })
    }
}
