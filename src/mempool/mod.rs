// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! The transaction memory pool.
//!
//! Every entry's inputs resolve either to a confirmed coin or to another
//! pool entry's output, and the spender map guarantees no two entries spend
//! the same outpoint. Fees are stored interest-adjusted at admission height,
//! so the feerate ordering used for eviction and block assembly reflects
//! what a miner would actually collect.

mod admission;

pub use admission::*;

use crate::chain::Rejection;
use crate::consensus::Money;
use crate::primitives::{Hash256, OutPoint, Transaction};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Fee rate in satoshis per 1000 bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct FeeRate(pub Money);

impl FeeRate {
    #[must_use]
    pub fn from_fee(fee: Money, size: u64) -> Self {
        if size == 0 {
            return Self(0);
        }
        Self(fee * 1000 / size as Money)
    }

    #[must_use]
    pub fn fee_for(&self, size: u64) -> Money {
        self.0 * size as Money / 1000
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PackageStats {
    pub count: u64,
    pub size: u64,
    pub fees: Money,
}

#[derive(Clone, Copy, Debug)]
pub struct MempoolLimits {
    pub ancestor_count: u64,
    pub ancestor_size: u64,
    pub descendant_count: u64,
    pub descendant_size: u64,
}

impl Default for MempoolLimits {
    fn default() -> Self {
        Self {
            ancestor_count: 50,
            ancestor_size: 101_000,
            descendant_count: 50,
            descendant_size: 101_000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MempoolEntry {
    pub tx: Arc<Transaction>,
    pub txid: Hash256,
    /// Interest-adjusted fee at admission
    pub fee: Money,
    pub size: u64,
    pub time: i64,
    /// Active tip height when admitted
    pub height: u32,
    /// Including self
    pub ancestors: PackageStats,
    /// Including self
    pub descendants: PackageStats,
}

impl MempoolEntry {
    #[must_use]
    pub fn fee_rate(&self) -> FeeRate {
        FeeRate::from_fee(self.fee, self.size)
    }
}

#[derive(Default)]
pub struct Mempool {
    map: HashMap<Hash256, MempoolEntry>,
    /// (feerate, txid) ascending; eviction starts from the front
    by_feerate: BTreeSet<(FeeRate, Hash256)>,
    by_time: BTreeSet<(i64, Hash256)>,
    /// outpoint -> txid of the pool entry spending it
    spends: HashMap<OutPoint, Hash256>,
    total_size: u64,
    /// Dynamic floor raised by eviction; entries below it are not accepted
    min_fee_rate: FeeRate,
}

impl Mempool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[must_use]
    pub fn contains(&self, txid: &Hash256) -> bool {
        self.map.contains_key(txid)
    }

    #[must_use]
    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.map.get(txid)
    }

    #[must_use]
    pub fn spender_of(&self, out: &OutPoint) -> Option<Hash256> {
        self.spends.get(out).copied()
    }

    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Approximate bytes of heap held by the pool.
    #[must_use]
    pub fn dynamic_usage(&self) -> u64 {
        // Entry bookkeeping roughly triples the raw transaction size
        self.total_size * 3
    }

    #[must_use]
    pub fn min_fee_rate(&self) -> FeeRate {
        self.min_fee_rate
    }

    /// First pool entry conflicting with `tx`, if any.
    #[must_use]
    pub fn first_conflict(&self, tx: &Transaction) -> Option<(OutPoint, Hash256)> {
        for input in &tx.vin {
            if let Some(spender) = self.spends.get(&input.prev_out) {
                return Some((input.prev_out, *spender));
            }
        }
        None
    }

    /// In-pool ancestors of `tx` (transitively), limits enforced. The
    /// returned set excludes `tx` itself.
    pub fn calculate_ancestors(
        &self,
        tx: &Transaction,
        self_size: u64,
        limits: &MempoolLimits,
    ) -> Result<HashSet<Hash256>, Rejection> {
        let mut ancestors: HashSet<Hash256> = HashSet::new();
        let mut queue: VecDeque<Hash256> = tx
            .vin
            .iter()
            .filter_map(|input| {
                self.map
                    .contains_key(&input.prev_out.txid)
                    .then_some(input.prev_out.txid)
            })
            .collect();

        let mut total_size = self_size;
        while let Some(parent) = queue.pop_front() {
            if !ancestors.insert(parent) {
                continue;
            }
            let entry = &self.map[&parent];
            total_size += entry.size;
            if ancestors.len() as u64 + 1 > limits.ancestor_count {
                return Err(Rejection::policy("too many unconfirmed ancestors"));
            }
            if total_size > limits.ancestor_size {
                return Err(Rejection::policy("unconfirmed ancestor package too large"));
            }
            for input in &entry.tx.vin {
                if self.map.contains_key(&input.prev_out.txid) {
                    queue.push_back(input.prev_out.txid);
                }
            }
        }
        Ok(ancestors)
    }

    /// All in-pool descendants of `txid` (transitively), excluding itself.
    #[must_use]
    pub fn calculate_descendants(&self, txid: &Hash256) -> HashSet<Hash256> {
        let mut descendants = HashSet::new();
        let mut queue: VecDeque<Hash256> = VecDeque::from([*txid]);
        while let Some(current) = queue.pop_front() {
            let Some(entry) = self.map.get(&current) else {
                continue;
            };
            for vout in 0..entry.tx.vout.len() as u32 {
                if let Some(spender) = self.spends.get(&OutPoint::new(current, vout)) {
                    if descendants.insert(*spender) {
                        queue.push_back(*spender);
                    }
                }
            }
        }
        descendants
    }

    /// Insert a fully validated transaction. The caller has already done
    /// conflict detection, fee math, and script checks.
    pub fn add(
        &mut self,
        tx: Arc<Transaction>,
        fee: Money,
        time: i64,
        height: u32,
        limits: &MempoolLimits,
    ) -> Result<(), Rejection> {
        let txid = tx.txid();
        if self.map.contains_key(&txid) {
            return Ok(());
        }
        if self.first_conflict(&tx).is_some() {
            return Err(Rejection::policy("conflicts with pool transaction"));
        }

        let size = tx.serialized_size() as u64;
        let ancestors = self.calculate_ancestors(&tx, size, limits)?;

        // Descendant limits of every ancestor must survive the addition
        for ancestor in &ancestors {
            let entry = &self.map[ancestor];
            if entry.descendants.count + 1 > limits.descendant_count {
                return Err(Rejection::policy("too many unconfirmed descendants"));
            }
            if entry.descendants.size + size > limits.descendant_size {
                return Err(Rejection::policy("unconfirmed descendant package too large"));
            }
        }

        let mut ancestor_stats = PackageStats {
            count: 1,
            size,
            fees: fee,
        };
        for ancestor in &ancestors {
            let entry = &self.map[ancestor];
            ancestor_stats.count += 1;
            ancestor_stats.size += entry.size;
            ancestor_stats.fees += entry.fee;
        }

        for ancestor in &ancestors {
            let entry = self.map.get_mut(ancestor).expect("ancestor present");
            entry.descendants.count += 1;
            entry.descendants.size += size;
            entry.descendants.fees += fee;
        }

        for input in &tx.vin {
            self.spends.insert(input.prev_out, txid);
        }
        let entry = MempoolEntry {
            txid,
            fee,
            size,
            time,
            height,
            ancestors: ancestor_stats,
            descendants: PackageStats {
                count: 1,
                size,
                fees: fee,
            },
            tx,
        };
        self.by_feerate.insert((entry.fee_rate(), txid));
        self.by_time.insert((time, txid));
        self.total_size += size;
        self.map.insert(txid, entry);
        Ok(())
    }

    fn remove_single(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.map.remove(txid)?;
        for input in &entry.tx.vin {
            self.spends.remove(&input.prev_out);
        }
        self.by_feerate.remove(&(entry.fee_rate(), entry.txid));
        self.by_time.remove(&(entry.time, entry.txid));
        self.total_size -= entry.size;

        // Ancestors lose this entry from their descendant packages
        let mut to_adjust: Vec<Hash256> = Vec::new();
        for input in &entry.tx.vin {
            if self.map.contains_key(&input.prev_out.txid) {
                to_adjust.push(input.prev_out.txid);
            }
        }
        let mut seen = HashSet::new();
        for ancestor in to_adjust {
            self.adjust_ancestor_chain(&ancestor, &entry, &mut seen);
        }
        Some(entry)
    }

    fn adjust_ancestor_chain(
        &mut self,
        txid: &Hash256,
        removed: &MempoolEntry,
        seen: &mut HashSet<Hash256>,
    ) {
        if !seen.insert(*txid) {
            return;
        }
        let parents: Vec<Hash256> = if let Some(entry) = self.map.get_mut(txid) {
            entry.descendants.count = entry.descendants.count.saturating_sub(1);
            entry.descendants.size = entry.descendants.size.saturating_sub(removed.size);
            entry.descendants.fees -= removed.fee;
            entry
                .tx
                .vin
                .iter()
                .map(|input| input.prev_out.txid)
                .collect()
        } else {
            return;
        };
        for parent in parents {
            if self.map.contains_key(&parent) {
                self.adjust_ancestor_chain(&parent, removed, seen);
            }
        }
    }

    /// Remove `txid` and everything that depends on it. Returns the removed
    /// entries, dependents first.
    pub fn remove_with_descendants(&mut self, txid: &Hash256) -> Vec<MempoolEntry> {
        let mut removed = Vec::new();
        let mut order: Vec<Hash256> = self.calculate_descendants(txid).into_iter().collect();
        order.push(*txid);
        for target in order {
            if let Some(entry) = self.remove_single(&target) {
                removed.push(entry);
            }
        }
        removed
    }

    /// Drop confirmed transactions and everything conflicting with the
    /// block's spends. Called with each connected block.
    pub fn remove_for_block(&mut self, txs: &[Transaction]) -> Vec<MempoolEntry> {
        let mut removed = Vec::new();
        for tx in txs {
            let txid = tx.txid();
            if self.map.contains_key(&txid) {
                if let Some(entry) = self.remove_single(&txid) {
                    removed.push(entry);
                }
                continue;
            }
            // A block spend not in the pool conflicts with any pool entry
            // spending the same coin
            for input in &tx.vin {
                if let Some(spender) = self.spends.get(&input.prev_out).copied() {
                    removed.extend(self.remove_with_descendants(&spender));
                }
            }
        }
        removed
    }

    /// Evict lowest-feerate packages until dynamic usage fits `max_bytes`.
    /// Raises the acceptance floor just above the best evicted feerate.
    pub fn evict_to_size(&mut self, max_bytes: u64) -> Vec<MempoolEntry> {
        let mut evicted = Vec::new();
        while self.dynamic_usage() > max_bytes {
            let Some((rate, txid)) = self.by_feerate.iter().next().copied() else {
                break;
            };
            evicted.extend(self.remove_with_descendants(&txid));
            if rate > self.min_fee_rate {
                self.min_fee_rate = FeeRate(rate.0 + 1);
            }
        }
        evicted
    }

    /// Remove entries older than `cutoff` along with their descendants.
    pub fn expire(&mut self, cutoff: i64) -> Vec<MempoolEntry> {
        let mut expired = Vec::new();
        loop {
            let Some((time, txid)) = self.by_time.iter().next().copied() else {
                break;
            };
            if time >= cutoff {
                break;
            }
            expired.extend(self.remove_with_descendants(&txid));
        }
        expired
    }

    /// Entries ordered best-package-feerate first for block assembly;
    /// ancestors always precede descendants.
    #[must_use]
    pub fn assembly_order(&self) -> Vec<Arc<Transaction>> {
        let mut order: Vec<&MempoolEntry> = self.map.values().collect();
        order.sort_by(|a, b| {
            let rate_a = FeeRate::from_fee(a.ancestors.fees, a.ancestors.size);
            let rate_b = FeeRate::from_fee(b.ancestors.fees, b.ancestors.size);
            rate_b.cmp(&rate_a)
        });

        let mut emitted: HashSet<Hash256> = HashSet::new();
        let mut out = Vec::with_capacity(order.len());
        for entry in order {
            self.emit_with_ancestors(entry.txid, &mut emitted, &mut out);
        }
        out
    }

    fn emit_with_ancestors(
        &self,
        txid: Hash256,
        emitted: &mut HashSet<Hash256>,
        out: &mut Vec<Arc<Transaction>>,
    ) {
        if emitted.contains(&txid) {
            return;
        }
        let Some(entry) = self.map.get(&txid) else {
            return;
        };
        for input in &entry.tx.vin {
            if self.map.contains_key(&input.prev_out.txid) {
                self.emit_with_ancestors(input.prev_out.txid, emitted, out);
            }
        }
        if emitted.insert(txid) {
            out.push(entry.tx.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::COIN;
    use crate::primitives::sha256d;
    use crate::primitives::transaction::test_util::spend_tx;

    fn pool_tx(seed: u8, value: Money) -> Arc<Transaction> {
        Arc::new(spend_tx(OutPoint::new(sha256d(&[seed]), 0), value))
    }

    fn child_of(parent: &Transaction, vout: u32, value: Money) -> Arc<Transaction> {
        Arc::new(spend_tx(OutPoint::new(parent.txid(), vout), value))
    }

    fn add(pool: &mut Mempool, tx: &Arc<Transaction>, fee: Money, time: i64) {
        pool.add(tx.clone(), fee, time, 1, &MempoolLimits::default())
            .unwrap();
    }

    #[test]
    fn add_and_lookup() {
        let mut pool = Mempool::new();
        let tx = pool_tx(1, COIN);
        add(&mut pool, &tx, 1000, 10);

        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&tx.txid()));
        assert_eq!(
            pool.spender_of(&tx.vin[0].prev_out),
            Some(tx.txid())
        );
        let entry = pool.get(&tx.txid()).unwrap();
        assert_eq!(entry.fee, 1000);
        assert_eq!(entry.ancestors.count, 1);
        assert_eq!(entry.descendants.count, 1);
    }

    #[test]
    fn conflicting_spend_rejected() {
        let mut pool = Mempool::new();
        let a = pool_tx(1, COIN);
        add(&mut pool, &a, 1000, 10);

        // Same prevout, different output value = different txid
        let b = Arc::new(spend_tx(a.vin[0].prev_out, 2 * COIN));
        assert_ne!(a.txid(), b.txid());
        let err = pool
            .add(b, 5000, 11, 1, &MempoolLimits::default())
            .unwrap_err();
        assert_eq!(err.detail, "conflicts with pool transaction");
    }

    #[test]
    fn ancestor_and_descendant_stats_track_chains() {
        let mut pool = Mempool::new();
        let parent = pool_tx(1, 10 * COIN);
        let child = child_of(&parent, 0, 9 * COIN);
        let grandchild = child_of(&child, 0, 8 * COIN);

        add(&mut pool, &parent, 100, 10);
        add(&mut pool, &child, 200, 11);
        add(&mut pool, &grandchild, 300, 12);

        let parent_entry = pool.get(&parent.txid()).unwrap();
        assert_eq!(parent_entry.descendants.count, 3);
        assert_eq!(parent_entry.descendants.fees, 600);

        let grandchild_entry = pool.get(&grandchild.txid()).unwrap();
        assert_eq!(grandchild_entry.ancestors.count, 3);
        assert_eq!(grandchild_entry.ancestors.fees, 600);

        assert_eq!(
            pool.calculate_descendants(&parent.txid()).len(),
            2
        );
    }

    #[test]
    fn ancestor_limit_enforced() {
        let limits = MempoolLimits {
            ancestor_count: 3,
            ..Default::default()
        };
        let mut pool = Mempool::new();
        let mut tip = pool_tx(1, 100 * COIN);
        pool.add(tip.clone(), 100, 10, 1, &limits).unwrap();
        for i in 0..2i64 {
            let next = child_of(&tip, 0, (90 - i) * COIN);
            pool.add(next.clone(), 100, 10, 1, &limits).unwrap();
            tip = next;
        }

        let overflow = child_of(&tip, 0, 50 * COIN);
        let err = pool.add(overflow, 100, 10, 1, &limits).unwrap_err();
        assert_eq!(err.detail, "too many unconfirmed ancestors");
    }

    #[test]
    fn descendant_limit_enforced() {
        let limits = MempoolLimits {
            descendant_count: 2,
            ..Default::default()
        };
        let mut pool = Mempool::new();
        let parent = Arc::new({
            let mut tx = spend_tx(OutPoint::new(sha256d(&[9]), 0), 10 * COIN);
            tx.vout.push(tx.vout[0].clone());
            tx.vout.push(tx.vout[0].clone());
            tx
        });
        pool.add(parent.clone(), 100, 10, 1, &limits).unwrap();
        pool.add(child_of(&parent, 0, COIN), 100, 11, 1, &limits)
            .unwrap();

        let err = pool
            .add(child_of(&parent, 1, COIN), 100, 12, 1, &limits)
            .unwrap_err();
        assert_eq!(err.detail, "too many unconfirmed descendants");
    }

    #[test]
    fn remove_with_descendants_cleans_up() {
        let mut pool = Mempool::new();
        let parent = pool_tx(1, 10 * COIN);
        let child = child_of(&parent, 0, 9 * COIN);
        add(&mut pool, &parent, 100, 10);
        add(&mut pool, &child, 200, 11);

        let removed = pool.remove_with_descendants(&parent.txid());
        assert_eq!(removed.len(), 2);
        assert!(pool.is_empty());
        assert_eq!(pool.spender_of(&parent.vin[0].prev_out), None);
        assert_eq!(pool.total_size(), 0);
    }

    #[test]
    fn remove_for_block_purges_confirmed_and_conflicts() {
        let mut pool = Mempool::new();
        let a = pool_tx(1, COIN);
        let b = pool_tx(2, COIN);
        add(&mut pool, &a, 1000, 10);
        add(&mut pool, &b, 1000, 10);

        // The block confirms a, and a conflicting spend of b's input
        let b_conflict = spend_tx(b.vin[0].prev_out, COIN / 2);
        let removed = pool.remove_for_block(&[(*a).clone(), b_conflict]);

        assert_eq!(removed.len(), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn eviction_removes_cheapest_package_and_raises_floor() {
        let mut pool = Mempool::new();
        let cheap = pool_tx(1, COIN);
        let rich = pool_tx(2, COIN);
        add(&mut pool, &cheap, 100, 10);
        add(&mut pool, &rich, 100_000, 10);

        assert_eq!(pool.min_fee_rate(), FeeRate(0));
        let evicted = pool.evict_to_size(pool.dynamic_usage() - 1);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].txid, cheap.txid());
        assert!(pool.contains(&rich.txid()));
        assert!(pool.min_fee_rate() > FeeRate(0));
    }

    #[test]
    fn expiry_walks_oldest_first_with_descendants() {
        let mut pool = Mempool::new();
        let old_parent = pool_tx(1, 10 * COIN);
        let newer_child = child_of(&old_parent, 0, 9 * COIN);
        let fresh = pool_tx(2, COIN);
        add(&mut pool, &old_parent, 100, 10);
        add(&mut pool, &newer_child, 100, 500);
        add(&mut pool, &fresh, 100, 1000);

        let expired = pool.expire(600);
        let expired_ids: HashSet<Hash256> = expired.iter().map(|e| e.txid).collect();
        assert!(expired_ids.contains(&old_parent.txid()));
        // The child came in fresh but rides on an expired parent
        assert!(expired_ids.contains(&newer_child.txid()));
        assert!(pool.contains(&fresh.txid()));
    }

    #[test]
    fn assembly_order_respects_dependencies() {
        let mut pool = Mempool::new();
        let parent = pool_tx(1, 10 * COIN);
        let child = child_of(&parent, 0, 9 * COIN);
        let loner = pool_tx(2, COIN);
        // The child pays a much higher feerate than its parent
        add(&mut pool, &parent, 10, 10);
        add(&mut pool, &child, 100_000, 11);
        add(&mut pool, &loner, 500, 12);

        let order = pool.assembly_order();
        let pos = |txid: Hash256| order.iter().position(|tx| tx.txid() == txid).unwrap();
        assert!(pos(parent.txid()) < pos(child.txid()));
        assert_eq!(order.len(), 3);
    }
}
