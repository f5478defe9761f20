// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! The node façade.
//!
//! A [`Node`] owns every consensus singleton: chain state, mempool, orphan
//! pool, event bus, admission pipeline, and the parallel validation
//! orchestrator. RPC, network, and wallet layers hold a `Node` handle and
//! talk to the core exclusively through it.

mod events;
mod parallel;

pub use events::*;
pub use parallel::*;

use crate::chain::{
    BlockIndex, BlockIndexEntry, BlockStore, ChainState, Rejection, ReorgOutcome, WallClock,
};
use crate::codec;
use crate::coins::{Coin, CoinsCache, UtxoStore, BLOCK_INDEX_CF, DB};
use crate::consensus::{block_subsidy, Money, Params};
use crate::mempool::{
    AdmissionPool, AdmissionResult, Mempool, MempoolLimits, OrphanPool, TxAdmission, TxSource,
};
use crate::primitives::{Block, BlockLocator, Hash256, OutPoint, Transaction};
use crate::sync::{OrderedMutex, RANK_CHAIN, RANK_MEMPOOL, RANK_ORPHANS};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative shutdown flag shared by every worker.
#[derive(Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.0.clone()
    }
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub params: Params,
    pub tx_admission_threads: usize,
    /// Parallel validation slots: positive = exact, 0 = one per core,
    /// negative = leave that many cores free
    pub parallel_blocks: i32,
    /// Artificially slow script batches to exercise validation races
    pub pvtest: bool,
    pub min_relay_fee_per_kb: Money,
    pub max_mempool_bytes: u64,
    pub mempool_expiry_secs: i64,
    pub orphan_expiry_secs: i64,
    pub max_orphans: usize,
    pub coin_cache_max_bytes: usize,
    pub mempool_limits: MempoolLimits,
}

impl NodeConfig {
    #[must_use]
    pub fn new(params: Params) -> Self {
        Self {
            params,
            tx_admission_threads: (num_cpus::get() / 2).max(1),
            parallel_blocks: 0,
            pvtest: false,
            min_relay_fee_per_kb: 1000,
            max_mempool_bytes: 300 * 1024 * 1024,
            mempool_expiry_secs: 72 * 3600,
            orphan_expiry_secs: 72 * 3600,
            max_orphans: 10_000,
            coin_cache_max_bytes: crate::chain::DEFAULT_COIN_CACHE_MAX_BYTES,
            mempool_limits: MempoolLimits::default(),
        }
    }
}

/// Result of a successful block submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAccepted {
    /// The submitted block became (part of) the active chain
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub prev_hash: Hash256,
    pub height: u32,
    pub bits: u32,
    pub time: u32,
    /// Canonically ordered, coinbase excluded
    pub txs: Vec<Arc<Transaction>>,
    pub subsidy: Money,
    pub fees: Money,
    /// Maximum the coinbase may claim: subsidy plus fees
    pub coinbase_value: Money,
}

pub struct Node {
    pub config: NodeConfig,
    pub chain: Arc<OrderedMutex<ChainState>>,
    pub mempool: Arc<OrderedMutex<Mempool>>,
    pub orphans: Arc<OrderedMutex<OrphanPool>>,
    pub events: Arc<EventBus>,
    pub admission: Arc<TxAdmission>,
    pub validator: ParallelValidator,
    pub shutdown: ShutdownSignal,
    clock: Arc<dyn WallClock>,
    admission_pool: Mutex<Option<AdmissionPool>>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        clock: Arc<dyn WallClock>,
        utxo_store: Arc<dyn UtxoStore>,
        block_store: Arc<dyn BlockStore>,
        index: BlockIndex,
        shutdown: ShutdownSignal,
    ) -> Result<Self, Rejection> {
        let utxo = Arc::new(RwLock::new(CoinsCache::new(utxo_store)));
        let index = Arc::new(RwLock::new(index));
        let mut state = ChainState::bootstrap(
            config.params.clone(),
            clock.clone(),
            index,
            utxo.clone(),
            block_store,
        )?;
        state.set_coin_cache_max_bytes(config.coin_cache_max_bytes);

        let chain = Arc::new(OrderedMutex::new(RANK_CHAIN, "chain", state));
        let mempool = Arc::new(OrderedMutex::new(RANK_MEMPOOL, "mempool", Mempool::new()));
        let orphans = Arc::new(OrderedMutex::new(
            RANK_ORPHANS,
            "orphans",
            OrphanPool::new(config.max_orphans),
        ));
        let events = Arc::new(EventBus::new());

        let admission = Arc::new(TxAdmission {
            params: config.params.clone(),
            chain: chain.clone(),
            utxo,
            mempool: mempool.clone(),
            orphans: orphans.clone(),
            events: events.clone(),
            clock: clock.clone(),
            limits: config.mempool_limits,
            min_relay_fee_per_kb: config.min_relay_fee_per_kb,
            max_mempool_bytes: config.max_mempool_bytes,
        });

        let pvtest_delay = config.pvtest.then(|| Duration::from_millis(50));
        let validator = ParallelValidator::new(config.parallel_blocks, pvtest_delay);

        Ok(Self {
            config,
            chain,
            mempool,
            orphans,
            events,
            admission,
            validator,
            shutdown,
            clock,
            admission_pool: Mutex::new(None),
        })
    }

    /// Spin up the admission worker threads.
    pub fn start_admission_workers(&self) {
        let mut pool = self.admission_pool.lock();
        if pool.is_none() {
            *pool = Some(AdmissionPool::start(
                self.admission.clone(),
                self.config.tx_admission_threads,
            ));
        }
    }

    /// Decode and validate a block, advancing the chain if it wins.
    pub fn submit_block(&self, bytes: &[u8]) -> Result<BlockAccepted, Rejection> {
        let block: Block = codec::deserialize(bytes)
            .map_err(|_| Rejection::decode("malformed block"))?;
        self.submit_block_obj(&block)
    }

    pub fn submit_block_obj(&self, block: &Block) -> Result<BlockAccepted, Rejection> {
        let outcome = {
            let mut chain = self.chain.lock();
            chain.submit_block(block)?
        };
        self.apply_chain_outcome(&outcome);

        let active = {
            let chain = self.chain.lock();
            let index = chain.index.read();
            let tip_hash = index.entry(chain.tip_id()).hash;
            let submitted = index.id_by_hash(&block.hash());
            submitted.map_or(false, |id| {
                index.find_fork(id, chain.tip_id()) == id || tip_hash == block.hash()
            })
        };
        Ok(BlockAccepted { active })
    }

    /// Race all staged candidate tips through the parallel validator and
    /// then reconcile the mempool with wherever the tip landed.
    pub fn race_candidates(&self) -> Result<Option<Hash256>, Rejection> {
        let old_tip = self.get_tip();
        let winner = self.validator.validate_candidates(&self.chain)?;
        self.reconcile_tip(&old_tip);
        Ok(winner)
    }

    /// Decode and admit a transaction synchronously.
    pub fn submit_transaction(&self, bytes: &[u8], source: TxSource) -> AdmissionResult {
        match codec::deserialize::<Transaction>(bytes) {
            Ok(tx) => self.admission.admit(Arc::new(tx), source),
            Err(_) => AdmissionResult::Rejected(Rejection::decode("malformed transaction")),
        }
    }

    /// Queue a transaction for the admission workers.
    pub fn submit_transaction_async(&self, tx: Arc<Transaction>, source: TxSource) {
        self.start_admission_workers();
        let pool = self.admission_pool.lock();
        pool.as_ref()
            .expect("admission workers started")
            .submit(tx, source);
    }

    #[must_use]
    pub fn get_tip(&self) -> BlockIndexEntry {
        self.chain.lock().tip_entry()
    }

    #[must_use]
    pub fn get_header(&self, hash: &Hash256) -> Option<BlockIndexEntry> {
        let chain = self.chain.lock();
        let index = chain.index.read();
        index.lookup(hash).cloned()
    }

    #[must_use]
    pub fn get_locator(&self) -> BlockLocator {
        let chain = self.chain.lock();
        let tip = chain.tip_id();
        let index = chain.index.read();
        index.locator(tip)
    }

    /// Unspent coin lookup against the active chain.
    #[must_use]
    pub fn get_coin(&self, out: &OutPoint) -> Option<Coin> {
        let chain = self.chain.lock();
        let coin = chain.utxo.write().get_coin(out)?;
        (!coin.spent).then_some(coin)
    }

    /// Assemble a mining template from the pool, best packages first, in
    /// canonical order.
    #[must_use]
    pub fn get_block_template(&self) -> BlockTemplate {
        let (prev_hash, height, bits, mtp) = {
            let chain = self.chain.lock();
            let tip = chain.tip_id();
            let index = chain.index.read();
            (
                index.entry(tip).hash,
                index.entry(tip).height + 1,
                index.expected_bits(tip, &self.config.params),
                index.median_time_past(tip),
            )
        };

        let mut fees: Money = 0;
        let mut total_size: u64 = 1000; // header + coinbase headroom
        let mut included: Vec<Arc<Transaction>> = Vec::new();
        {
            let mempool = self.mempool.lock();
            let mut included_ids = std::collections::HashSet::new();
            for tx in mempool.assembly_order() {
                let entry = mempool.get(&tx.txid()).expect("assembly tx in pool");
                if total_size + entry.size > self.config.params.excessive_block_size {
                    continue;
                }
                // Single-pass connect requires in-block parents to sort
                // before their children under canonical order
                let parents_ok = tx.vin.iter().all(|input| {
                    if mempool.contains(&input.prev_out.txid) {
                        included_ids.contains(&input.prev_out.txid)
                            && input.prev_out.txid < tx.txid()
                    } else {
                        true
                    }
                });
                if !parents_ok {
                    continue;
                }
                total_size += entry.size;
                fees += entry.fee;
                included_ids.insert(tx.txid());
                included.push(tx);
            }
        }
        included.sort_by_key(|tx| tx.txid());

        let subsidy = block_subsidy(height);
        let time = (self.clock.unix_seconds().max(mtp + 1)) as u32;
        BlockTemplate {
            prev_hash,
            height,
            bits,
            time,
            txs: included,
            subsidy,
            fees,
            coinbase_value: subsidy + fees,
        }
    }

    pub fn subscribe_tip_change(&self) -> crossbeam_channel::Receiver<TipChanged> {
        self.events.subscribe_tip_change()
    }

    pub fn subscribe_tx_accepted(&self) -> crossbeam_channel::Receiver<TxAcceptedEvent> {
        self.events.subscribe_tx_accepted()
    }

    pub fn subscribe_double_spend(&self) -> crossbeam_channel::Receiver<DoubleSpendSeen> {
        self.events.subscribe_double_spend()
    }

    /// Periodic maintenance: mempool and orphan expiry, cache flushing.
    /// Driven by the scheduler thread.
    pub fn run_periodics(&self) {
        let now = self.clock.unix_seconds();

        let expired = {
            let mut mempool = self.mempool.lock();
            mempool.expire(now - self.config.mempool_expiry_secs)
        };
        if !expired.is_empty() {
            info!("expired {} pool transactions", expired.len());
        }

        let expired_orphans = self
            .orphans
            .lock()
            .expire(now - self.config.orphan_expiry_secs);
        if expired_orphans > 0 {
            info!("expired {expired_orphans} orphans");
        }

        self.chain.lock().flush();
    }

    /// Block until shutdown is requested, running periodics on the given
    /// cadence. The final flush happens before returning.
    pub fn run_scheduler(&self, interval: Duration) {
        info!("scheduler running every {interval:?}");
        while !self.shutdown.requested() {
            std::thread::sleep(interval);
            self.run_periodics();
        }
        self.stop();
    }

    /// Graceful shutdown: stop workers, flush state.
    pub fn stop(&self) {
        self.shutdown.request();
        if let Some(mut pool) = self.admission_pool.lock().take() {
            pool.stop();
        }
        self.chain.lock().flush();
        info!("node stopped");
    }

    /// Purge confirmed transactions and resurrect disconnected ones after
    /// the chain moved.
    fn apply_chain_outcome(&self, outcome: &ReorgOutcome) {
        if !outcome.tip_changed {
            return;
        }

        {
            let mut mempool = self.mempool.lock();
            for block in &outcome.connected {
                mempool.remove_for_block(&block.txs);
            }
        }

        for block in &outcome.disconnected {
            for tx in block.txs.iter().skip(1) {
                let result = self
                    .admission
                    .admit(Arc::new(tx.clone()), TxSource::Internal);
                if let AdmissionResult::Rejected(rejection) = result {
                    warn!(
                        "disconnected tx {} not resurrected: {}",
                        tx.txid(),
                        rejection.detail
                    );
                }
            }
        }

        let tip = self.get_tip();
        self.events.publish_tip_change(TipChanged {
            hash: tip.hash,
            height: tip.height,
        });
    }

    /// Mempool/event reconciliation after a tip change made outside
    /// `submit_block_obj` (the parallel race path).
    fn reconcile_tip(&self, old_tip: &BlockIndexEntry) {
        let new_tip = self.get_tip();
        if new_tip.hash == old_tip.hash {
            return;
        }

        let mut outcome = ReorgOutcome {
            tip_changed: true,
            ..Default::default()
        };
        {
            let chain = self.chain.lock();
            let index = chain.index.read();
            let old_id = index.id_by_hash(&old_tip.hash).expect("old tip indexed");
            let new_id = index.id_by_hash(&new_tip.hash).expect("new tip indexed");
            let fork = index.find_fork(old_id, new_id);

            let mut walk = old_id;
            while walk != fork {
                let entry = index.entry(walk);
                if let Some(pos) = entry.block_pos {
                    if let Ok(block) = chain.block_store.read_block(pos) {
                        outcome.disconnected.push(block);
                    }
                }
                walk = entry.parent.expect("fork reachable");
            }

            let mut connected = Vec::new();
            let mut walk = new_id;
            while walk != fork {
                let entry = index.entry(walk);
                if let Some(pos) = entry.block_pos {
                    if let Ok(block) = chain.block_store.read_block(pos) {
                        connected.push(block);
                    }
                }
                walk = entry.parent.expect("fork reachable");
            }
            connected.reverse();
            outcome.connected = connected;
        }
        self.apply_chain_outcome(&outcome);
    }
}

/// Persist every block index record into its column family.
pub fn save_block_index(db: &triomphe::Arc<DB>, index: &BlockIndex) -> Result<(), Rejection> {
    let cf = db
        .cf_handle(BLOCK_INDEX_CF)
        .ok_or(Rejection::transient("missing block index column family"))?;
    let txn = db.transaction();
    for (id, record) in index.to_records() {
        txn.put_cf(&cf, id.to_be_bytes(), record)
            .map_err(|_| Rejection::transient("block index write failed"))?;
    }
    txn.commit()
        .map_err(|_| Rejection::transient("block index commit failed"))
}

/// Rebuild the block index from its column family; empty database yields an
/// empty index.
pub fn load_block_index(db: &triomphe::Arc<DB>) -> Result<BlockIndex, Rejection> {
    let cf = db
        .cf_handle(BLOCK_INDEX_CF)
        .ok_or(Rejection::transient("missing block index column family"))?;
    let mut records = Vec::new();
    for item in db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
        let (key, value) = item.map_err(|_| Rejection::transient("block index read failed"))?;
        if key.len() != 4 {
            continue;
        }
        let id = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
        records.push((id, value.to_vec()));
    }
    BlockIndex::from_records(records).map_err(Rejection::transient)
}
