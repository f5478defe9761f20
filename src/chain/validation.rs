// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Block validation and the active-chain state machine.
//!
//! `connect_block` applies a block to an overlay of the UTXO set; the
//! overlay commits only after every check passed, so a failure at any point
//! rolls the whole block back. `ChainState::activate_best_chain` drives
//! reorganizations: disconnect back to the fork, connect forward along the
//! heavier branch, each step durable before the next begins.

use crate::chain::{BlockIndex, BlockStore, HeaderErr, STATUS_HAVE_DATA, STATUS_HAVE_UNDO,
    STATUS_VALID_CHAIN, STATUS_VALID_SCRIPTS, STATUS_VALID_TX};
use crate::coins::{BlockUndo, Coin, CoinsCache, CoinsOverlay, TxUndo};
use crate::consensus::{
    block_subsidy, max_block_sigops, money_range, Money, Params, MAX_TX_SIGCHECK_COUNT,
    MAX_TX_SIGOPS_COUNT,
};
use crate::primitives::{Block, Hash256, OutPoint, Transaction};
use crate::vm::{
    verify_script, ScriptError, TransactionSignatureChecker, MANDATORY_SCRIPT_VERIFY_FLAGS,
};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Script verifications per cancellation poll
const SCRIPT_BATCH_SIZE: usize = 64;

/// Flush the coin cache once it holds more than this many bytes
pub const DEFAULT_COIN_CACHE_MAX_BYTES: usize = 300 * 1024 * 1024;

pub trait WallClock: Send + Sync {
    fn unix_seconds(&self) -> i64;
}

pub struct SystemClock;

impl WallClock for SystemClock {
    fn unix_seconds(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Settable clock for tests.
pub struct MockClock {
    now: AtomicI64,
}

impl MockClock {
    #[must_use]
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl WallClock for MockClock {
    fn unix_seconds(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// Malformed bytes; peer is scored
    Decode,
    /// Local policy; never a ban
    Policy,
    /// Consensus violation; block marked failed, peer banned
    Consensus,
    /// Resource problem; retryable, includes cancellation
    Transient,
}

/// Structured validation failure, surfaced to the network layer for ban
/// scoring and recorded against the block index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub detail: &'static str,
    pub ban_score: u32,
}

impl Rejection {
    #[must_use]
    pub fn consensus(detail: &'static str) -> Self {
        Self {
            kind: RejectionKind::Consensus,
            detail,
            ban_score: 100,
        }
    }

    #[must_use]
    pub fn policy(detail: &'static str) -> Self {
        Self {
            kind: RejectionKind::Policy,
            detail,
            ban_score: 0,
        }
    }

    #[must_use]
    pub fn decode(detail: &'static str) -> Self {
        Self {
            kind: RejectionKind::Decode,
            detail,
            ban_score: 10,
        }
    }

    #[must_use]
    pub fn transient(detail: &'static str) -> Self {
        Self {
            kind: RejectionKind::Transient,
            detail,
            ban_score: 0,
        }
    }

    #[must_use]
    pub fn interrupted() -> Self {
        Self::transient("validation interrupted")
    }
}

impl From<HeaderErr> for Rejection {
    fn from(err: HeaderErr) -> Self {
        match err {
            HeaderErr::UnknownParent => Rejection::policy("header parent unknown"),
            HeaderErr::ParentInvalid => Rejection::consensus("header extends invalid chain"),
            HeaderErr::BadVersion => Rejection::consensus("unknown block version"),
            HeaderErr::HighHash => Rejection::consensus("proof of work failed"),
            HeaderErr::BadDiffBits => Rejection::consensus("incorrect difficulty bits"),
            HeaderErr::TimeTooOld => Rejection::consensus("timestamp below median time past"),
            HeaderErr::TimeTooNew => Rejection::policy("timestamp too far in the future"),
            HeaderErr::GenesisAlreadySet => Rejection::transient("genesis already initialized"),
        }
    }
}

/// Legacy sigops of a transaction's own scripts.
#[must_use]
pub fn tx_sigops(tx: &Transaction) -> u64 {
    let mut count = 0u64;
    for input in &tx.vin {
        count += input.script_sig.sig_op_count(false);
    }
    for out in &tx.vout {
        count += out.script_pubkey.sig_op_count(false);
    }
    count
}

/// Pure block checks: shape, merkle commitment, size, static sigop budget.
pub fn check_block(block: &Block, params: &Params) -> Result<(), Rejection> {
    if block.txs.is_empty() {
        return Err(Rejection::consensus("block has no transactions"));
    }

    let size = block.serialized_size() as u64;
    if size > params.excessive_block_size {
        return Err(Rejection::consensus("block size above excessive limit"));
    }

    if !block.txs[0].is_coinbase() {
        return Err(Rejection::consensus("first transaction is not coinbase"));
    }
    for tx in &block.txs[1..] {
        if tx.is_coinbase() {
            return Err(Rejection::consensus("more than one coinbase"));
        }
    }

    for tx in &block.txs {
        tx.check()
            .map_err(|_| Rejection::consensus("transaction fails structural checks"))?;
    }

    let mut txids = HashSet::with_capacity(block.txs.len());
    for tx in &block.txs {
        if !txids.insert(tx.txid()) {
            return Err(Rejection::consensus("duplicate transaction in block"));
        }
    }

    if block.header.merkle_root != block.compute_merkle_root() {
        return Err(Rejection::consensus("merkle root mismatch"));
    }

    let mut sigops = 0u64;
    for tx in &block.txs {
        let tx_count = tx_sigops(tx);
        if tx_count > MAX_TX_SIGOPS_COUNT {
            return Err(Rejection::consensus("too many sigops in transaction"));
        }
        sigops += tx_count;
    }
    if sigops > max_block_sigops(size) {
        return Err(Rejection::consensus("too many sigops in block"));
    }

    Ok(())
}

/// Checks that need the block's place in the chain: BIP34 height, canonical
/// transaction order, finality against the parent's median time.
pub fn contextual_check_block(
    block: &Block,
    height: u32,
    median_time_past: i64,
    params: &Params,
) -> Result<(), Rejection> {
    if height >= params.bip34_height {
        let committed = block.txs[0]
            .coinbase_height()
            .map_err(|_| Rejection::consensus("coinbase lacks height commitment"))?;
        if committed != u64::from(height) {
            return Err(Rejection::consensus("coinbase height mismatch"));
        }
    }

    if height >= params.canonical_tx_order_height {
        for pair in block.txs[1..].windows(2) {
            if pair[0].txid() >= pair[1].txid() {
                return Err(Rejection::consensus("transactions not in canonical order"));
            }
        }
    }

    for tx in &block.txs {
        if !tx.is_final(i64::from(height), median_time_past) {
            return Err(Rejection::consensus("non-final transaction"));
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectStats {
    /// Total fees, inputs valued with interest at the connect height
    pub fees: Money,
    pub sigchecks: u64,
}

/// Knobs for `connect_block`. `stop` is polled at input loops and between
/// script batches; `pvtest_delay` artificially widens validation races.
pub struct ConnectOpts {
    pub check_scripts: bool,
    pub stop: Option<Arc<AtomicBool>>,
    pub pvtest_delay: Option<Duration>,
}

impl Default for ConnectOpts {
    fn default() -> Self {
        Self {
            check_scripts: true,
            stop: None,
            pvtest_delay: None,
        }
    }
}

fn stopped(opts: &ConnectOpts) -> bool {
    opts.stop
        .as_ref()
        .map_or(false, |flag| flag.load(Ordering::Relaxed))
}

struct ScriptJob {
    tx_index: usize,
    input_index: usize,
    script_pubkey: crate::vm::Script,
    /// Spent value with interest at the connect height; committed by FORKID
    /// signatures
    amount: Money,
}

/// Apply a block to the overlay at `height`. On success returns the undo
/// record and accumulated stats; on failure the overlay must be discarded.
pub fn connect_block(
    block: &Block,
    height: u32,
    overlay: &mut CoinsOverlay<'_>,
    params: &Params,
    opts: &ConnectOpts,
) -> Result<(BlockUndo, ConnectStats), Rejection> {
    let mut undo = BlockUndo::default();
    let mut fees: Money = 0;
    let mut script_jobs: Vec<ScriptJob> = Vec::new();

    for (tx_index, tx) in block.txs.iter().enumerate() {
        if stopped(opts) {
            return Err(Rejection::interrupted());
        }
        let txid = tx.txid();

        if tx_index > 0 {
            let mut tx_undo = TxUndo::default();
            let mut value_in: Money = 0;

            for (input_index, input) in tx.vin.iter().enumerate() {
                if stopped(opts) {
                    return Err(Rejection::interrupted());
                }
                let Some(coin) = overlay.spend_coin(&input.prev_out) else {
                    return Err(Rejection::consensus("input missing or already spent"));
                };
                if coin.coinbase && height - coin.height < params.coinbase_maturity {
                    return Err(Rejection::consensus("premature spend of coinbase"));
                }

                let amount = coin.value_at(height);
                value_in += amount;
                if !money_range(value_in) {
                    return Err(Rejection::consensus("input value out of range"));
                }

                // P2SH spends are charged their redeem script's sigops
                if coin.output.script_pubkey.is_pay_to_script_hash() {
                    let p2sh_ops = coin
                        .output
                        .script_pubkey
                        .p2sh_sig_op_count(&input.script_sig);
                    if p2sh_ops > MAX_TX_SIGOPS_COUNT {
                        return Err(Rejection::consensus("too many sigops in transaction"));
                    }
                }

                script_jobs.push(ScriptJob {
                    tx_index,
                    input_index,
                    script_pubkey: coin.output.script_pubkey.clone(),
                    amount,
                });
                tx_undo.spent.push(coin);
            }

            let value_out = tx.total_output_value();
            if value_in < value_out {
                return Err(Rejection::consensus("inputs below outputs"));
            }
            fees += value_in - value_out;
            if !money_range(fees) {
                return Err(Rejection::consensus("fee out of range"));
            }

            undo.tx_undos.push(tx_undo);
        }

        for (vout, out) in tx.vout.iter().enumerate() {
            if out.script_pubkey.is_unspendable() {
                continue;
            }
            let coin = Coin::new(out.clone(), height, tx_index == 0);
            overlay
                .add_coin(OutPoint::new(txid, vout as u32), coin, false)
                .map_err(|_| Rejection::consensus("output already exists"))?;
        }
    }

    let coinbase_out = block.txs[0].total_output_value();
    if coinbase_out > block_subsidy(height) + fees {
        return Err(Rejection::consensus("coinbase pays more than subsidy plus fees"));
    }

    let mut stats = ConnectStats {
        fees,
        sigchecks: 0,
    };

    if opts.check_scripts {
        let mut per_tx_sigchecks = vec![0u64; block.txs.len()];
        for batch in script_jobs.chunks(SCRIPT_BATCH_SIZE) {
            if stopped(opts) {
                return Err(Rejection::interrupted());
            }
            if let Some(delay) = opts.pvtest_delay {
                std::thread::sleep(delay);
            }

            let results: Vec<(usize, u32, bool, ScriptError)> = batch
                .par_iter()
                .map(|job| {
                    let tx = &block.txs[job.tx_index];
                    let checker = TransactionSignatureChecker {
                        tx,
                        input_index: job.input_index,
                        amount: job.amount,
                    };
                    let (ok, sigchecks, err) = verify_script(
                        &tx.vin[job.input_index].script_sig,
                        &job.script_pubkey,
                        MANDATORY_SCRIPT_VERIFY_FLAGS,
                        &checker,
                    );
                    (job.tx_index, sigchecks, ok, err)
                })
                .collect();

            for (tx_index, sigchecks, ok, err) in results {
                if !ok {
                    warn!(
                        "script failure in block at height {height}, tx {tx_index}: {err:?}"
                    );
                    return Err(Rejection::consensus("script evaluation failed"));
                }
                stats.sigchecks += u64::from(sigchecks);
                per_tx_sigchecks[tx_index] += u64::from(sigchecks);
                if per_tx_sigchecks[tx_index] > MAX_TX_SIGCHECK_COUNT {
                    return Err(Rejection::consensus("too many sigchecks in transaction"));
                }
            }
        }
        if stats.sigchecks > params.max_block_sigchecks() {
            return Err(Rejection::consensus("too many sigchecks in block"));
        }
    }

    Ok((undo, stats))
}

/// Inverse of `connect_block`: remove created coins, restore spent ones.
pub fn disconnect_block(
    block: &Block,
    undo: &BlockUndo,
    overlay: &mut CoinsOverlay<'_>,
) -> Result<(), Rejection> {
    if undo.tx_undos.len() + 1 != block.txs.len() {
        return Err(Rejection::transient("undo record does not match block"));
    }

    for (tx_index, tx) in block.txs.iter().enumerate().rev() {
        let txid = tx.txid();
        for (vout, out) in tx.vout.iter().enumerate().rev() {
            if out.script_pubkey.is_unspendable() {
                continue;
            }
            if overlay.spend_coin(&OutPoint::new(txid, vout as u32)).is_none() {
                return Err(Rejection::transient("created coin missing during disconnect"));
            }
        }

        if tx_index > 0 {
            let tx_undo = &undo.tx_undos[tx_index - 1];
            if tx_undo.spent.len() != tx.vin.len() {
                return Err(Rejection::transient("undo record does not match inputs"));
            }
            for (input, coin) in tx.vin.iter().zip(tx_undo.spent.iter()) {
                overlay
                    .add_coin(input.prev_out, coin.clone(), true)
                    .map_err(|_| Rejection::transient("undo restore failed"))?;
            }
        }
    }

    Ok(())
}

/// Outcome of an `activate_best_chain` pass, used by the node to update the
/// mempool and publish events.
#[derive(Debug, Default)]
pub struct ReorgOutcome {
    pub tip_changed: bool,
    /// Blocks connected, oldest first
    pub connected: Vec<Block>,
    /// Blocks disconnected, newest first; their transactions may be
    /// resurrected into the mempool
    pub disconnected: Vec<Block>,
    /// Blocks that failed to connect during this pass
    pub failures: Vec<(Hash256, Rejection)>,
}

/// The authoritative chain: block index, coin cache, block files, and the
/// single active tip. Mutations happen under the node's chain lock.
pub struct ChainState {
    pub params: Params,
    pub clock: Arc<dyn WallClock>,
    pub index: Arc<RwLock<BlockIndex>>,
    pub utxo: Arc<RwLock<CoinsCache>>,
    pub block_store: Arc<dyn BlockStore>,
    tip: u32,
    coin_cache_max_bytes: usize,
    /// Serializes overlay commits from parallel validation workers
    pub commit_lock: Arc<Mutex<()>>,
}

impl ChainState {
    /// Build the state and connect the genesis block if the coin set is
    /// fresh.
    pub fn bootstrap(
        params: Params,
        clock: Arc<dyn WallClock>,
        index: Arc<RwLock<BlockIndex>>,
        utxo: Arc<RwLock<CoinsCache>>,
        block_store: Arc<dyn BlockStore>,
    ) -> Result<Self, Rejection> {
        let genesis = crate::chain::genesis_block(&params);
        let genesis_hash = genesis.hash();

        {
            let mut index_ref = index.write();
            if index_ref.is_empty() {
                index_ref
                    .init_genesis(genesis.header)
                    .map_err(Rejection::from)?;
            }
        }

        let mut state = Self {
            params,
            clock,
            index,
            utxo,
            block_store,
            tip: 0,
            coin_cache_max_bytes: DEFAULT_COIN_CACHE_MAX_BYTES,
            commit_lock: Arc::new(Mutex::new(())),
        };

        let best = state.utxo.read().best_block();
        match best {
            None => {
                // Fresh coin database: connect genesis outputs
                let mut overlay = CoinsOverlay::new(&state.utxo);
                let genesis_txid = genesis.txs[0].txid();
                for (vout, out) in genesis.txs[0].vout.iter().enumerate() {
                    if out.script_pubkey.is_unspendable() {
                        continue;
                    }
                    overlay
                        .add_coin(
                            OutPoint::new(genesis_txid, vout as u32),
                            Coin::new(out.clone(), 0, true),
                            false,
                        )
                        .map_err(|_| Rejection::transient("genesis coins already present"))?;
                }
                overlay.set_best_block(genesis_hash);
                overlay
                    .commit()
                    .map_err(|_| Rejection::transient("genesis commit failed"))?;
                let pos = state
                    .block_store
                    .append_block(&genesis)
                    .map_err(|_| Rejection::transient("genesis block write failed"))?;
                let mut index_ref = state.index.write();
                let id = index_ref.id_by_hash(&genesis_hash).expect("genesis indexed");
                index_ref.entry_mut(id).block_pos = Some(pos);
                index_ref.entry_mut(id).status.set(STATUS_HAVE_DATA);
                state.tip = id;
            }
            Some(best_hash) => {
                let index_ref = state.index.read();
                let id = index_ref
                    .id_by_hash(&best_hash)
                    .ok_or(Rejection::transient("coin set ahead of block index"))?;
                drop(index_ref);
                state.tip = id;
            }
        }

        info!(
            "chain state bootstrapped on {} at height {}",
            state.params.network_name,
            state.tip_entry().height
        );
        Ok(state)
    }

    #[must_use]
    pub fn tip_id(&self) -> u32 {
        self.tip
    }

    #[must_use]
    pub fn tip_entry(&self) -> crate::chain::BlockIndexEntry {
        self.index.read().entry(self.tip).clone()
    }

    pub fn set_coin_cache_max_bytes(&mut self, bytes: usize) {
        self.coin_cache_max_bytes = bytes;
    }

    /// Index a block's header and persist its data without touching the
    /// active chain. Used directly by the parallel validation orchestrator.
    pub fn stage_block(&mut self, block: &Block) -> Result<u32, Rejection> {
        let id = {
            let mut index_ref = self.index.write();
            index_ref.insert_header(block.header, &self.params, &*self.clock)?
        };

        check_block(block, &self.params)?;

        let mut index_ref = self.index.write();
        if index_ref.entry(id).block_pos.is_none() {
            let pos = self
                .block_store
                .append_block(block)
                .map_err(|_| Rejection::transient("block write failed"))?;
            let entry = index_ref.entry_mut(id);
            entry.block_pos = Some(pos);
            entry.status.set(STATUS_HAVE_DATA);
        }
        Ok(id)
    }

    /// Accept a block: index its header, persist its data, then try to
    /// advance the active chain.
    pub fn submit_block(&mut self, block: &Block) -> Result<ReorgOutcome, Rejection> {
        self.stage_block(block)?;

        let outcome = self.activate_best_chain(None)?;
        let submitted_hash = block.hash();
        if let Some((_, rejection)) = outcome
            .failures
            .iter()
            .find(|(hash, _)| *hash == submitted_hash)
        {
            return Err(rejection.clone());
        }
        Ok(outcome)
    }

    /// Switch to the best-work valid candidate, disconnecting and
    /// connecting as needed. Each step commits before the next begins, so a
    /// crash leaves a consistent prefix.
    pub fn activate_best_chain(
        &mut self,
        stop: Option<Arc<AtomicBool>>,
    ) -> Result<ReorgOutcome, Rejection> {
        let mut outcome = ReorgOutcome::default();

        loop {
            let (best, tip_work) = {
                let index_ref = self.index.read();
                let best = index_ref.best_candidate();
                (best, index_ref.entry(self.tip).chain_work)
            };
            let Some(best) = best else { break };
            if best == self.tip {
                break;
            }
            {
                let index_ref = self.index.read();
                let best_entry = index_ref.entry(best);
                if best_entry.chain_work <= tip_work {
                    break;
                }
                if !best_entry.status.has(STATUS_HAVE_DATA) {
                    break;
                }
            }

            let fork = self.index.read().find_fork(self.tip, best);

            // Disconnect back to the fork point
            while self.tip != fork {
                let block = self.disconnect_tip()?;
                outcome.disconnected.push(block);
                outcome.tip_changed = true;
            }

            // Connect forward along the new branch
            let path: Vec<u32> = {
                let index_ref = self.index.read();
                let mut path = Vec::new();
                let mut walk = best;
                while walk != fork {
                    path.push(walk);
                    walk = index_ref.entry(walk).parent.expect("fork is an ancestor");
                }
                path.reverse();
                path
            };

            let mut failed = false;
            for id in path {
                if stop
                    .as_ref()
                    .map_or(false, |flag| flag.load(Ordering::Relaxed))
                {
                    return Err(Rejection::interrupted());
                }
                match self.connect_tip(id, &stop) {
                    Ok(block) => {
                        outcome.connected.push(block);
                        outcome.tip_changed = true;
                    }
                    Err(rejection) if rejection.kind == RejectionKind::Consensus => {
                        let hash = self.index.read().entry(id).hash;
                        warn!("block {hash} failed to connect: {}", rejection.detail);
                        self.index.write().mark_failed(id);
                        outcome.failures.push((hash, rejection));
                        failed = true;
                        break;
                    }
                    Err(rejection) => return Err(rejection),
                }
            }

            if !failed {
                break;
            }
            // A connect failed: loop to activate the best remaining tip
        }

        let tip_work = self.index.read().entry(self.tip).chain_work;
        self.index.write().prune_candidates_below(tip_work, self.tip);

        Ok(outcome)
    }

    fn connect_tip(&mut self, id: u32, stop: &Option<Arc<AtomicBool>>) -> Result<Block, Rejection> {
        let (block, height, mtp, parent_hash) = {
            let index_ref = self.index.read();
            let entry = index_ref.entry(id);
            debug_assert_eq!(entry.parent, Some(self.tip));
            let pos = entry
                .block_pos
                .ok_or(Rejection::transient("no block data for candidate"))?;
            let block = self
                .block_store
                .read_block(pos)
                .map_err(|_| Rejection::transient("block read failed"))?;
            let parent = entry.parent.expect("non-genesis connect");
            (
                block,
                entry.height,
                index_ref.median_time_past(parent),
                index_ref.entry(parent).hash,
            )
        };
        debug_assert_eq!(block.header.prev_hash, parent_hash);

        contextual_check_block(&block, height, mtp, &self.params)?;

        let mut overlay = CoinsOverlay::new(&self.utxo);
        let opts = ConnectOpts {
            check_scripts: true,
            stop: stop.clone(),
            pvtest_delay: None,
        };
        let (undo, _stats) = match connect_block(&block, height, &mut overlay, &self.params, &opts)
        {
            Ok(result) => result,
            Err(rejection) => {
                overlay.discard();
                return Err(rejection);
            }
        };

        let undo_pos = self
            .block_store
            .append_undo(&undo)
            .map_err(|_| Rejection::transient("undo write failed"))?;

        let _commit_guard = self.commit_lock.lock();
        overlay.set_best_block(block.hash());
        overlay
            .commit()
            .map_err(|_| Rejection::transient("overlay commit failed"))?;

        {
            let mut index_ref = self.index.write();
            let entry = index_ref.entry_mut(id);
            entry.undo_pos = Some(undo_pos);
            entry
                .status
                .set(STATUS_HAVE_UNDO | STATUS_VALID_TX | STATUS_VALID_SCRIPTS | STATUS_VALID_CHAIN);
        }
        self.tip = id;

        self.maybe_flush();
        info!("new tip {} at height {height}", block.hash());
        Ok(block)
    }

    /// Commit a candidate whose overlay was validated outside the chain
    /// lock, provided the tip has not moved since the race began. Returns
    /// `false` (discarding the overlay) when another candidate won first.
    pub fn commit_raced_candidate(
        &mut self,
        id: u32,
        expected_parent: u32,
        mut overlay: CoinsOverlay<'_>,
        undo: &BlockUndo,
    ) -> Result<bool, Rejection> {
        if self.tip != expected_parent {
            overlay.discard();
            return Ok(false);
        }

        let undo_pos = self
            .block_store
            .append_undo(undo)
            .map_err(|_| Rejection::transient("undo write failed"))?;

        let block_hash = self.index.read().entry(id).hash;
        let _commit_guard = self.commit_lock.lock();
        overlay.set_best_block(block_hash);
        overlay
            .commit()
            .map_err(|_| Rejection::transient("overlay commit failed"))?;

        {
            let mut index_ref = self.index.write();
            let entry = index_ref.entry_mut(id);
            entry.undo_pos = Some(undo_pos);
            entry
                .status
                .set(STATUS_HAVE_UNDO | STATUS_VALID_TX | STATUS_VALID_SCRIPTS | STATUS_VALID_CHAIN);
        }
        self.tip = id;
        self.maybe_flush();

        info!("parallel validation committed {block_hash}");
        Ok(true)
    }

    fn disconnect_tip(&mut self) -> Result<Block, Rejection> {
        let (block, undo, parent, parent_hash) = {
            let index_ref = self.index.read();
            let entry = index_ref.entry(self.tip);
            let parent = entry
                .parent
                .ok_or(Rejection::transient("cannot disconnect genesis"))?;
            let block_pos = entry
                .block_pos
                .ok_or(Rejection::transient("no block data for tip"))?;
            let undo_pos = entry
                .undo_pos
                .ok_or(Rejection::transient("no undo data for tip"))?;
            let block = self
                .block_store
                .read_block(block_pos)
                .map_err(|_| Rejection::transient("block read failed"))?;
            let undo = self
                .block_store
                .read_undo(undo_pos)
                .map_err(|_| Rejection::transient("undo read failed"))?;
            (block, undo, parent, index_ref.entry(parent).hash)
        };

        let mut overlay = CoinsOverlay::new(&self.utxo);
        if let Err(rejection) = disconnect_block(&block, &undo, &mut overlay) {
            overlay.discard();
            return Err(rejection);
        }

        let _commit_guard = self.commit_lock.lock();
        overlay.set_best_block(parent_hash);
        overlay
            .commit()
            .map_err(|_| Rejection::transient("overlay commit failed"))?;

        let old_tip = self.tip;
        {
            let mut index_ref = self.index.write();
            index_ref
                .entry_mut(old_tip)
                .status
                .clear(STATUS_VALID_CHAIN);
            index_ref.reinstate_candidate(old_tip);
        }
        self.tip = parent;

        info!("disconnected block {}", block.hash());
        Ok(block)
    }

    fn maybe_flush(&self) {
        let needs_flush = self.utxo.read().cached_bytes() > self.coin_cache_max_bytes;
        if needs_flush {
            self.flush();
        }
    }

    /// Force the coin cache down to disk.
    pub fn flush(&self) {
        if let Err(err) = self.utxo.write().flush() {
            // A failed flush leaves the disk snapshot stale but consistent
            warn!("coin cache flush failed: {err:?}");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::consensus::{value_with_interest, COIN, INITIAL_BLOCK_REWARD};
    use crate::primitives::transaction::test_util::{coinbase_tx, spend_tx};

    #[test]
    fn bootstrap_connects_genesis() {
        let h = harness();
        assert_eq!(h.state.tip_entry().height, 0);
        let genesis = crate::chain::genesis_block(&h.state.params);
        let mut utxo = h.state.utxo.write();
        let coin = utxo
            .get_coin(&OutPoint::new(genesis.txs[0].txid(), 0))
            .unwrap();
        assert!(coin.coinbase);
        assert_eq!(coin.height, 0);
    }

    #[test]
    fn submit_extends_active_chain() {
        let mut h = harness();
        let hashes = mine_chain(&mut h.state, 3);
        assert_eq!(h.state.tip_entry().height, 3);
        assert_eq!(h.state.tip_entry().hash, hashes[2]);
    }

    #[test]
    fn check_block_rejects_bad_merkle() {
        let mut h = harness();
        let tip = h.state.tip_entry().hash;
        let mut block = build_block(&h.state, tip, vec![]);
        block.header.merkle_root = Hash256::zero();
        // Re-mine so only the merkle commitment is wrong
        while !crate::consensus::check_proof_of_work(
            &block.hash(),
            block.header.bits,
            &h.state.params,
        ) {
            block.header.nonce += 1;
        }
        let err = h.state.submit_block(&block).unwrap_err();
        assert_eq!(err.kind, RejectionKind::Consensus);
    }

    #[test]
    fn check_block_rejects_misplaced_coinbase() {
        let params = Params::regtest();
        let mut block = crate::chain::genesis_block(&params);
        block.txs.push(coinbase_tx(1, COIN));
        block.header.merkle_root = block.compute_merkle_root();
        assert!(check_block(&block, &params).is_err());
    }

    #[test]
    fn coinbase_maturity_boundary() {
        let mut h = harness();
        let maturity = h.state.params.coinbase_maturity;
        let hashes = mine_chain(&mut h.state, 1);
        let reward_block_hash = hashes[0];

        let coinbase_txid = {
            let index = h.state.index.read();
            let id = index.id_by_hash(&reward_block_hash).unwrap();
            let pos = index.entry(id).block_pos.unwrap();
            h.state.block_store.read_block(pos).unwrap().txs[0].txid()
        };

        // The coinbase at height 1 becomes spendable at height 1 + 20; at
        // tip height 19 the spender would land at height 20, one short.
        mine_chain(&mut h.state, (maturity - 2) as usize);
        assert_eq!(h.state.tip_entry().height, maturity - 1);

        let spend = spend_tx(OutPoint::new(coinbase_txid, 0), INITIAL_BLOCK_REWARD);
        let tip = h.state.tip_entry().hash;
        let premature = build_block(&h.state, tip, vec![spend.clone()]);
        let err = h.state.submit_block(&premature).unwrap_err();
        assert_eq!(err.detail, "premature spend of coinbase");
        // The failed block stays in the index, marked failed
        assert!(h
            .state
            .index
            .read()
            .lookup(&premature.hash())
            .unwrap()
            .status
            .has(crate::chain::STATUS_FAILED));

        // One block later the spend is exactly mature
        mine_chain(&mut h.state, 1);
        let tip = h.state.tip_entry().hash;
        let mature = build_block(&h.state, tip, vec![spend]);
        h.state.submit_block(&mature).unwrap();
        assert_eq!(h.state.tip_entry().hash, mature.hash());
    }

    #[test]
    fn fees_accrue_interest_for_miner() {
        let mut h = harness();
        let maturity = h.state.params.coinbase_maturity as usize;
        let hashes = mine_chain(&mut h.state, 1);
        let coinbase_txid = {
            let index = h.state.index.read();
            let id = index.id_by_hash(&hashes[0]).unwrap();
            let pos = index.entry(id).block_pos.unwrap();
            h.state.block_store.read_block(pos).unwrap().txs[0].txid()
        };
        mine_chain(&mut h.state, maturity + 100);

        let spend_height = h.state.tip_entry().height + 1;
        // Spend the block-1 coinbase, paying everything above face value
        // minus one coin as fee
        let spend = spend_tx(OutPoint::new(coinbase_txid, 0), INITIAL_BLOCK_REWARD - COIN);
        let tip = h.state.tip_entry().hash;
        let block = build_block(&h.state, tip, vec![spend.clone()]);

        let mut overlay = CoinsOverlay::new(&h.state.utxo);
        let (undo, stats) = connect_block(
            &block,
            spend_height,
            &mut overlay,
            &h.state.params,
            &ConnectOpts::default(),
        )
        .unwrap();
        overlay.discard();

        let with_interest =
            value_with_interest(INITIAL_BLOCK_REWARD, 1, i64::from(spend_height));
        assert!(with_interest > INITIAL_BLOCK_REWARD);
        assert_eq!(stats.fees, with_interest - (INITIAL_BLOCK_REWARD - COIN));
        assert_eq!(undo.tx_undos.len(), 1);
        assert_eq!(undo.tx_undos[0].spent[0].height, 1);
    }

    #[test]
    fn overspending_inputs_rejected() {
        let mut h = harness();
        let maturity = h.state.params.coinbase_maturity as usize;
        let hashes = mine_chain(&mut h.state, 1);
        let coinbase_txid = {
            let index = h.state.index.read();
            let id = index.id_by_hash(&hashes[0]).unwrap();
            let pos = index.entry(id).block_pos.unwrap();
            h.state.block_store.read_block(pos).unwrap().txs[0].txid()
        };
        mine_chain(&mut h.state, maturity);

        // Claim far more than face value plus any possible interest
        let spend = spend_tx(OutPoint::new(coinbase_txid, 0), INITIAL_BLOCK_REWARD * 2);
        let tip = h.state.tip_entry().hash;
        let block = build_block(&h.state, tip, vec![spend]);
        let err = h.state.submit_block(&block).unwrap_err();
        assert_eq!(err.detail, "inputs below outputs");
    }

    #[test]
    fn double_spend_within_block_rejected() {
        let mut h = harness();
        let maturity = h.state.params.coinbase_maturity as usize;
        let hashes = mine_chain(&mut h.state, 1);
        let coinbase_txid = {
            let index = h.state.index.read();
            let id = index.id_by_hash(&hashes[0]).unwrap();
            let pos = index.entry(id).block_pos.unwrap();
            h.state.block_store.read_block(pos).unwrap().txs[0].txid()
        };
        mine_chain(&mut h.state, maturity);

        let out = OutPoint::new(coinbase_txid, 0);
        let a = spend_tx(out, COIN);
        let mut b = spend_tx(out, 2 * COIN);
        b.lock_time = 0;
        let tip = h.state.tip_entry().hash;
        let block = build_block(&h.state, tip, vec![a, b]);
        let err = h.state.submit_block(&block).unwrap_err();
        assert_eq!(err.detail, "input missing or already spent");
    }

    #[test]
    fn connect_then_disconnect_restores_utxo_snapshot() {
        let mut h = harness();
        mine_chain(&mut h.state, 2);
        h.state.flush();
        let before = h.utxo_store.snapshot();
        let tip_before = h.state.tip_entry().hash;

        let tip = h.state.tip_entry().hash;
        let block = build_block(&h.state, tip, vec![]);
        h.state.submit_block(&block).unwrap();

        // Force the tip back by disconnecting manually
        h.state.disconnect_tip().unwrap();
        h.state.flush();

        assert_eq!(h.utxo_store.snapshot(), before);
        assert_eq!(h.state.tip_entry().hash, tip_before);
    }

    #[test]
    fn reorg_to_heavier_branch() {
        let mut h = harness();
        // g -> a -> b
        let trunk = mine_chain(&mut h.state, 2);
        let a_hash = trunk[0];
        let b_hash = trunk[1];
        assert_eq!(h.state.tip_entry().hash, b_hash);

        // Competing branch g -> a -> c -> d
        let c = build_block(&h.state, a_hash, vec![]);
        let outcome = h.state.submit_block(&c).unwrap();
        // Equal work with the current tip: no switch yet
        assert!(!outcome.tip_changed);
        assert_eq!(h.state.tip_entry().hash, b_hash);

        let d = build_block(&h.state, c.hash(), vec![]);
        let outcome = h.state.submit_block(&d).unwrap();
        assert!(outcome.tip_changed);
        assert_eq!(h.state.tip_entry().hash, d.hash());
        assert_eq!(h.state.tip_entry().height, 3);

        // One disconnect (b), two connects (c, d)
        assert_eq!(outcome.disconnected.len(), 1);
        assert_eq!(outcome.disconnected[0].hash(), b_hash);
        assert_eq!(outcome.connected.len(), 2);
        assert_eq!(outcome.connected[0].hash(), c.hash());
        assert_eq!(outcome.connected[1].hash(), d.hash());

        // b stays in the index, valid but no longer on the active chain
        let index = h.state.index.read();
        let b_entry = index.lookup(&b_hash).unwrap();
        assert!(!b_entry.status.has(STATUS_VALID_CHAIN));
        assert!(!b_entry.status.is_invalid());
    }

    #[test]
    fn failed_connect_falls_back_to_valid_tip() {
        let mut h = harness();
        let trunk = mine_chain(&mut h.state, 2);
        let b_hash = trunk[1];

        // A two-block branch whose second block spends a nonexistent coin
        let c = build_block(&h.state, trunk[0], vec![]);
        h.state.submit_block(&c).unwrap();
        let bogus = spend_tx(
            OutPoint::new(crate::primitives::sha256d(b"no such coin"), 0),
            COIN,
        );
        let d = build_block(&h.state, c.hash(), vec![bogus]);
        let err = h.state.submit_block(&d).unwrap_err();
        assert_eq!(err.detail, "input missing or already spent");

        // The reorg attempt disconnected b and connected c before d
        // failed; the engine settles on a best remaining valid tip of
        // equal work and keeps both branches in the index.
        let tip_hash = h.state.tip_entry().hash;
        assert!(tip_hash == c.hash() || tip_hash == b_hash);
        assert_eq!(h.state.tip_entry().height, 2);
        let index = h.state.index.read();
        assert!(index.lookup(&d.hash()).unwrap().status.has(crate::chain::STATUS_FAILED));
        assert!(!index.lookup(&b_hash).unwrap().status.is_invalid());
        assert!(!index.lookup(&c.hash()).unwrap().status.is_invalid());
    }

    #[test]
    fn ctor_ordering_enforced() {
        let mut h = harness();
        let maturity = h.state.params.coinbase_maturity as usize;
        let first_hashes = mine_chain(&mut h.state, 2);

        let (txid_a, txid_b) = {
            let index = h.state.index.read();
            let id_a = index.id_by_hash(&first_hashes[0]).unwrap();
            let id_b = index.id_by_hash(&first_hashes[1]).unwrap();
            let block_a = h
                .state
                .block_store
                .read_block(index.entry(id_a).block_pos.unwrap())
                .unwrap();
            let block_b = h
                .state
                .block_store
                .read_block(index.entry(id_b).block_pos.unwrap())
                .unwrap();
            (block_a.txs[0].txid(), block_b.txs[0].txid())
        };
        mine_chain(&mut h.state, maturity);

        let spend_a = spend_tx(OutPoint::new(txid_a, 0), COIN);
        let spend_b = spend_tx(OutPoint::new(txid_b, 0), COIN);
        let tip = h.state.tip_entry().hash;
        let mut block = build_block(&h.state, tip, vec![spend_a, spend_b]);

        // build_block sorted them; swapping breaks canonical order
        block.txs.swap(1, 2);
        block.header.merkle_root = block.compute_merkle_root();
        while !crate::consensus::check_proof_of_work(
            &block.hash(),
            block.header.bits,
            &h.state.params,
        ) {
            block.header.nonce += 1;
        }

        let err = h.state.submit_block(&block).unwrap_err();
        assert_eq!(err.detail, "transactions not in canonical order");
    }

    #[test]
    fn connect_block_polls_stop_flag() {
        let h = harness();
        let tip = h.state.tip_entry().hash;
        let block = build_block(&h.state, tip, vec![]);
        let stop = Arc::new(AtomicBool::new(true));

        let mut overlay = CoinsOverlay::new(&h.state.utxo);
        let err = connect_block(
            &block,
            1,
            &mut overlay,
            &h.state.params,
            &ConnectOpts {
                check_scripts: true,
                stop: Some(stop),
                pvtest_delay: None,
            },
        )
        .unwrap_err();
        overlay.discard();
        assert_eq!(err, Rejection::interrupted());
    }

    #[test]
    fn disconnect_refuses_mismatched_undo() {
        let h = harness();
        let genesis = crate::chain::genesis_block(&h.state.params);
        let undo = BlockUndo {
            tx_undos: vec![TxUndo::default()],
        };
        let mut overlay = CoinsOverlay::new(&h.state.utxo);
        assert!(disconnect_block(&genesis, &undo, &mut overlay).is_err());
        overlay.discard();
    }
}
