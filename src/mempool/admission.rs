// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Concurrent transaction admission.
//!
//! Inbound transactions flow through an intake channel into a pool of
//! admission workers. Workers validate without holding the pool lock;
//! integration into the pool is a single serialized commit step. A
//! transaction whose parents are unknown parks in the orphan pool and is
//! retried when a parent arrives; a transaction conflicting with a pool
//! entry is rejected and a double-spend event goes out on the bus.

use crate::chain::{tx_sigops, ChainState, Rejection, WallClock};
use crate::coins::CoinsCache;
use crate::consensus::{
    dust_threshold, money_range, value_with_interest, Money, Params, MAX_OP_RETURN_RELAY,
    MAX_TX_SIGCHECK_COUNT, MAX_TX_SIGOPS_COUNT,
};
use crate::mempool::{FeeRate, Mempool, MempoolLimits};
use crate::node::{DoubleSpendSeen, EventBus, TxAcceptedEvent};
use crate::primitives::{Hash256, Transaction};
use crate::sync::{OrderedMutex, RANK_CHAIN, RANK_MEMPOOL, RANK_ORPHANS};
use crate::vm::opcodes::OP_RETURN;
use crate::vm::{verify_script, TransactionSignatureChecker, STANDARD_SCRIPT_VERIFY_FLAGS};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, trace};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Where a transaction came from; peers can be ban-scored, local sources
/// cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxSource {
    Peer,
    Rpc,
    Wallet,
    /// Orphan promotion and reorg resurrection
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionResult {
    Accepted,
    /// Parked until its missing parents arrive
    Orphaned,
    Rejected(Rejection),
}

struct OrphanEntry {
    tx: Arc<Transaction>,
    time: i64,
}

/// Bounded pool of transactions whose inputs are not yet known.
pub struct OrphanPool {
    map: HashMap<Hash256, OrphanEntry>,
    /// missing parent txid -> orphans waiting on it
    waiting_on: HashMap<Hash256, HashSet<Hash256>>,
    max_entries: usize,
}

impl OrphanPool {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            map: HashMap::new(),
            waiting_on: HashMap::new(),
            max_entries,
        }
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

    pub fn add(&mut self, tx: Arc<Transaction>, missing: &[Hash256], time: i64) {
        let txid = tx.txid();
        if self.map.contains_key(&txid) {
            return;
        }
        if self.map.len() >= self.max_entries {
            // Drop the oldest entry to stay bounded
            if let Some(oldest) = self
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.time)
                .map(|(txid, _)| *txid)
            {
                self.remove(&oldest);
            }
        }
        for parent in missing {
            self.waiting_on.entry(*parent).or_default().insert(txid);
        }
        self.map.insert(txid, OrphanEntry { tx, time });
    }

    fn remove(&mut self, txid: &Hash256) -> Option<Arc<Transaction>> {
        let entry = self.map.remove(txid)?;
        for input in &entry.tx.vin {
            if let Some(waiters) = self.waiting_on.get_mut(&input.prev_out.txid) {
                waiters.remove(txid);
                if waiters.is_empty() {
                    self.waiting_on.remove(&input.prev_out.txid);
                }
            }
        }
        Some(entry.tx)
    }

    /// Pull every orphan that was waiting on `parent`.
    pub fn take_waiting_on(&mut self, parent: &Hash256) -> Vec<Arc<Transaction>> {
        let Some(waiters) = self.waiting_on.remove(parent) else {
            return Vec::new();
        };
        waiters
            .into_iter()
            .filter_map(|txid| self.remove(&txid))
            .collect()
    }

    /// Drop entries older than `cutoff`. Returns how many were removed.
    pub fn expire(&mut self, cutoff: i64) -> usize {
        let stale: Vec<Hash256> = self
            .map
            .iter()
            .filter(|(_, entry)| entry.time < cutoff)
            .map(|(txid, _)| *txid)
            .collect();
        let count = stale.len();
        for txid in stale {
            self.remove(&txid);
        }
        count
    }
}

/// Shared context of the admission pipeline.
pub struct TxAdmission {
    pub params: Params,
    pub chain: Arc<OrderedMutex<ChainState>>,
    pub utxo: Arc<RwLock<CoinsCache>>,
    pub mempool: Arc<OrderedMutex<Mempool>>,
    pub orphans: Arc<OrderedMutex<OrphanPool>>,
    pub events: Arc<EventBus>,
    pub clock: Arc<dyn WallClock>,
    pub limits: MempoolLimits,
    pub min_relay_fee_per_kb: Money,
    pub max_mempool_bytes: u64,
}

impl TxAdmission {
    /// Validate and integrate one transaction, then retry any orphans it
    /// unblocked.
    pub fn admit(&self, tx: Arc<Transaction>, source: TxSource) -> AdmissionResult {
        let result = self.admit_one(tx.clone(), source);
        if result == AdmissionResult::Accepted {
            self.promote_orphans(tx.txid());
        }
        result
    }

    fn admit_one(&self, tx: Arc<Transaction>, source: TxSource) -> AdmissionResult {
        match self.validate_and_commit(tx, source) {
            Ok(result) => result,
            Err(rejection) => AdmissionResult::Rejected(rejection),
        }
    }

    fn validate_and_commit(
        &self,
        tx: Arc<Transaction>,
        source: TxSource,
    ) -> Result<AdmissionResult, Rejection> {
        if tx.is_coinbase() {
            return Err(Rejection::consensus("coinbase as individual transaction"));
        }
        tx.check()
            .map_err(|_| Rejection::decode("fails structural checks"))?;

        let txid = tx.txid();

        // Chain snapshot first; the lock order is chain then mempool
        let (next_height, median_time_past) = {
            let chain = self.chain.lock();
            let tip = chain.tip_entry();
            let mtp = chain.index.read().median_time_past(chain.tip_id());
            (tip.height + 1, mtp)
        };

        if !tx.is_final(i64::from(next_height), median_time_past) {
            return Err(Rejection::policy("non-final transaction"));
        }

        {
            let mempool = self.mempool.lock();
            if mempool.contains(&txid) {
                return Err(Rejection::policy("already in pool"));
            }
            if let Some((outpoint, existing)) = mempool.first_conflict(&tx) {
                drop(mempool);
                self.events.publish_double_spend(DoubleSpendSeen {
                    outpoint,
                    existing,
                    rejected: txid,
                });
                debug!("double spend of {outpoint:?}: kept {existing}, rejected {txid}");
                return Err(Rejection::policy("conflicts with pool transaction"));
            }
        }

        // Resolve inputs against the pool and the confirmed set. Values
        // are taken with interest at the height the spend would confirm.
        let mut amounts: Vec<Money> = Vec::with_capacity(tx.vin.len());
        let mut spent_scripts = Vec::with_capacity(tx.vin.len());
        let mut missing: Vec<Hash256> = Vec::new();
        {
            let mempool = self.mempool.lock();
            let mut utxo = self.utxo.write();
            for input in &tx.vin {
                if let Some(parent) = mempool.get(&input.prev_out.txid) {
                    let Some(out) = parent.tx.vout.get(input.prev_out.vout as usize) else {
                        return Err(Rejection::policy("input index out of range"));
                    };
                    // Created and valued at the same height: no interest
                    amounts.push(out.value);
                    spent_scripts.push(out.script_pubkey.clone());
                    continue;
                }
                match utxo.get_coin(&input.prev_out) {
                    Some(coin) if !coin.spent => {
                        if coin.coinbase
                            && next_height - coin.height < self.params.coinbase_maturity
                        {
                            return Err(Rejection::policy("premature spend of coinbase"));
                        }
                        amounts.push(value_with_interest(
                            coin.output.value,
                            i64::from(coin.height),
                            i64::from(next_height),
                        ));
                        spent_scripts.push(coin.output.script_pubkey);
                    }
                    _ => missing.push(input.prev_out.txid),
                }
            }
        }

        if !missing.is_empty() {
            if source == TxSource::Internal {
                // Resurrected or promoted transactions do not re-park
                return Err(Rejection::policy("missing inputs"));
            }
            let now = self.clock.unix_seconds();
            self.orphans.lock().add(tx, &missing, now);
            trace!("parked orphan {txid}");
            return Ok(AdmissionResult::Orphaned);
        }

        let value_in: Money = amounts.iter().sum();
        let value_out = tx.total_output_value();
        if !money_range(value_in) || value_in < value_out {
            return Err(Rejection::policy("insufficient input value"));
        }
        let fee = value_in - value_out;

        let size = tx.serialized_size() as u64;
        let fee_rate = FeeRate::from_fee(fee, size);
        let pool_floor = self.mempool.lock().min_fee_rate();
        let relay_floor = FeeRate(self.min_relay_fee_per_kb);
        if fee_rate < relay_floor {
            return Err(Rejection::policy("fee below relay minimum"));
        }
        if fee_rate < pool_floor {
            return Err(Rejection::policy("fee below pool minimum"));
        }

        self.check_output_policy(&tx)?;

        if tx_sigops(&tx) > MAX_TX_SIGOPS_COUNT {
            return Err(Rejection::policy("too many sigops"));
        }

        // Script verification outside every lock
        let mut sigchecks = 0u64;
        for (input_index, script_pubkey) in spent_scripts.iter().enumerate() {
            let checker = TransactionSignatureChecker {
                tx: &tx,
                input_index,
                amount: amounts[input_index],
            };
            let (ok, checks, err) = verify_script(
                &tx.vin[input_index].script_sig,
                script_pubkey,
                STANDARD_SCRIPT_VERIFY_FLAGS,
                &checker,
            );
            if !ok {
                debug!("script rejection for {txid} input {input_index}: {err:?}");
                return Err(Rejection::consensus("script evaluation failed"));
            }
            sigchecks += u64::from(checks);
            if sigchecks > MAX_TX_SIGCHECK_COUNT {
                return Err(Rejection::policy("too many sigchecks"));
            }
        }

        // Single serialized commit step
        let now = self.clock.unix_seconds();
        {
            let mut mempool = self.mempool.lock();
            if let Some((outpoint, existing)) = mempool.first_conflict(&tx) {
                drop(mempool);
                self.events.publish_double_spend(DoubleSpendSeen {
                    outpoint,
                    existing,
                    rejected: txid,
                });
                return Err(Rejection::policy("conflicts with pool transaction"));
            }
            mempool.add(tx.clone(), fee, now, next_height - 1, &self.limits)?;

            let evicted = mempool.evict_to_size(self.max_mempool_bytes);
            if evicted.iter().any(|entry| entry.txid == txid) {
                return Err(Rejection::policy("mempool full"));
            }
        }

        self.events.publish_tx_accepted(TxAcceptedEvent { txid });
        info!("accepted {txid} from {source:?} (fee {fee}, {size} bytes)");
        Ok(AdmissionResult::Accepted)
    }

    fn check_output_policy(&self, tx: &Transaction) -> Result<(), Rejection> {
        let dust = dust_threshold(self.min_relay_fee_per_kb);
        let mut data_carriers = 0usize;
        for out in &tx.vout {
            let script = out.script_pubkey.as_bytes();
            if !script.is_empty() && script[0] == OP_RETURN {
                data_carriers += 1;
                if data_carriers > 1 {
                    return Err(Rejection::policy("multiple data carrier outputs"));
                }
                if script.len() > MAX_OP_RETURN_RELAY {
                    return Err(Rejection::policy("data carrier payload too large"));
                }
                continue;
            }
            if out.value < dust {
                return Err(Rejection::policy("dust output"));
            }
        }
        Ok(())
    }

    fn promote_orphans(&self, accepted: Hash256) {
        let mut queue: VecDeque<Arc<Transaction>> =
            self.orphans.lock().take_waiting_on(&accepted).into();
        while let Some(orphan) = queue.pop_front() {
            let orphan_txid = orphan.txid();
            if self.admit_one(orphan, TxSource::Internal) == AdmissionResult::Accepted {
                debug!("promoted orphan {orphan_txid}");
                queue.extend(self.orphans.lock().take_waiting_on(&orphan_txid));
            }
        }
    }
}

/// Worker pool pulling from the intake queue.
pub struct AdmissionPool {
    tx_in: Sender<(Arc<Transaction>, TxSource)>,
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl AdmissionPool {
    pub fn start(admission: Arc<TxAdmission>, workers: usize) -> Self {
        let (tx_in, rx) = unbounded::<(Arc<Transaction>, TxSource)>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let rx: Receiver<(Arc<Transaction>, TxSource)> = rx.clone();
            let admission = admission.clone();
            let shutdown = shutdown.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("txadmission.{worker}"))
                    .spawn(move || loop {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        match rx.recv_timeout(Duration::from_millis(100)) {
                            Ok((tx, source)) => {
                                let _ = admission.admit(tx, source);
                            }
                            Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    })
                    .expect("spawn admission worker"),
            );
        }

        Self {
            tx_in,
            handles,
            shutdown,
        }
    }

    /// Enqueue for asynchronous admission.
    pub fn submit(&self, tx: Arc<Transaction>, source: TxSource) {
        let _ = self.tx_in.send((tx, source));
    }

    /// Signal workers and wait for them to drain.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
