// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Parallel block validation.
//!
//! Competing candidate tips of equal work race: every candidate gets its own
//! overlay and worker, workers poll a stop flag at input loops and between
//! script batches, and the first to finish takes the chain lock and commits.
//! The chain lock makes commits mutually exclusive, so at most one candidate
//! per height ever lands; losers drop their overlays.

use crate::chain::{
    connect_block, contextual_check_block, ChainState, ConnectOpts, Rejection, RejectionKind,
    STATUS_HAVE_DATA,
};
use crate::coins::CoinsOverlay;
use crate::primitives::Hash256;
use crate::sync::OrderedMutex;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct ParallelValidator {
    slots: usize,
    /// Artificial per-batch script delay; exercises the race paths in tests
    /// and the pvtest mode
    pvtest_delay: Option<Duration>,
}

impl ParallelValidator {
    /// `configured` follows the historical knob: positive = that many
    /// workers, zero = one per core, negative = leave that many cores free.
    #[must_use]
    pub fn new(configured: i32, pvtest_delay: Option<Duration>) -> Self {
        let cores = num_cpus::get() as i32;
        let slots = match configured {
            0 => cores,
            n if n > 0 => n,
            n => (cores + n).max(1),
        };
        Self {
            slots: slots as usize,
            pvtest_delay,
        }
    }

    #[must_use]
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Race every data-complete candidate that extends the current tip.
    /// Returns the winning block hash if any candidate committed. Any
    /// remaining higher-work chains (deeper reorgs) are settled through the
    /// regular activation path afterwards.
    pub fn validate_candidates(
        &self,
        chain: &Arc<OrderedMutex<ChainState>>,
    ) -> Result<Option<Hash256>, Rejection> {
        let (tip_id, candidates, utxo, block_store, params, mtp) = {
            let chain_ref = chain.lock();
            let index = chain_ref.index.read();
            let tip_id = chain_ref.tip_id();
            let tip_work = index.entry(tip_id).chain_work;

            let mut list = Vec::new();
            for id in index.candidates_at_or_above(tip_work) {
                let entry = index.entry(id);
                if entry.parent == Some(tip_id)
                    && entry.status.has(STATUS_HAVE_DATA)
                    && entry.chain_work > tip_work
                {
                    list.push((id, entry.height, entry.block_pos.expect("has data")));
                }
            }
            (
                tip_id,
                list,
                chain_ref.utxo.clone(),
                chain_ref.block_store.clone(),
                chain_ref.params.clone(),
                index.median_time_past(tip_id),
            )
        };

        let mut candidates = candidates;
        candidates.truncate(self.slots);
        if candidates.is_empty() {
            // Nothing to race; fall through to the ordinary reorg driver
            chain.lock().activate_best_chain(None)?;
            return Ok(None);
        }

        let stop_flags: Vec<Arc<AtomicBool>> = candidates
            .iter()
            .map(|_| Arc::new(AtomicBool::new(false)))
            .collect();
        let winner: Mutex<Option<Hash256>> = Mutex::new(None);

        std::thread::scope(|scope| {
            for (slot, (id, height, pos)) in candidates.iter().copied().enumerate() {
                let stop = stop_flags[slot].clone();
                let all_flags = &stop_flags;
                let winner = &winner;
                let utxo = &utxo;
                let block_store = &block_store;
                let params = &params;
                let chain = chain.clone();
                let pvtest_delay = self.pvtest_delay;

                scope.spawn(move || {
                    let block = match block_store.read_block(pos) {
                        Ok(block) => block,
                        Err(err) => {
                            warn!("candidate read failed: {err:?}");
                            return;
                        }
                    };
                    let block_hash = block.hash();

                    if let Err(rejection) = contextual_check_block(&block, height, mtp, params) {
                        chain.lock().index.write().mark_failed(id);
                        debug!("candidate {block_hash} rejected: {}", rejection.detail);
                        return;
                    }

                    let mut overlay = CoinsOverlay::new(utxo);
                    let opts = ConnectOpts {
                        check_scripts: true,
                        stop: Some(stop),
                        pvtest_delay,
                    };
                    match connect_block(&block, height, &mut overlay, params, &opts) {
                        Ok((undo, _stats)) => {
                            let mut chain_ref = chain.lock();
                            match chain_ref.commit_raced_candidate(id, tip_id, overlay, &undo) {
                                Ok(true) => {
                                    *winner.lock() = Some(block_hash);
                                    // The common ancestor moved; losers stop
                                    // at their next cancellation point
                                    for flag in all_flags {
                                        flag.store(true, Ordering::Relaxed);
                                    }
                                }
                                Ok(false) => {
                                    debug!("candidate {block_hash} lost the commit race");
                                }
                                Err(rejection) => {
                                    warn!(
                                        "candidate {block_hash} commit failed: {}",
                                        rejection.detail
                                    );
                                }
                            }
                        }
                        Err(rejection) if rejection.kind == RejectionKind::Consensus => {
                            overlay.discard();
                            chain.lock().index.write().mark_failed(id);
                            debug!("candidate {block_hash} invalid: {}", rejection.detail);
                        }
                        Err(_) => {
                            // Interrupted: the winner already extended the
                            // chain, or shutdown is in progress
                            overlay.discard();
                            debug!("candidate {block_hash} validation interrupted");
                        }
                    }
                });
            }
        });

        // Settle anything the race did not resolve (deeper reorgs, fresh
        // arrivals) and prune stale candidates.
        chain.lock().activate_best_chain(None)?;
        let result = *winner.lock();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::chain_test_util::{build_block, harness, mine_chain};
    use crate::chain::STATUS_VALID_CHAIN;
    use crate::sync::RANK_CHAIN;

    fn race_harness() -> (Arc<OrderedMutex<ChainState>>, Vec<crate::primitives::Block>) {
        let mut h = harness();
        mine_chain(&mut h.state, 1);
        let tip_hash = h.state.tip_entry().hash;

        // Two sibling candidates with identical work, distinguished only
        // by their header time.
        let c1 = build_block(&h.state, tip_hash, vec![]);
        let mut c2 = build_block(&h.state, tip_hash, vec![]);
        c2.header.time += 1;
        c2.header.nonce = 0;
        while !crate::consensus::check_proof_of_work(
            &c2.hash(),
            c2.header.bits,
            &h.state.params,
        ) {
            c2.header.nonce += 1;
        }
        assert_ne!(c1.hash(), c2.hash());

        let chain = Arc::new(OrderedMutex::new(RANK_CHAIN, "chain", h.state));
        {
            let mut chain_ref = chain.lock();
            chain_ref.stage_block(&c1).unwrap();
            chain_ref.stage_block(&c2).unwrap();
        }
        (chain, vec![c1, c2])
    }

    #[test]
    fn exactly_one_sibling_wins_the_race() {
        let (chain, siblings) = race_harness();
        let validator = ParallelValidator::new(2, None);
        let winner = validator.validate_candidates(&chain).unwrap().unwrap();

        assert!(siblings.iter().any(|b| b.hash() == winner));
        let chain_ref = chain.lock();
        assert_eq!(chain_ref.tip_entry().hash, winner);
        assert_eq!(chain_ref.tip_entry().height, 2);

        // The loser is still a known, non-invalid candidate
        let loser = siblings.iter().find(|b| b.hash() != winner).unwrap();
        let index = chain_ref.index.read();
        let entry = index.lookup(&loser.hash()).unwrap();
        assert!(!entry.status.is_invalid());
        assert!(!entry.status.has(STATUS_VALID_CHAIN));
    }

    #[test]
    fn race_with_pvtest_delay_still_single_commit() {
        let (chain, siblings) = race_harness();
        let validator = ParallelValidator::new(2, Some(Duration::from_millis(20)));
        let winner = validator.validate_candidates(&chain).unwrap().unwrap();

        assert!(siblings.iter().any(|b| b.hash() == winner));
        assert_eq!(chain.lock().tip_entry().height, 2);
    }

    #[test]
    fn heavier_arrival_supersedes_race_winner() {
        let (chain, siblings) = race_harness();
        let validator = ParallelValidator::new(2, None);
        let winner = validator.validate_candidates(&chain).unwrap().unwrap();

        // Extend the losing sibling; its branch now has more work than the
        // active tip and must take over through the normal driver.
        let loser = siblings.iter().find(|b| b.hash() != winner).unwrap();
        let d = {
            let chain_ref = chain.lock();
            build_block(&chain_ref, loser.hash(), vec![])
        };
        chain.lock().submit_block(&d).unwrap();

        let chain_ref = chain.lock();
        assert_eq!(chain_ref.tip_entry().hash, d.hash());
        assert_eq!(chain_ref.tip_entry().height, 3);
    }

    #[test]
    fn no_candidates_is_a_quiet_noop() {
        let h = harness();
        let chain = Arc::new(OrderedMutex::new(RANK_CHAIN, "chain", h.state));
        let validator = ParallelValidator::new(1, None);
        assert_eq!(validator.validate_candidates(&chain).unwrap(), None);
    }

    #[test]
    fn slot_resolution_from_config() {
        let cores = num_cpus::get();
        assert_eq!(ParallelValidator::new(3, None).slots(), 3);
        assert_eq!(ParallelValidator::new(0, None).slots(), cores);
        assert!(ParallelValidator::new(-1024, None).slots() >= 1);
    }
}
