// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! In-memory DAG of block headers.
//!
//! Entries live in an arena and refer to each other by `u32` id; the hash map
//! resolves 32-byte identities to ids. Every entry carries a skip pointer to
//! a far ancestor so that `ancestor()` and `find_fork()` are logarithmic.

use crate::chain::store::DiskPos;
use crate::chain::WallClock;
use crate::codec;
use crate::consensus::{
    block_work, check_proof_of_work, next_work_required, ChainWork, Params, MAX_FUTURE_BLOCK_TIME,
    MEDIAN_TIME_SPAN,
};
use crate::primitives::{BlockHeader, BlockLocator, Hash256};
use bincode::{Decode, Encode};
use log::debug;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};

pub const STATUS_HAVE_DATA: u32 = 0x01;
pub const STATUS_HAVE_UNDO: u32 = 0x02;
pub const STATUS_VALID_HEADER: u32 = 0x04;
pub const STATUS_VALID_TX: u32 = 0x08;
pub const STATUS_VALID_SCRIPTS: u32 = 0x10;
pub const STATUS_VALID_CHAIN: u32 = 0x20;
pub const STATUS_FAILED: u32 = 0x40;
pub const STATUS_FAILED_PARENT: u32 = 0x80;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Encode, Decode)]
pub struct BlockStatus(pub u32);

impl BlockStatus {
    #[must_use]
    pub fn has(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }

    pub fn clear(&mut self, flag: u32) {
        self.0 &= !flag;
    }

    /// This block or one of its ancestors failed validation
    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.has(STATUS_FAILED | STATUS_FAILED_PARENT)
    }
}

#[derive(Clone, Debug, Encode, Decode)]
pub struct BlockIndexEntry {
    pub header: BlockHeader,
    pub hash: Hash256,
    pub height: u32,
    pub chain_work: ChainWork,
    pub status: BlockStatus,
    pub parent: Option<u32>,
    pub skip: Option<u32>,
    pub block_pos: Option<DiskPos>,
    pub undo_pos: Option<DiskPos>,
    /// Arrival order; the tie break between equal-work candidate tips
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderErr {
    UnknownParent,
    ParentInvalid,
    BadVersion,
    /// Hash does not satisfy the target in `bits`
    HighHash,
    /// `bits` disagrees with the difficulty adjustment rule
    BadDiffBits,
    /// Timestamp at or below the median of the previous eleven
    TimeTooOld,
    /// Timestamp more than two hours in the future
    TimeTooNew,
    GenesisAlreadySet,
}

/// Candidate ordering key: best = greatest work, then earliest arrival.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
struct CandidateKey(ChainWork, Reverse<u64>, u32);

pub struct BlockIndex {
    entries: Vec<BlockIndexEntry>,
    by_hash: HashMap<Hash256, u32>,
    candidates: BTreeSet<CandidateKey>,
    next_sequence: u64,
}

impl BlockIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            by_hash: HashMap::new(),
            candidates: BTreeSet::new(),
            next_sequence: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entry(&self, id: u32) -> &BlockIndexEntry {
        &self.entries[id as usize]
    }

    pub fn entry_mut(&mut self, id: u32) -> &mut BlockIndexEntry {
        &mut self.entries[id as usize]
    }

    #[must_use]
    pub fn id_by_hash(&self, hash: &Hash256) -> Option<u32> {
        self.by_hash.get(hash).copied()
    }

    #[must_use]
    pub fn lookup(&self, hash: &Hash256) -> Option<&BlockIndexEntry> {
        self.id_by_hash(hash).map(|id| self.entry(id))
    }

    /// Seed the index with the trusted genesis header. Never PoW-checked.
    pub fn init_genesis(&mut self, header: BlockHeader) -> Result<u32, HeaderErr> {
        if !self.entries.is_empty() {
            return Err(HeaderErr::GenesisAlreadySet);
        }
        let hash = header.hash();
        let mut status = BlockStatus::default();
        status.set(
            STATUS_VALID_HEADER | STATUS_VALID_TX | STATUS_VALID_SCRIPTS | STATUS_VALID_CHAIN,
        );
        let entry = BlockIndexEntry {
            chain_work: block_work(header.bits),
            header,
            hash,
            height: 0,
            status,
            parent: None,
            skip: None,
            block_pos: None,
            undo_pos: None,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.entries.push(entry);
        self.by_hash.insert(hash, 0);
        self.candidates.insert(CandidateKey(
            self.entries[0].chain_work,
            Reverse(self.entries[0].sequence),
            0,
        ));
        Ok(0)
    }

    /// Validate a header against its parent chain and link it in. Inserting
    /// a known header is a no-op returning the existing id.
    pub fn insert_header(
        &mut self,
        header: BlockHeader,
        params: &Params,
        clock: &dyn WallClock,
    ) -> Result<u32, HeaderErr> {
        let hash = header.hash();
        if let Some(id) = self.by_hash.get(&hash) {
            return Ok(*id);
        }

        if !BlockHeader::version_known(header.version, 0) {
            return Err(HeaderErr::BadVersion);
        }

        let parent_id = self
            .id_by_hash(&header.prev_hash)
            .ok_or(HeaderErr::UnknownParent)?;
        if self.entry(parent_id).status.is_invalid() {
            return Err(HeaderErr::ParentInvalid);
        }

        if !check_proof_of_work(&hash, header.bits, params) {
            return Err(HeaderErr::HighHash);
        }
        if header.bits != self.expected_bits(parent_id, params) {
            return Err(HeaderErr::BadDiffBits);
        }
        if header.block_time() <= self.median_time_past(parent_id) {
            return Err(HeaderErr::TimeTooOld);
        }
        if header.block_time() > clock.unix_seconds() + MAX_FUTURE_BLOCK_TIME {
            return Err(HeaderErr::TimeTooNew);
        }

        let parent = self.entry(parent_id).clone();
        let id = self.entries.len() as u32;
        let height = parent.height + 1;
        let mut status = BlockStatus::default();
        status.set(STATUS_VALID_HEADER);
        let entry = BlockIndexEntry {
            chain_work: parent.chain_work + block_work(header.bits),
            header,
            hash,
            height,
            status,
            parent: Some(parent_id),
            skip: self.ancestor(parent_id, skip_height(i64::from(height)) as u32),
            block_pos: None,
            undo_pos: None,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.entries.push(entry);
        self.by_hash.insert(hash, id);

        // The parent stopped being a tip the moment it got a child
        self.candidates
            .remove(&CandidateKey(parent.chain_work, Reverse(parent.sequence), parent_id));
        self.candidates.insert(CandidateKey(
            self.entries[id as usize].chain_work,
            Reverse(self.entries[id as usize].sequence),
            id,
        ));

        debug!("indexed header {hash} at height {height}");
        Ok(id)
    }

    /// Best non-invalid candidate tip, by (work, arrival).
    #[must_use]
    pub fn best_candidate(&self) -> Option<u32> {
        self.candidates
            .iter()
            .rev()
            .map(|key| key.2)
            .find(|id| !self.entry(*id).status.is_invalid())
    }

    /// All candidate tips whose work equals or exceeds `work`, best first.
    #[must_use]
    pub fn candidates_at_or_above(&self, work: ChainWork) -> Vec<u32> {
        self.candidates
            .iter()
            .rev()
            .filter(|key| key.0 >= work)
            .map(|key| key.2)
            .filter(|id| !self.entry(*id).status.is_invalid())
            .collect()
    }

    /// Drop candidates that can no longer win against `work`.
    pub fn prune_candidates_below(&mut self, work: ChainWork, keep: u32) {
        let stale: Vec<CandidateKey> = self
            .candidates
            .iter()
            .filter(|key| key.0 < work && key.2 != keep)
            .copied()
            .collect();
        for key in stale {
            self.candidates.remove(&key);
        }
    }

    /// Put a tip back into the candidate set (used after a reorg abandons
    /// part of a branch).
    pub fn reinstate_candidate(&mut self, id: u32) {
        let (work, sequence) = {
            let entry = self.entry(id);
            (entry.chain_work, entry.sequence)
        };
        self.candidates.insert(CandidateKey(work, Reverse(sequence), id));
    }

    /// Ancestor of `id` at `height`, following skip pointers.
    #[must_use]
    pub fn ancestor(&self, id: u32, height: u32) -> Option<u32> {
        let entry = self.entry(id);
        if height > entry.height {
            return None;
        }

        let mut walk = id;
        let mut height_walk = i64::from(entry.height);
        let target = i64::from(height);
        while height_walk > target {
            let current = self.entry(walk);
            let height_skip = skip_height(height_walk);
            let height_skip_prev = skip_height(height_walk - 1);
            match current.skip {
                Some(skip)
                    if height_skip == target
                        || (height_skip > target
                            && !(height_skip_prev < height_skip - 2
                                && height_skip_prev >= target)) =>
                {
                    walk = skip;
                    height_walk = height_skip;
                }
                _ => {
                    walk = current.parent?;
                    height_walk -= 1;
                }
            }
        }
        Some(walk)
    }

    /// Lowest common ancestor of two entries.
    #[must_use]
    pub fn find_fork(&self, a: u32, b: u32) -> u32 {
        let (mut a, mut b) = (a, b);
        let height = self.entry(a).height.min(self.entry(b).height);
        a = self.ancestor(a, height).expect("height clamped");
        b = self.ancestor(b, height).expect("height clamped");
        while a != b {
            let (pa, pb) = (self.entry(a).parent, self.entry(b).parent);
            match (pa, pb) {
                (Some(pa), Some(pb)) => {
                    a = pa;
                    b = pb;
                }
                _ => break,
            }
        }
        a
    }

    /// Hashes at exponentially increasing distances back from `id`.
    #[must_use]
    pub fn locator(&self, id: u32) -> BlockLocator {
        let mut have = Vec::with_capacity(32);
        let mut step = 1u32;
        let mut current = Some(id);
        while let Some(walk) = current {
            let entry = self.entry(walk);
            have.push(entry.hash);
            if entry.height == 0 {
                break;
            }
            if have.len() > 10 {
                step = step.saturating_mul(2);
            }
            let next_height = entry.height.saturating_sub(step);
            current = self.ancestor(walk, next_height);
        }
        BlockLocator { have }
    }

    /// Timestamps' median over the entry and its ten predecessors.
    #[must_use]
    pub fn median_time_past(&self, id: u32) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut current = Some(id);
        for _ in 0..MEDIAN_TIME_SPAN {
            let Some(walk) = current else { break };
            let entry = self.entry(walk);
            times.push(entry.header.block_time());
            current = entry.parent;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// The `bits` the difficulty rule demands of the parent's next child.
    #[must_use]
    pub fn expected_bits(&self, parent_id: u32, params: &Params) -> u32 {
        let parent = self.entry(parent_id);
        if params.no_retargeting {
            return parent.header.bits;
        }
        if parent.height + 1 < params.retarget_window {
            return params.pow_limit_bits;
        }
        let first_id = self
            .ancestor(parent_id, parent.height - (params.retarget_window - 1))
            .expect("window within chain");
        let first = self.entry(first_id);
        next_work_required(
            parent.header.bits,
            first.header.block_time(),
            parent.header.block_time(),
            params,
        )
    }

    /// Walk from `tip` down to height 0, newest first.
    #[must_use]
    pub fn chain_to_genesis(&self, tip: u32) -> Vec<u32> {
        let mut path = Vec::new();
        let mut current = Some(tip);
        while let Some(id) = current {
            path.push(id);
            current = self.entry(id).parent;
        }
        path
    }

    /// Mark an entry failed and all indexed descendants failed-parent. The
    /// entries stay in the index so the branch is never re-downloaded.
    pub fn mark_failed(&mut self, id: u32) {
        self.entry_mut(id).status.set(STATUS_FAILED);
        self.entry_mut(id).status.clear(STATUS_VALID_CHAIN);
        let mut failed: HashSet<u32> = HashSet::new();
        failed.insert(id);
        // Arena ids are topological (parents precede children)
        for child in (id as usize + 1)..self.entries.len() {
            if let Some(parent) = self.entries[child].parent {
                if failed.contains(&parent) {
                    self.entries[child].status.set(STATUS_FAILED_PARENT);
                    self.entries[child].status.clear(STATUS_VALID_CHAIN);
                    failed.insert(child as u32);
                }
            }
        }
    }

    /// Serialize every entry for persistence, keyed by arena id.
    #[must_use]
    pub fn to_records(&self) -> Vec<(u32, Vec<u8>)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(id, entry)| {
                let record = codec::storage_encode_to_vec(entry)
                    .expect("block index entries always encode");
                (id as u32, record)
            })
            .collect()
    }

    /// Rebuild from persisted records. Records must be complete and ids
    /// contiguous; candidates are recomputed as the set of non-invalid tips.
    pub fn from_records(mut records: Vec<(u32, Vec<u8>)>) -> Result<Self, &'static str> {
        records.sort_by_key(|(id, _)| *id);
        let mut entries = Vec::with_capacity(records.len());
        for (expected_id, (id, bytes)) in records.iter().enumerate() {
            if *id as usize != expected_id {
                return Err("gap in block index records");
            }
            let entry: BlockIndexEntry =
                codec::storage_decode(bytes).map_err(|_| "undecodable block index record")?;
            entries.push(entry);
        }

        let mut by_hash = HashMap::with_capacity(entries.len());
        let mut has_child: HashSet<u32> = HashSet::new();
        let mut next_sequence = 0u64;
        for (id, entry) in entries.iter().enumerate() {
            by_hash.insert(entry.hash, id as u32);
            if let Some(parent) = entry.parent {
                has_child.insert(parent);
            }
            next_sequence = next_sequence.max(entry.sequence + 1);
        }

        let mut candidates = BTreeSet::new();
        for (id, entry) in entries.iter().enumerate() {
            if !has_child.contains(&(id as u32)) && !entry.status.is_invalid() {
                candidates.insert(CandidateKey(entry.chain_work, Reverse(entry.sequence), id as u32));
            }
        }

        Ok(Self {
            entries,
            by_hash,
            candidates,
            next_sequence,
        })
    }
}

impl Default for BlockIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn the lowest set bit of `n` off.
fn invert_lowest_one(n: i64) -> i64 {
    n & (n - 1)
}

/// Height to jump back to from `height`; chosen so ancestor walks take
/// O(log n) hops.
#[must_use]
pub fn skip_height(height: i64) -> i64 {
    if height < 2 {
        return 0;
    }
    if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::chain::MockClock;

    /// Extend the chain with a mined header on top of `parent_hash`. The
    /// merkle root is salted with the index size so sibling headers built
    /// back to back stay distinct.
    pub fn mine_header(
        index: &mut BlockIndex,
        parent_hash: Hash256,
        params: &Params,
        clock: &MockClock,
    ) -> (u32, BlockHeader) {
        let parent_id = index.id_by_hash(&parent_hash).unwrap();
        let bits = index.expected_bits(parent_id, params);
        let mut seed = parent_hash.as_bytes().to_vec();
        seed.extend_from_slice(&(index.len() as u32).to_le_bytes());
        let mut header = BlockHeader {
            version: 2,
            prev_hash: parent_hash,
            merkle_root: crate::primitives::sha256d(&seed),
            time: (index.median_time_past(parent_id) + 1) as u32,
            bits,
            nonce: 0,
        };
        loop {
            if check_proof_of_work(&header.hash(), header.bits, params) {
                break;
            }
            header.nonce += 1;
        }
        let id = index.insert_header(header, params, clock).unwrap();
        (id, header)
    }
}
