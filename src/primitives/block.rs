// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::codec::{self, Decodable, DecodeError, Encodable, Reader};
use crate::primitives::{blake3_256, sha256d, Hash256, Transaction};
use bincode::{Decode, Encode};

pub const BIP_009_MASK: u32 = 0x2000_0000;
pub const BASE_VERSION: u32 = 0x2000_0000;

/// The expected size of a serialized block header
pub const SERIALIZED_HEADER_SIZE: usize = 80;

/// Nodes collect new transactions into a block, hash them into a hash tree,
/// and scan through nonce values to make the block's hash satisfy
/// proof-of-work requirements. The hash that carries the proof of work is
/// BLAKE3 of the serialized header; the double-SHA256 of the same bytes (the
/// mid hash) survives as the key of a few internal maps.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Encode, Decode)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// The network-visible block identity: BLAKE3 of the 80 header bytes.
    #[must_use]
    pub fn hash(&self) -> Hash256 {
        blake3_256(&codec::serialize(self))
    }

    /// Double-SHA256 of the same 80 bytes.
    #[must_use]
    pub fn mid_hash(&self) -> Hash256 {
        sha256d(&codec::serialize(self))
    }

    #[must_use]
    pub fn block_time(&self) -> i64 {
        i64::from(self.time)
    }

    /// Known versions: the original 1 through 4, or a BIP009 versionbits
    /// pattern whose set bits are all recognized votes.
    #[must_use]
    pub fn version_known(version: i32, vote_bits: i32) -> bool {
        if (1..=4).contains(&version) {
            return true;
        }
        let v = version as u32;
        if v & BIP_009_MASK != 0 {
            let votes = v & !BIP_009_MASK;
            return votes & !(vote_bits as u32) == 0;
        }
        false
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, w: &mut Vec<u8>) {
        self.version.consensus_encode(w);
        self.prev_hash.consensus_encode(w);
        self.merkle_root.consensus_encode(w);
        self.time.consensus_encode(w);
        self.bits.consensus_encode(w);
        self.nonce.consensus_encode(w);
    }

    fn encoded_size(&self) -> usize {
        SERIALIZED_HEADER_SIZE
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: i32::consensus_decode(r)?,
            prev_hash: Hash256::consensus_decode(r)?,
            merkle_root: Hash256::consensus_decode(r)?,
            time: u32::consensus_decode(r)?,
            bits: u32::consensus_decode(r)?,
            nonce: u32::consensus_decode(r)?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
}

impl Block {
    #[must_use]
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Serialized block size in bytes
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        self.encoded_size()
    }

    /// Merkle root over the txids, Satoshi-style: the last node of an odd
    /// layer is paired with itself.
    #[must_use]
    pub fn compute_merkle_root(&self) -> Hash256 {
        merkle_root(self.txs.iter().map(Transaction::txid).collect())
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, w: &mut Vec<u8>) {
        self.header.consensus_encode(w);
        codec::write_seq(w, &self.txs);
    }
}

impl Decodable for Block {
    fn consensus_decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            header: BlockHeader::consensus_decode(r)?,
            txs: codec::read_seq(r)?,
        })
    }
}

#[must_use]
pub fn merkle_root(mut layer: Vec<Hash256>) -> Hash256 {
    if layer.is_empty() {
        return Hash256::zero();
    }

    let mut buf = [0u8; 64];
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len() / 2 + 1);
        for pair in layer.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            buf[..32].copy_from_slice(&left.0);
            buf[32..].copy_from_slice(&right.0);
            next.push(sha256d(&buf));
        }
        layer = next;
    }
    layer[0]
}

/// Describes a place in the block chain to another node such that if the
/// other node doesn't have the same branch, it can find a recent common
/// trunk.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct BlockLocator {
    pub have: Vec<Hash256>,
}

impl BlockLocator {
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.have.is_empty()
    }
}

impl Encodable for BlockLocator {
    fn consensus_encode(&self, w: &mut Vec<u8>) {
        codec::write_seq(w, &self.have);
    }
}

impl Decodable for BlockLocator {
    fn consensus_decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            have: codec::read_seq(r)?,
        })
    }
}
