// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

mod index;
mod store;
mod validation;

pub use index::*;
pub use store::*;
pub use validation::*;

#[cfg(test)]
pub(crate) use validation::test_util as chain_test_util;

use crate::consensus::Params;
use crate::primitives::{Block, BlockHeader, Hash256};
use crate::vm::opcodes::OP_1;
use crate::vm::Script;
use crate::primitives::{OutPoint, Transaction, TxIn, TxOut};

/// The genesis block is fixed by parameters and trusted by definition; its
/// header is never proof-of-work checked.
#[must_use]
pub fn genesis_block(params: &Params) -> Block {
    let mut script_sig = Script::new();
    script_sig.push_int(0);
    script_sig.push_slice(b"The beginning of an interest bearing chain");
    let mut script_pubkey = Script::new();
    script_pubkey.push_opcode(OP_1);

    let coinbase = Transaction {
        version: 2,
        vin: vec![TxIn {
            prev_out: OutPoint::null(),
            script_sig,
            sequence: crate::consensus::SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: crate::consensus::INITIAL_BLOCK_REWARD,
            script_pubkey,
        }],
        lock_time: 0,
    };

    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_hash: Hash256::zero(),
            merkle_root: Hash256::zero(),
            time: params.genesis_time,
            bits: params.pow_limit_bits,
            nonce: params.genesis_nonce,
        },
        txs: vec![coinbase],
    };
    block.header.merkle_root = block.compute_merkle_root();
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_is_deterministic_and_well_formed() {
        let params = Params::regtest();
        let a = genesis_block(&params);
        let b = genesis_block(&params);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.header.prev_hash, Hash256::zero());
        assert!(a.txs[0].is_coinbase());
        assert_eq!(a.txs[0].check(), Ok(()));
        assert_eq!(a.header.merkle_root, a.compute_merkle_root());
        assert_eq!(a.txs[0].coinbase_height().unwrap(), 0);
    }
}
