// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Signature hash computation.
//!
//! Two schemes coexist: the legacy scheme inherited from the original chain,
//! and the FORKID scheme which commits to the spent amount. The amount a
//! FORKID signature commits to is the *interest-adjusted* value of the spent
//! coin at the validation height, so a signature cannot be replayed at a
//! height where the coin is worth something else.

use crate::codec::{self, Encodable};
use crate::consensus::Money;
use crate::primitives::{sha256d, Hash256, Transaction, TxOut};
use crate::vm::Script;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_FORKID: u32 = 0x40;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

const BASE_TYPE_MASK: u32 = 0x1f;

#[must_use]
pub fn base_type(hash_type: u32) -> u32 {
    hash_type & BASE_TYPE_MASK
}

#[must_use]
pub fn has_forkid(hash_type: u32) -> bool {
    hash_type & SIGHASH_FORKID != 0
}

#[must_use]
pub fn has_anyonecanpay(hash_type: u32) -> bool {
    hash_type & SIGHASH_ANYONECANPAY != 0
}

/// Defined base types only; undefined bits outside FORKID/ANYONECANPAY are
/// rejected by strict encoding.
#[must_use]
pub fn is_defined_hash_type(hash_type: u32) -> bool {
    let base = base_type(hash_type);
    (SIGHASH_ALL..=SIGHASH_SINGLE).contains(&base)
        && hash_type & !(BASE_TYPE_MASK | SIGHASH_FORKID | SIGHASH_ANYONECANPAY) == 0
}

/// The digest a CHECKSIG-family signature signs.
#[must_use]
pub fn signature_hash(
    script_code: &Script,
    tx: &Transaction,
    input_index: usize,
    hash_type: u32,
    amount: Money,
    forkid_enabled: bool,
) -> Hash256 {
    debug_assert!(input_index < tx.vin.len());
    if forkid_enabled && has_forkid(hash_type) {
        forkid_signature_hash(script_code, tx, input_index, hash_type, amount)
    } else {
        legacy_signature_hash(script_code, tx, input_index, hash_type)
    }
}

fn forkid_signature_hash(
    script_code: &Script,
    tx: &Transaction,
    input_index: usize,
    hash_type: u32,
    amount: Money,
) -> Hash256 {
    let base = base_type(hash_type);
    let acp = has_anyonecanpay(hash_type);

    let hash_prevouts = if acp {
        Hash256::zero()
    } else {
        let mut buf = Vec::with_capacity(36 * tx.vin.len());
        for input in &tx.vin {
            input.prev_out.consensus_encode(&mut buf);
        }
        sha256d(&buf)
    };

    let hash_sequence = if acp || base == SIGHASH_NONE || base == SIGHASH_SINGLE {
        Hash256::zero()
    } else {
        let mut buf = Vec::with_capacity(4 * tx.vin.len());
        for input in &tx.vin {
            input.sequence.consensus_encode(&mut buf);
        }
        sha256d(&buf)
    };

    let hash_outputs = match base {
        SIGHASH_NONE => Hash256::zero(),
        SIGHASH_SINGLE => {
            if input_index < tx.vout.len() {
                sha256d(&codec::serialize(&tx.vout[input_index]))
            } else {
                Hash256::zero()
            }
        }
        _ => {
            let mut buf = Vec::new();
            for out in &tx.vout {
                out.consensus_encode(&mut buf);
            }
            sha256d(&buf)
        }
    };

    let mut preimage = Vec::with_capacity(200 + script_code.len());
    tx.version.consensus_encode(&mut preimage);
    hash_prevouts.consensus_encode(&mut preimage);
    hash_sequence.consensus_encode(&mut preimage);
    tx.vin[input_index].prev_out.consensus_encode(&mut preimage);
    script_code.consensus_encode(&mut preimage);
    amount.consensus_encode(&mut preimage);
    tx.vin[input_index].sequence.consensus_encode(&mut preimage);
    hash_outputs.consensus_encode(&mut preimage);
    tx.lock_time.consensus_encode(&mut preimage);
    hash_type.consensus_encode(&mut preimage);

    sha256d(&preimage)
}

fn legacy_signature_hash(
    script_code: &Script,
    tx: &Transaction,
    input_index: usize,
    hash_type: u32,
) -> Hash256 {
    let base = base_type(hash_type);

    // The historical out-of-range SINGLE quirk: the digest is the number one
    if base == SIGHASH_SINGLE && input_index >= tx.vout.len() {
        let mut one = [0u8; 32];
        one[0] = 1;
        return Hash256(one);
    }

    let acp = has_anyonecanpay(hash_type);
    let mut modified = tx.clone();

    if acp {
        let mut input = modified.vin[input_index].clone();
        input.script_sig = script_code.clone();
        modified.vin = vec![input];
    } else {
        for (i, input) in modified.vin.iter_mut().enumerate() {
            input.script_sig = if i == input_index {
                script_code.clone()
            } else {
                Script::new()
            };
            if i != input_index && (base == SIGHASH_NONE || base == SIGHASH_SINGLE) {
                input.sequence = 0;
            }
        }
    }

    match base {
        SIGHASH_NONE => modified.vout.clear(),
        SIGHASH_SINGLE => {
            modified.vout.truncate(input_index + 1);
            for out in modified.vout.iter_mut().take(input_index) {
                *out = TxOut {
                    value: -1,
                    script_pubkey: Script::new(),
                };
            }
        }
        _ => {}
    }

    let mut preimage = codec::serialize(&modified);
    hash_type.consensus_encode(&mut preimage);
    sha256d(&preimage)
}
