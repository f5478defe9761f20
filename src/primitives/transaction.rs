// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::codec::{self, Decodable, DecodeError, Encodable, Reader};
use crate::consensus::{money_range, Money, MAX_TX_SIZE, MIN_TX_SIZE, SEQUENCE_FINAL};
use crate::primitives::{sha256d, Hash256};
use crate::vm::opcodes::{OP_0, OP_1, OP_16};
use crate::vm::Script;
use bincode::{Decode, Encode};
use std::collections::HashSet;

/// Reference to a single output of a single transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Encode, Decode)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    #[must_use]
    pub fn new(txid: Hash256, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// The prevout of a coinbase input
    #[must_use]
    pub fn null() -> Self {
        Self {
            txid: Hash256::zero(),
            vout: u32::MAX,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.vout == u32::MAX
    }
}

impl Encodable for OutPoint {
    fn consensus_encode(&self, w: &mut Vec<u8>) {
        self.txid.consensus_encode(w);
        self.vout.consensus_encode(w);
    }

    fn encoded_size(&self) -> usize {
        36
    }
}

impl Decodable for OutPoint {
    fn consensus_decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            txid: Hash256::consensus_decode(r)?,
            vout: u32::consensus_decode(r)?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct TxIn {
    pub prev_out: OutPoint,
    pub script_sig: Script,
    pub sequence: u32,
}

impl TxIn {
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.sequence == SEQUENCE_FINAL
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, w: &mut Vec<u8>) {
        self.prev_out.consensus_encode(w);
        self.script_sig.consensus_encode(w);
        self.sequence.consensus_encode(w);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            prev_out: OutPoint::consensus_decode(r)?,
            script_sig: Script::consensus_decode(r)?,
            sequence: u32::consensus_decode(r)?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct TxOut {
    pub value: Money,
    pub script_pubkey: Script,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, w: &mut Vec<u8>) {
        self.value.consensus_encode(w);
        self.script_pubkey.consensus_encode(w);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            value: Money::consensus_decode(r)?,
            script_pubkey: Script::consensus_decode(r)?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Double-SHA256 of the canonical serialization.
    #[must_use]
    pub fn txid(&self) -> Hash256 {
        sha256d(&codec::serialize(self))
    }

    #[must_use]
    pub fn serialized_size(&self) -> usize {
        self.encoded_size()
    }

    #[must_use]
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prev_out.is_null()
    }

    #[must_use]
    pub fn total_output_value(&self) -> Money {
        self.vout.iter().map(|o| o.value).sum()
    }

    /// A transaction is final when its lock time has passed or every input
    /// opted out. `block_time` is the median-time-past or block timestamp
    /// depending on the caller's flags.
    #[must_use]
    pub fn is_final(&self, block_height: i64, block_time: i64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let threshold = if self.lock_time < crate::consensus::LOCKTIME_THRESHOLD {
            block_height
        } else {
            block_time
        };
        if i64::from(self.lock_time) < threshold {
            return true;
        }
        self.vin.iter().all(TxIn::is_final)
    }

    /// Context-free validity: structure, sizes, money range, duplicate
    /// prevouts, coinbase shape.
    pub fn check(&self) -> Result<(), TxVerifyErr> {
        if self.vin.is_empty() {
            return Err(TxVerifyErr::NoInputs);
        }
        if self.vout.is_empty() {
            return Err(TxVerifyErr::NoOutputs);
        }
        if !matches!(self.version, 1 | 2) {
            return Err(TxVerifyErr::BadVersion);
        }

        let size = self.serialized_size();
        if size < MIN_TX_SIZE {
            return Err(TxVerifyErr::Undersized);
        }
        if size as u64 > MAX_TX_SIZE {
            return Err(TxVerifyErr::Oversized);
        }

        let mut total: Money = 0;
        for out in &self.vout {
            if !money_range(out.value) {
                return Err(TxVerifyErr::FailedMoneyCheck);
            }
            total += out.value;
            if !money_range(total) {
                return Err(TxVerifyErr::FailedMoneyCheck);
            }
        }

        let mut seen = HashSet::with_capacity(self.vin.len());
        for input in &self.vin {
            if !seen.insert(input.prev_out) {
                return Err(TxVerifyErr::DuplicateInputs);
            }
        }

        if self.is_coinbase() {
            let len = self.vin[0].script_sig.len();
            if !(2..=100).contains(&len) {
                return Err(TxVerifyErr::BadCoinbaseLength);
            }
        } else {
            for input in &self.vin {
                if input.prev_out.is_null() {
                    return Err(TxVerifyErr::NullPrevOut);
                }
            }
        }

        Ok(())
    }

    /// The block height committed in the coinbase unlocking script. The
    /// height is the script's first push: a bare small-int opcode or a
    /// length-prefixed little-endian number.
    pub fn coinbase_height(&self) -> Result<u64, TxVerifyErr> {
        if !self.is_coinbase() {
            return Err(TxVerifyErr::InvalidCoinbase);
        }
        let sig = self.vin[0].script_sig.as_bytes();
        if sig.is_empty() {
            return Err(TxVerifyErr::InvalidCoinbase);
        }

        let numlen = sig[0];
        if numlen == OP_0 {
            return Ok(0);
        }
        if (OP_1..=OP_16).contains(&numlen) {
            return Ok(u64::from(numlen - OP_1 + 1));
        }
        let numlen = usize::from(numlen);
        if numlen > 8 || sig.len() - 1 < numlen {
            return Err(TxVerifyErr::InvalidCoinbase);
        }

        let mut height: u64 = 0;
        for (i, byte) in sig[1..=numlen].iter().enumerate() {
            height |= u64::from(*byte) << (8 * i);
        }
        // Strip a plain sign byte; negative heights never validate anyway
        if sig[numlen] & 0x80 != 0 {
            height &= !(0x80u64 << (8 * (numlen - 1)));
        }
        Ok(height)
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, w: &mut Vec<u8>) {
        self.version.consensus_encode(w);
        codec::write_seq(w, &self.vin);
        codec::write_seq(w, &self.vout);
        self.lock_time.consensus_encode(w);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: i32::consensus_decode(r)?,
            vin: codec::read_seq(r)?,
            vout: codec::read_seq(r)?,
            lock_time: u32::consensus_decode(r)?,
        })
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum TxVerifyErr {
    NoInputs,
    NoOutputs,
    BadVersion,
    Undersized,
    Oversized,
    FailedMoneyCheck,
    DuplicateInputs,
    NullPrevOut,
    BadCoinbaseLength,
    InvalidCoinbase,
    MissingInput,
    InputNotFound,
    CoinbaseSpentBeforeMaturity,
    InvalidAmount,
    FeeOutOfRange,
    InvalidScriptExecution,
    TooManySigOps,
    TooManySigChecks,
    NonFinal,
}


#[cfg(test)]
mod tests {
    use super::test_util::{coinbase_tx, spend_tx};
    use super::*;
    use crate::consensus::{COIN, MAX_MONEY};

    #[test]
    fn outpoint_null_detection() {
        assert!(OutPoint::null().is_null());
        assert!(!OutPoint::new(sha256d(b"x"), 0).is_null());
        assert!(!OutPoint::new(Hash256::zero(), 0).is_null());
    }

    #[test]
    fn transaction_codec_roundtrip() {
        let tx = spend_tx(OutPoint::new(sha256d(b"prev"), 3), 7 * COIN);
        let bytes = codec::serialize(&tx);
        let decoded: Transaction = codec::deserialize(&bytes).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(codec::serialize(&decoded), bytes);
        assert_eq!(decoded.txid(), tx.txid());
    }

    #[test]
    fn txid_commits_to_all_fields() {
        let tx = spend_tx(OutPoint::new(sha256d(b"prev"), 0), COIN);
        let mut other = tx.clone();
        other.lock_time = 1;
        assert_ne!(tx.txid(), other.txid());
    }

    #[test]
    fn decode_truncated_tx_fails() {
        let tx = spend_tx(OutPoint::new(sha256d(b"prev"), 0), COIN);
        let bytes = codec::serialize(&tx);
        for cut in [0, 1, bytes.len() / 2, bytes.len() - 1] {
            assert!(codec::deserialize::<Transaction>(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn check_rejects_structural_problems() {
        let base = spend_tx(OutPoint::new(sha256d(b"prev"), 0), COIN);
        assert_eq!(base.check(), Ok(()));

        let mut tx = base.clone();
        tx.vin.clear();
        assert_eq!(tx.check(), Err(TxVerifyErr::NoInputs));

        let mut tx = base.clone();
        tx.vout.clear();
        assert_eq!(tx.check(), Err(TxVerifyErr::NoOutputs));

        let mut tx = base.clone();
        tx.version = 3;
        assert_eq!(tx.check(), Err(TxVerifyErr::BadVersion));

        let mut tx = base.clone();
        tx.vout[0].value = MAX_MONEY + 1;
        assert_eq!(tx.check(), Err(TxVerifyErr::FailedMoneyCheck));

        let mut tx = base.clone();
        tx.vout[0].value = -1;
        assert_eq!(tx.check(), Err(TxVerifyErr::FailedMoneyCheck));

        // Two outputs summing past the cap
        let mut tx = base.clone();
        tx.vout[0].value = MAX_MONEY;
        tx.vout.push(TxOut {
            value: 1,
            script_pubkey: Script::new(),
        });
        assert_eq!(tx.check(), Err(TxVerifyErr::FailedMoneyCheck));

        let mut tx = base.clone();
        tx.vin.push(tx.vin[0].clone());
        assert_eq!(tx.check(), Err(TxVerifyErr::DuplicateInputs));

        let mut tx = base;
        tx.vin[0].script_sig = Script::new();
        assert_eq!(tx.check(), Err(TxVerifyErr::Undersized));
    }

    #[test]
    fn check_rejects_null_prevout_on_non_coinbase() {
        let mut tx = spend_tx(OutPoint::new(sha256d(b"prev"), 0), COIN);
        tx.vin.push(TxIn {
            prev_out: OutPoint::null(),
            script_sig: Script::new(),
            sequence: SEQUENCE_FINAL,
        });
        assert_eq!(tx.check(), Err(TxVerifyErr::NullPrevOut));
    }

    #[test]
    fn coinbase_height_roundtrip() {
        for height in [0u64, 1, 16, 17, 255, 256, 500_000, 10_000_000] {
            let tx = coinbase_tx(height, 50 * COIN);
            assert!(tx.is_coinbase());
            assert_eq!(tx.check(), Ok(()));
            assert_eq!(tx.coinbase_height().unwrap(), height);
        }
    }

    #[test]
    fn coinbase_height_on_spend_fails() {
        let tx = spend_tx(OutPoint::new(sha256d(b"prev"), 0), COIN);
        assert_eq!(tx.coinbase_height(), Err(TxVerifyErr::InvalidCoinbase));
    }

    #[test]
    fn finality() {
        let mut tx = spend_tx(OutPoint::new(sha256d(b"prev"), 0), COIN);
        assert!(tx.is_final(0, 0));

        tx.lock_time = 100;
        tx.vin[0].sequence = 0;
        assert!(!tx.is_final(100, 0));
        assert!(tx.is_final(101, 0));

        // All-final sequences override the lock time
        tx.vin[0].sequence = SEQUENCE_FINAL;
        assert!(tx.is_final(100, 0));
    }
}
