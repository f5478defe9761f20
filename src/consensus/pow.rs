// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Target compaction and work arithmetic.
//!
//! The proof-of-work identity of a block is the BLAKE3 hash of its 80-byte
//! header, interpreted as a little-endian 256-bit integer and compared
//! against the target expanded from the header's compact `bits`.

use crate::consensus::Params;
use crate::primitives::Hash256;
use bincode::{Decode, Encode};
use ibig::UBig;
use std::fmt;
use std::ops::Add;

/// Cumulative chain work as a 256-bit big-endian integer. Big-endian keeps
/// `Ord` on the byte array equal to numeric order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Default)]
pub struct ChainWork(pub [u8; 32]);

impl ChainWork {
    #[must_use]
    pub fn zero() -> Self {
        Self([0; 32])
    }

    #[must_use]
    pub fn from_ubig(value: &UBig) -> Self {
        let bytes = value.to_be_bytes();
        debug_assert!(bytes.len() <= 32);
        let mut out = [0; 32];
        out[32 - bytes.len()..].copy_from_slice(&bytes);
        Self(out)
    }

    #[must_use]
    pub fn to_ubig(&self) -> UBig {
        UBig::from_be_bytes(&self.0)
    }
}

impl Add for ChainWork {
    type Output = ChainWork;

    fn add(self, other: ChainWork) -> ChainWork {
        ChainWork::from_ubig(&(self.to_ubig() + other.to_ubig()))
    }
}

impl fmt::Debug for ChainWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChainWork").field(&hex::encode(self.0)).finish()
    }
}

/// Expanded compact target. `negative` and `overflow` are invalid as
/// proof-of-work but must be distinguished from a plain zero target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedTarget {
    pub target: UBig,
    pub negative: bool,
    pub overflow: bool,
}

/// Expand a compact `bits` value: exponent in the high byte, three mantissa
/// bytes, base-256 scientific notation.
#[must_use]
pub fn expand_compact(bits: u32) -> ExpandedTarget {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;
    let target = if exponent <= 3 {
        UBig::from(mantissa >> (8 * (3 - exponent)))
    } else {
        UBig::from(mantissa) << (8 * (exponent - 3))
    };
    let negative = mantissa != 0 && (bits & 0x0080_0000) != 0;
    let overflow = mantissa != 0
        && (exponent > 34
            || (mantissa > 0xff && exponent > 33)
            || (mantissa > 0xffff && exponent > 32));

    ExpandedTarget {
        target,
        negative,
        overflow,
    }
}

/// Pack a target back into compact form. Inverse of `expand_compact` for
/// non-negative, non-overflowing inputs.
#[must_use]
pub fn compact_from_target(target: &UBig) -> u32 {
    let mut size = (target.bit_len() + 7) / 8;
    let mut compact: u32 = if size <= 3 {
        let low = u64::try_from(target.clone()).expect("target fits 3 bytes");
        (low << (8 * (3 - size))) as u32
    } else {
        let shifted: UBig = target.clone() >> (8 * (size - 3));
        u64::try_from(shifted).expect("shifted target fits 3 bytes") as u32
    };

    // The mantissa sign bit is not available for magnitude
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }

    compact | ((size as u32) << 24)
}

/// Expand `bits` into a usable target, rejecting negative, overflowing, zero,
/// and above-limit encodings.
#[must_use]
pub fn target_from_bits(bits: u32, params: &Params) -> Option<UBig> {
    let expanded = expand_compact(bits);
    if expanded.negative || expanded.overflow || expanded.target == UBig::from(0u8) {
        return None;
    }
    let limit = expand_compact(params.pow_limit_bits).target;
    if expanded.target > limit {
        return None;
    }
    Some(expanded.target)
}

/// `blake3(header80) <= target` as 256-bit little-endian integers.
#[must_use]
pub fn check_proof_of_work(block_hash: &Hash256, bits: u32, params: &Params) -> bool {
    let Some(target) = target_from_bits(bits, params) else {
        return false;
    };
    UBig::from_le_bytes(&block_hash.0) <= target
}

/// Work contributed by a block: `2^256 / (target + 1)`.
#[must_use]
pub fn block_work(bits: u32) -> ChainWork {
    let expanded = expand_compact(bits);
    if expanded.negative || expanded.overflow || expanded.target == UBig::from(0u8) {
        return ChainWork::zero();
    }
    let numerator = UBig::from(1u8) << 256;
    ChainWork::from_ubig(&(numerator / (expanded.target + UBig::from(1u8))))
}

/// Difficulty adjustment: scale the previous target by the ratio of the
/// observed window timespan to the expected one, clamped to a factor of 4
/// either way, and never above the chain's limit.
#[must_use]
pub fn next_work_required(
    last_bits: u32,
    first_block_time: i64,
    last_block_time: i64,
    params: &Params,
) -> u32 {
    if params.no_retargeting {
        return last_bits;
    }

    let target_timespan = params.target_timespan();
    let mut timespan = last_block_time - first_block_time;
    timespan = timespan.clamp(target_timespan / 4, target_timespan * 4);

    let limit = expand_compact(params.pow_limit_bits).target;
    let old_target = expand_compact(last_bits).target;
    let mut new_target =
        old_target * UBig::from(timespan as u64) / UBig::from(target_timespan as u64);

    if new_target > limit {
        new_target = limit;
    }

    compact_from_target(&new_target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::blake3_256;

    #[test]
    fn expand_compact_known_values() {
        // Standard Satoshi launch target
        let expanded = expand_compact(0x1d00_ffff);
        assert!(!expanded.negative);
        assert!(!expanded.overflow);
        assert_eq!(expanded.target, UBig::from(0xffffu32) << 208);

        // Regtest limit
        let expanded = expand_compact(0x207f_ffff);
        assert!(!expanded.negative);
        assert!(!expanded.overflow);
        assert_eq!(expanded.target, UBig::from(0x007f_ffffu32) << 232);
    }

    #[test]
    fn expand_compact_zero_mantissa_is_zero() {
        for bits in [0u32, 0x0080_0000, 0x0123_4500 & 0xff00_0000] {
            let expanded = expand_compact(bits);
            assert_eq!(expanded.target, UBig::from(0u8));
            assert!(!expanded.negative);
            assert!(!expanded.overflow);
        }
    }

    #[test]
    fn expand_compact_flags() {
        assert!(expand_compact(0x01fe_dcba).negative);
        assert!(!expand_compact(0x01fe_dcba).overflow);
        assert!(expand_compact(0xff12_3456).overflow);
        assert!(expand_compact(0x2201_0000).overflow);
    }

    #[test]
    fn compact_roundtrip() {
        for bits in [0x1d00_ffffu32, 0x207f_ffff, 0x1b04_04cb, 0x1801_0000] {
            let expanded = expand_compact(bits);
            assert_eq!(compact_from_target(&expanded.target), bits);
        }
    }

    #[test]
    fn regtest_block_work_is_two() {
        // target+1 = 2^255, so each regtest block contributes exactly 2 units
        let work = block_work(0x207f_ffff);
        assert_eq!(work.to_ubig(), UBig::from(2u8));
    }

    #[test]
    fn chain_work_accumulates_and_orders() {
        let one = block_work(0x207f_ffff);
        let two = one + one;
        assert!(two > one);
        assert_eq!(two.to_ubig(), UBig::from(4u8));
        assert!(block_work(0x1d00_ffff) > block_work(0x207f_ffff));
    }

    #[test]
    fn invalid_bits_fail_pow() {
        let params = Params::regtest();
        let hash = blake3_256(b"anything");
        assert!(!check_proof_of_work(&hash, 0, &params));
        assert!(!check_proof_of_work(&hash, 0x01fe_dcba, &params));
        assert!(!check_proof_of_work(&hash, 0xff12_3456, &params));
    }

    #[test]
    fn easy_hash_passes_regtest_pow() {
        let params = Params::regtest();
        // A hash whose little-endian value is tiny
        let mut bytes = [0u8; 32];
        bytes[0] = 1;
        assert!(check_proof_of_work(&Hash256(bytes), params.pow_limit_bits, &params));

        // All-ones is above any target
        assert!(!check_proof_of_work(&Hash256([0xff; 32]), params.pow_limit_bits, &params));
    }

    #[test]
    fn retarget_clamps_and_caps() {
        let params = Params::mainnet();
        let spacing = params.target_timespan();

        // On-schedule window keeps the target
        let bits = next_work_required(0x1c10_0000, 0, spacing, &params);
        assert_eq!(bits, 0x1c10_0000);

        // A 100x-slow window is clamped to 4x easier
        let slow = next_work_required(0x1c10_0000, 0, spacing * 100, &params);
        assert_eq!(slow, 0x1c40_0000);

        // A 100x-fast window is clamped to 4x harder
        let fast = next_work_required(0x1c10_0000, 0, spacing / 100, &params);
        assert_eq!(fast, 0x1c04_0000);

        // Never above the chain limit
        let capped = next_work_required(params.pow_limit_bits, 0, spacing * 4, &params);
        assert_eq!(capped, params.pow_limit_bits);
    }

    #[test]
    fn no_retargeting_on_regtest() {
        let params = Params::regtest();
        assert_eq!(next_work_required(0x207f_ffff, 0, 1, &params), 0x207f_ffff);
    }
}
