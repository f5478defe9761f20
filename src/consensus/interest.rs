// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! The interest engine.
//!
//! Every unspent output compounds by `1 + 2^-22` per block between its
//! creation height and the height at which it is valued, capped at one year.
//! The rate table is fixed-point: `R[0] = 2^62` and
//! `R[i] = R[i-1] + (R[i-1] >> 22)`, so the accrued value of an output worth
//! `v` after `n` blocks is `v * R[n] / R[0]`, computed exactly in 256 bits.
//!
//! Every consensus site that reads an output's value (fee sums, the coinbase
//! subsidy check, sighash amounts, mempool fee rates) must go through
//! [`value_with_interest`]. A node whose table deviates in a single entry
//! would fork, so startup verifies a digest of the table's textual form and
//! refuses to run on mismatch.

use crate::consensus::Money;
use crate::primitives::murmur3_32;
use ibig::UBig;
use lazy_static::lazy_static;
use std::cmp;
use std::fmt::Write as _;

/// Blocks per day at the target spacing
pub const ONE_DAY: usize = 1108;

/// Interest stops compounding after one year's worth of blocks
pub const MAX_INTEREST_PERIOD: usize = ONE_DAY * 365;

/// Seed for the rate table digest
pub const RATE_TABLE_CHECK_SEED: u32 = 1989;

/// Digest of the rate table's textual form. Signed because the upstream
/// check compares the raw 32-bit hash as an int.
pub const RATE_TABLE_CHECK_HASH: i32 = -753_007_581;

lazy_static! {
    static ref RATE_TABLE: Vec<u64> = build_rate_table();
    static ref RATE_0: UBig = UBig::from(RATE_TABLE[0]);
}

fn build_rate_table() -> Vec<u64> {
    let mut table = Vec::with_capacity(MAX_INTEREST_PERIOD + 1);
    table.push(1u64 << 62);
    for i in 1..=MAX_INTEREST_PERIOD {
        let prev = table[i - 1];
        table.push(prev + (prev >> 22));
    }
    table
}

/// Interest accrued by `amount` over `periods` blocks. The product
/// `amount * R[periods]` is exact in 256 bits; the quotient fits 64.
#[must_use]
pub fn rate_for_amount(periods: usize, amount: Money) -> Money {
    debug_assert!(periods <= MAX_INTEREST_PERIOD);
    debug_assert!(amount >= 0);

    let product = UBig::from(amount as u64) * UBig::from(RATE_TABLE[periods]);
    let quotient = product / &*RATE_0;
    let low64 = u64::try_from(quotient & UBig::from(u64::MAX)).expect("masked to 64 bits");

    low64 as Money - amount
}

/// Value of an output created at `created_height`, valued at
/// `valuation_height`. Heights are signed: a negative height on either side
/// (and a valuation before creation) yields the unchanged value.
#[must_use]
pub fn value_with_interest(value: Money, created_height: i64, valuation_height: i64) -> Money {
    if created_height < 0 || valuation_height < 0 || valuation_height < created_height {
        return value;
    }

    let blocks = cmp::min(
        MAX_INTEREST_PERIOD,
        (valuation_height - created_height) as usize,
    );

    value + rate_for_amount(blocks, value)
}

/// The table's textual form that the digest pins: one `"{i} {rate:x}"` line
/// per entry, then one `"rate: {i} {interest}"` line per period for a
/// principal of 100 coins. Every node must produce these bytes exactly.
#[must_use]
pub fn rate_table_text() -> String {
    let principal: Money = 100 * crate::consensus::COIN;
    let mut text = String::with_capacity(MAX_INTEREST_PERIOD * 32);

    for (i, rate) in RATE_TABLE.iter().enumerate().skip(1) {
        let _ = writeln!(text, "{i} {rate:x}");
    }
    for i in 0..MAX_INTEREST_PERIOD {
        let _ = writeln!(text, "rate: {} {}", i, rate_for_amount(i, principal));
    }

    text
}

/// Consensus-critical reproducibility check, run once at startup. Returns
/// the digest so the caller can log it before aborting on mismatch.
#[must_use]
pub fn rate_table_digest() -> i32 {
    murmur3_32(RATE_TABLE_CHECK_SEED, rate_table_text().as_bytes()) as i32
}

#[must_use]
pub fn verify_rate_table() -> bool {
    rate_table_digest() == RATE_TABLE_CHECK_HASH
}
