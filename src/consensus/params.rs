// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use static_assertions::const_assert_eq;
use std::cmp;

/// Money type, in satoshis.
pub type Money = i64;

/// Satoshis per coin.
pub const COIN: Money = 100_000_000;
pub const CENT: Money = 1_000_000;

/// No amount larger than this is valid. This is a sanity bound used by
/// consensus-critical validation code, not the circulating supply; the
/// interest rule means the supply is not a fixed function of height.
pub const MAX_MONEY: Money = 1_000_000_000 * COIN;

/// Money check
#[must_use]
pub fn money_range(amount: Money) -> bool {
    (0..=MAX_MONEY).contains(&amount)
}

pub const ONE_MEGABYTE: u64 = 1_000_000;

/// Maximum signature operations per megabyte of block, rounded up (network rule)
pub const MAX_BLOCK_SIGOPS_PER_MB: u64 = 20_000;

/// Maximum signature operations in a single transaction (network rule)
pub const MAX_TX_SIGOPS_COUNT: u64 = 20_000;

/// Maximum executed signature checks in a single transaction (network rule)
pub const MAX_TX_SIGCHECK_COUNT: u64 = 3_000;

/// The ratio between the maximum allowable block size and the maximum
/// allowable executed signature checks in the block (network rule)
pub const BLOCK_MAXBYTES_MAXSIGCHECKS_RATIO: u64 = 141;

/// Default maximum accepted block size in bytes
pub const DEFAULT_EXCESSIVE_BLOCK_SIZE: u64 = 32 * ONE_MEGABYTE;

pub const MAX_BLOCK_SIGCHECK_COUNT: u64 =
    DEFAULT_EXCESSIVE_BLOCK_SIZE / BLOCK_MAXBYTES_MAXSIGCHECKS_RATIO;
const_assert_eq!(MAX_BLOCK_SIGCHECK_COUNT, 226_950);

/// The minimum allowed size for a serialized transaction, in bytes
pub const MIN_TX_SIZE: usize = 100;

/// The maximum suggested length of a serialized transaction
pub const MAX_TX_SIZE: u64 = ONE_MEGABYTE;

/// Coinbase outputs can only be spent after this number of new blocks
/// (network rule). Note: 20 on this chain, not the more common 100.
pub const COINBASE_MATURITY: u32 = 20;

/// New blocks with timestamps more than this many seconds in the future are
/// rejected
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;

/// Timestamps must be greater than the median of the last `n` blocks
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Maximum relayed data carrier payload in an OP_RETURN output
pub const MAX_OP_RETURN_RELAY: usize = 223;

/// Minimum bytes to create and later spend a UTXO (34 output + 148 input).
/// Used in the dust calculation.
pub const TYPICAL_UTXO_LIFECYCLE_SIZE: usize = 148 + 34;

/// Lock times below this are block heights, above are unix timestamps
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// An input with this sequence is final
pub const SEQUENCE_FINAL: u32 = 0xFFFF_FFFF;

/// Initial block reward
pub const INITIAL_BLOCK_REWARD: Money = 50 * COIN;

/// Reward is halved after `n` blocks
pub const HALVING_INTERVAL: u64 = 210_000;

/// Compute the maximum sigops allowed in a block given the block size
#[must_use]
pub fn max_block_sigops(block_size: u64) -> u64 {
    let mb_rounded_up = 1 + block_size.saturating_sub(1) / ONE_MEGABYTE;
    mb_rounded_up * MAX_BLOCK_SIGOPS_PER_MB
}

/// Compute the maximum number of executed sigchecks in a block given the
/// maximum block size. Scales linearly with the maximum, not the actual,
/// block size; the fractional part is meaningless and rounded down.
#[must_use]
pub fn max_block_sigchecks(max_block_size: u64) -> u64 {
    max_block_size / BLOCK_MAXBYTES_MAXSIGCHECKS_RATIO
}

/// Get block reward at height, before fees and interest
#[must_use]
pub fn block_subsidy(height: u32) -> Money {
    let halvings = u64::from(height) / HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_BLOCK_REWARD >> halvings
}

/// Consensus parameters of a chain instance.
#[derive(Clone, Debug)]
pub struct Params {
    pub network_name: &'static str,

    /// Block file framing marker
    pub magic: [u8; 4],

    /// Highest (easiest) admissible target, in compact form
    pub pow_limit_bits: u32,

    /// Desired seconds between blocks (1108 blocks per day)
    pub target_spacing: i64,

    /// Blocks per difficulty measurement window
    pub retarget_window: u32,

    /// Regtest: keep the parent's bits for every block
    pub no_retargeting: bool,

    pub coinbase_maturity: u32,
    pub excessive_block_size: u64,

    /// Height at which coinbase scripts must commit to the block height
    pub bip34_height: u32,

    /// Height from which transactions after the coinbase must appear in
    /// ascending txid order
    pub canonical_tx_order_height: u32,

    /// Fixed timestamp and nonce of the genesis block
    pub genesis_time: u32,
    pub genesis_nonce: u32,
}

impl Params {
    #[must_use]
    pub fn mainnet() -> Self {
        Self {
            network_name: "mainnet",
            magic: [0xf9, 0xbe, 0xbc, 0xd4],
            pow_limit_bits: 0x1d00_ffff,
            target_spacing: 78,
            retarget_window: 144,
            no_retargeting: false,
            coinbase_maturity: COINBASE_MATURITY,
            excessive_block_size: DEFAULT_EXCESSIVE_BLOCK_SIZE,
            bip34_height: 0,
            canonical_tx_order_height: 0,
            genesis_time: 1_624_555_000,
            genesis_nonce: 2_083_236_893,
        }
    }

    #[must_use]
    pub fn regtest() -> Self {
        Self {
            network_name: "regtest",
            magic: [0xfa, 0xbf, 0xb5, 0xda],
            pow_limit_bits: 0x207f_ffff,
            target_spacing: 78,
            retarget_window: 144,
            no_retargeting: true,
            coinbase_maturity: COINBASE_MATURITY,
            excessive_block_size: DEFAULT_EXCESSIVE_BLOCK_SIZE,
            bip34_height: 0,
            canonical_tx_order_height: 0,
            genesis_time: 1_624_555_000,
            genesis_nonce: 0,
        }
    }

    /// Timespan the retarget window is expected to take.
    #[must_use]
    pub fn target_timespan(&self) -> i64 {
        self.target_spacing * i64::from(self.retarget_window)
    }

    #[must_use]
    pub fn max_block_sigchecks(&self) -> u64 {
        max_block_sigchecks(self.excessive_block_size)
    }
}

/// Dust is too small to be worth spending. Proportional to the cost of the
/// output's whole lifecycle at the given feerate (satoshis per kB).
#[must_use]
pub fn dust_threshold(relay_fee_per_kb: Money) -> Money {
    let lifecycle_fee =
        relay_fee_per_kb * (TYPICAL_UTXO_LIFECYCLE_SIZE as Money) / 1000;
    cmp::max(3 * lifecycle_fee, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_money_checks() {
        assert!(!money_range(-1));
        assert!(money_range(0));
        assert!(money_range(1));
        assert!(money_range(MAX_MONEY));
        assert!(!money_range(MAX_MONEY + 1));
    }

    #[test]
    fn it_maps_height_to_block_subsidy() {
        assert_eq!(block_subsidy(0), INITIAL_BLOCK_REWARD);
        assert_eq!(block_subsidy(HALVING_INTERVAL as u32 - 1), INITIAL_BLOCK_REWARD);
        assert_eq!(block_subsidy(HALVING_INTERVAL as u32), INITIAL_BLOCK_REWARD / 2);
        assert_eq!(block_subsidy(HALVING_INTERVAL as u32 * 3), INITIAL_BLOCK_REWARD / 8);
    }

    #[test]
    fn block_sigop_budget_rounds_up_per_megabyte() {
        assert_eq!(max_block_sigops(1), MAX_BLOCK_SIGOPS_PER_MB);
        assert_eq!(max_block_sigops(ONE_MEGABYTE), MAX_BLOCK_SIGOPS_PER_MB);
        assert_eq!(max_block_sigops(ONE_MEGABYTE + 1), 2 * MAX_BLOCK_SIGOPS_PER_MB);
        assert_eq!(
            max_block_sigops(DEFAULT_EXCESSIVE_BLOCK_SIZE),
            32 * MAX_BLOCK_SIGOPS_PER_MB
        );
    }

    #[test]
    fn block_sigcheck_budget_scales_with_max_size() {
        assert_eq!(max_block_sigchecks(DEFAULT_EXCESSIVE_BLOCK_SIZE), 226_950);
        assert_eq!(max_block_sigchecks(ONE_MEGABYTE), 7_092);
    }

    #[test]
    fn dust_tracks_relay_fee() {
        assert_eq!(dust_threshold(1000), 546);
        assert!(dust_threshold(0) > 0);
    }
}
