// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! # Membercoin
//! Official implementation of the Membercoin consensus core.
//!
//! Membercoin is a proof-of-work UTXO currency with two departures from the
//! Bitcoin lineage it descends from:
//!
//! * **BLAKE3 block identity**: the network-visible block hash is BLAKE3 of
//!   the 80-byte header. The double-SHA256 of the same bytes (the *mid hash*)
//!   is kept for internal maps and merkle plumbing.
//! * **Per-block interest**: every unspent output accrues compound interest of
//!   `1 + 2^-22` per block between its creation height and the height at which
//!   it is valued, capped at one year (404,420 blocks). All consensus value
//!   reads (fee sums, the coinbase subsidy check, sighash amounts, mempool fee
//!   rates) go through the interest engine.
//!
//! This crate contains the consensus core only: the canonical codec, hashing
//! and proof-of-work math, the interest engine, the script VM, the layered
//! UTXO store, the block index and validation engine, the transaction
//! admission pipeline, and the parallel block validation orchestrator. RPC
//! transports, the wallet, and peer discovery live in surrounding crates and
//! talk to the core through the `Node` handle in [`node`].

pub mod chain;
pub mod codec;
pub mod coins;
pub mod consensus;
pub mod mempool;
pub mod node;
pub mod primitives;
pub mod settings;
pub mod sync;
pub mod vm;
