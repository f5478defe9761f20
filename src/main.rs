// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use log::*;
use membercoin::chain::{FileBlockStore, SystemClock};
use membercoin::coins::{open_node_db, RocksDbUtxoStore};
use membercoin::consensus::{self, Params};
use membercoin::node::{load_block_index, save_block_index, Node, NodeConfig, ShutdownSignal};
use membercoin::settings::SETTINGS;

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::prelude::*;

#[cfg(not(windows))]
use signal_hook::consts::TERM_SIGNALS;
#[cfg(not(windows))]
use signal_hook::flag;

fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let shutdown = ShutdownSignal::new();

    #[cfg(not(windows))]
    for sig in TERM_SIGNALS {
        // A second term signal exits immediately with code 1; the first one
        // only arms the graceful path.
        flag::register_conditional_shutdown(*sig, 1, shutdown.flag())?;
        flag::register(*sig, shutdown.flag())?;
    }

    perform_sanity_checks();
    run_node(shutdown)
}

fn run_node(shutdown: ShutdownSignal) -> anyhow::Result<()> {
    SETTINGS.validate();
    let params = match SETTINGS.node.network_name.as_str() {
        "mainnet" => Params::mainnet(),
        "regtest" => Params::regtest(),
        other => panic!("Invalid network name: {other}"),
    };

    let verifier_threads = num_cpus::get();
    rayon::ThreadPoolBuilder::new()
        .num_threads(verifier_threads)
        .build_global()
        .unwrap();

    let data_dir = SETTINGS.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    info!(
        "Running Membercoin Core v{} on {} in {}",
        env!("CARGO_PKG_VERSION"),
        params.network_name,
        data_dir.display()
    );

    let db = open_node_db(data_dir.join("chainstate"))
        .map_err(|err| anyhow::anyhow!("cannot open chainstate database: {err:?}"))?;
    let utxo_store = Arc::new(RocksDbUtxoStore::new(db.clone()));
    let block_store = Arc::new(
        FileBlockStore::open(data_dir.join("blocks"), params.magic)
            .map_err(|err| anyhow::anyhow!("cannot open block files: {err:?}"))?,
    );
    let index = load_block_index(&db)
        .map_err(|err| anyhow::anyhow!("cannot load block index: {err:?}"))?;
    info!("loaded {} block index entries", index.len());

    let mut config = NodeConfig::new(params);
    config.tx_admission_threads = if SETTINGS.node.tx_admission_threads == 0 {
        (num_cpus::get() / 2).max(1)
    } else {
        usize::from(SETTINGS.node.tx_admission_threads)
    };
    config.parallel_blocks = i32::from(SETTINGS.node.parallel_blocks);
    config.pvtest = SETTINGS.node.pvtest;
    config.min_relay_fee_per_kb = SETTINGS.node.min_relay_fee;
    config.max_mempool_bytes = SETTINGS.node.max_mempool_mb * 1024 * 1024;
    config.mempool_expiry_secs = SETTINGS.node.mempool_expiry_hours as i64 * 3600;
    config.orphan_expiry_secs = SETTINGS.node.orphan_pool_expiry_hours as i64 * 3600;
    config.coin_cache_max_bytes = (SETTINGS.node.coin_cache_mb * 1024 * 1024) as usize;

    let node = Arc::new(
        Node::new(
            config,
            Arc::new(SystemClock),
            utxo_store,
            block_store,
            index,
            shutdown.clone(),
        )
        .map_err(|err| anyhow::anyhow!("node bootstrap failed: {err:?}"))?,
    );
    node.start_admission_workers();

    let scheduler_node = node.clone();
    let scheduler = thread::spawn(move || {
        scheduler_node.run_scheduler(Duration::from_secs(1));
    });

    // Block here until a termination signal arrives
    loop {
        if shutdown.requested() {
            break;
        }
        thread::sleep(Duration::from_millis(200));
    }
    info!(
        "Membercoin Core v{} shutting down...",
        env!("CARGO_PKG_VERSION")
    );

    scheduler.join().unwrap();
    node.stop();
    {
        let chain = node.chain.lock();
        let index = chain.index.read();
        save_block_index(&db, &index)
            .map_err(|err| anyhow::anyhow!("cannot persist block index: {err:?}"))?;
    }

    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::filter::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| anyhow::anyhow!("tracing init failed: {err}"))?;

    Ok(())
}

fn perform_sanity_checks() {
    // The interest table must be bit-identical across every node. A
    // mismatch means a fork, so refuse to start.
    info!("Verifying interest rate table...");
    let digest = consensus::rate_table_digest();
    info!("Rate table digest: {digest}");
    if !consensus::verify_rate_table() {
        error!(
            "Interest rate table digest mismatch! Got {digest}, expected {}",
            consensus::RATE_TABLE_CHECK_HASH
        );
        std::process::abort();
    }
    info!("Rate table verification passed!");

    // Add here more sanity checks
}
