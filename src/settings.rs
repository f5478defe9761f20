// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use config::{Config, ConfigError, Environment, File};
use lazy_static::lazy_static;
use log::error;
use serde::{Deserialize, Serialize};
use std::fs::{metadata, File as FsFile};
use std::io::Write;
use std::path::PathBuf;

lazy_static! {
    pub static ref SETTINGS: Settings = Settings::new().unwrap();
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Node settings.
    pub node: Node,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Node {
    /// Which chain to run: mainnet or regtest
    pub network_name: String,

    /// Data directory; empty means the platform default
    pub data_dir: String,

    /// Coin cache budget before a flush is forced, in megabytes
    pub coin_cache_mb: u64,

    /// Mempool budget in megabytes
    pub max_mempool_mb: u64,

    /// Pool transactions older than this many hours are dropped
    pub mempool_expiry_hours: u64,

    /// Orphans older than this many hours are dropped
    pub orphan_pool_expiry_hours: u64,

    /// Transaction admission worker threads; 0 = half the cores
    pub tx_admission_threads: u16,

    /// Parallel block validation slots; 0 = one per core, negative =
    /// leave that many cores free
    pub parallel_blocks: i16,

    /// Artificially slow script verification to exercise validation races
    pub pvtest: bool,

    /// Minimum relay fee rate, satoshis per kilobyte
    pub min_relay_fee: i64,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            network_name: "mainnet".to_owned(),
            data_dir: String::new(),
            coin_cache_mb: 300,
            max_mempool_mb: 300,
            mempool_expiry_hours: 72,
            orphan_pool_expiry_hours: 72,
            tx_admission_threads: 0,
            parallel_blocks: 0,
            pvtest: false,
            min_relay_fee: 1000,
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let mut config_path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        config_path.push("Membercoin");
        let _ = std::fs::create_dir_all(&config_path);
        config_path.push("config.toml");

        if metadata(&config_path).is_err() {
            let settings_str = toml::to_string_pretty(&Settings::default()).unwrap();
            match FsFile::create(&config_path) {
                Ok(mut file) => {
                    file.write_all(settings_str.as_bytes()).unwrap_or(());
                }
                Err(err) => {
                    // Fall back to defaults plus environment variables
                    error!("Failed to create configuration! Reason: {:#?}", err);
                }
            }
        }

        let defaults = Node::default();
        let s = Config::builder()
            .set_default("node.network_name", defaults.network_name)?
            .set_default("node.data_dir", defaults.data_dir)?
            .set_default("node.coin_cache_mb", defaults.coin_cache_mb)?
            .set_default("node.max_mempool_mb", defaults.max_mempool_mb)?
            .set_default("node.mempool_expiry_hours", defaults.mempool_expiry_hours)?
            .set_default(
                "node.orphan_pool_expiry_hours",
                defaults.orphan_pool_expiry_hours,
            )?
            .set_default("node.tx_admission_threads", i64::from(defaults.tx_admission_threads))?
            .set_default("node.parallel_blocks", i64::from(defaults.parallel_blocks))?
            .set_default("node.pvtest", defaults.pvtest)?
            .set_default("node.min_relay_fee", defaults.min_relay_fee)?
            .add_source(
                File::with_name(&config_path.to_string_lossy()).required(false),
            )
            .add_source(Environment::with_prefix("membercoin").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    /// Panic on nonsensical combinations before the node starts.
    pub fn validate(&self) {
        if !matches!(self.node.network_name.as_str(), "mainnet" | "regtest") {
            panic!("Invalid network name: {}", self.node.network_name);
        }
        if self.node.max_mempool_mb == 0 {
            panic!("max_mempool_mb must be positive");
        }
    }

    /// Resolved data directory for the configured network.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        let mut base = if self.node.data_dir.is_empty() {
            let mut dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
            dir.push("Membercoin");
            dir
        } else {
            PathBuf::from(&self.node.data_dir)
        };
        base.push(&self.node.network_name);
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let settings = Settings::default();
        settings.validate();
        assert_eq!(settings.node.network_name, "mainnet");
    }

    #[test]
    #[should_panic(expected = "Invalid network name")]
    fn bogus_network_panics() {
        let settings = Settings {
            node: Node {
                network_name: "purplenet".to_owned(),
                ..Default::default()
            },
        };
        settings.validate();
    }

    #[test]
    fn data_dir_ends_with_network() {
        let settings = Settings::default();
        assert!(settings.data_dir().ends_with("mainnet"));
    }
}
