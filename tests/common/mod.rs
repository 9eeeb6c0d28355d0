//! Shared helpers for integration tests: ephemeral-port configurations
//! and scratch data directories.

#![allow(dead_code)]

use meshcore::config::{Config, ListenMode};
use std::path::PathBuf;

/// A config with every listener on an ephemeral port, heavyweight
/// subsystems off by default, and a private scratch directory.
pub fn test_config(name: &str) -> Config {
    let mut config = Config::default();
    config.data_dir = scratch_dir(name);
    config.p2p.listen_port = 0;
    config.p2p.listen_mode = ListenMode::Ipv4;
    config.p2p.preflight_timeout = 3.0;
    config.p2p.connection_timeout = 5.0;
    config.dht.port = 0;
    config.dht.rpc_timeout = 1.0;
    config.dht.rpc_retries = 2;
    config.dht.lookup_timeout = 3.0;
    config.dht.bootstrap_timeout = 5.0;
    config.hole_punch.enabled = false;
    config.relay.enabled = false;
    config.gossip.enabled = false;
    config
}

pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("meshcore_test_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

pub fn cleanup(config: &Config) {
    let _ = std::fs::remove_dir_all(&config.data_dir);
}
