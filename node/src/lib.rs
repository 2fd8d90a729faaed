//! Chordal DHT Node Library
//!
//! This library provides the ring-maintenance and routing engine of a
//! Chord-style distributed hash table: successor list and finger table
//! upkeep, stabilize/rectify, lookup, join/leave, and the key-ownership
//! rule the storage layer is built on. It can be used both as a standalone
//! binary and as a library for integration testing.

macro_rules! log_info {
    ($address:expr, $($arg:tt)*) => ({
        log::info!("[{}] {}", $address, format_args!($($arg)*));
    })
}

macro_rules! log_warn {
    ($address:expr, $($arg:tt)*) => ({
        log::warn!("[{}] {}", $address, format_args!($($arg)*));
    })
}

macro_rules! log_error {
    ($address:expr, $($arg:tt)*) => ({
        log::error!("[{}] {}", $address, format_args!($($arg)*));
    })
}

macro_rules! log_debug {
    ($address:expr, $($arg:tt)*) => ({
        log::debug!("[{}] {}", $address, format_args!($($arg)*));
    })
}

pub mod api;
pub mod events;
pub mod maintenance;
pub mod membership;
pub mod network_client;
pub mod node;
pub mod routing;
pub mod storage;

use std::str::FromStr;
use std::time::Duration;

pub use events::RingEvent;
pub use network_client::{NetworkClient, RealNetworkClient};
pub use node::{ChordNode, NodeInfo, M};
pub use storage::spawn_key_migration;

// Re-export from lib crate for convenience
pub use chordal_lib::{ChordError, DhtMessage, Entry, NodeId, Result};

pub const DEFAULT_SUCCESSOR_LIST_LEN: usize = 3;

/// Configuration for a ChordNode
#[derive(Debug, Clone)]
pub struct Config {
    /// Address advertised to peers; its hash is the node id.
    pub p2p_address: String,
    pub bind_address: String,
    /// Port for the HTTP status API, disabled when absent.
    pub api_port: Option<u16>,
    pub bootstrap_address: Option<String>,
    /// Successor list length `r`.
    pub successor_list_len: usize,
    pub maintenance_interval: Duration,
    pub rpc_timeout: Duration,
    pub rpc_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            p2p_address: "127.0.0.1:8000".to_string(),
            bind_address: "127.0.0.1:8000".to_string(),
            api_port: None,
            bootstrap_address: None,
            successor_list_len: DEFAULT_SUCCESSOR_LIST_LEN,
            maintenance_interval: Duration::from_millis(1000),
            rpc_timeout: Duration::from_millis(2000),
            rpc_retries: 1,
        }
    }
}

impl Config {
    /// Reads the configuration from `NODE_ADDRESS`, `BIND_ADDRESS`,
    /// `API_PORT`, `BOOTSTRAP_ADDRESS`, `SUCCESSOR_LIST_LEN`,
    /// `MAINTENANCE_INTERVAL_MS`, `RPC_TIMEOUT_MS` and `RPC_RETRIES`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let p2p_address = match lookup("NODE_ADDRESS") {
            Some(address) => chordal_lib::parse_address(&address)?,
            None => defaults.p2p_address,
        };
        let bind_address = match lookup("BIND_ADDRESS") {
            Some(address) => chordal_lib::parse_address(&address)?,
            None => p2p_address.clone(),
        };
        let bootstrap_address = lookup("BOOTSTRAP_ADDRESS")
            .filter(|address| !address.trim().is_empty())
            .map(|address| chordal_lib::parse_address(&address))
            .transpose()?;
        let api_port = lookup("API_PORT")
            .map(|port| parse_value::<u16>("API_PORT", &port))
            .transpose()?;

        let successor_list_len = match lookup("SUCCESSOR_LIST_LEN") {
            Some(raw) => parse_value("SUCCESSOR_LIST_LEN", &raw)?,
            None => defaults.successor_list_len,
        };
        if successor_list_len == 0 {
            return Err(ChordError::InvalidArgument(
                "SUCCESSOR_LIST_LEN must be at least 1".to_string(),
            ));
        }

        let maintenance_interval = match lookup("MAINTENANCE_INTERVAL_MS") {
            Some(raw) => Duration::from_millis(parse_value("MAINTENANCE_INTERVAL_MS", &raw)?),
            None => defaults.maintenance_interval,
        };
        let rpc_timeout = match lookup("RPC_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(parse_value("RPC_TIMEOUT_MS", &raw)?),
            None => defaults.rpc_timeout,
        };
        let rpc_retries = match lookup("RPC_RETRIES") {
            Some(raw) => parse_value("RPC_RETRIES", &raw)?,
            None => defaults.rpc_retries,
        };

        Ok(Self {
            p2p_address,
            bind_address,
            api_port,
            bootstrap_address,
            successor_list_len,
            maintenance_interval,
            rpc_timeout,
            rpc_retries,
        })
    }
}

fn parse_value<V: FromStr>(key: &str, raw: &str) -> Result<V> {
    raw.trim()
        .parse()
        .map_err(|_| ChordError::InvalidArgument(format!("{} has invalid value '{}'", key, raw)))
}

impl ChordNode<RealNetworkClient> {
    /// Create a ChordNode from config with the real network client
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = RealNetworkClient::new(config.rpc_timeout, config.rpc_retries);
        ChordNode::new(
            &config.p2p_address,
            config.successor_list_len,
            std::sync::Arc::new(client),
        )
    }
}
