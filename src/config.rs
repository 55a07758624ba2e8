// Node configuration
//
// Loaded from a TOML file or from LEDGER_* environment variables.

use crate::mutex::{MutexConfig, ProcessId};
use crate::network::{PeerRegistry, TcpMessengerConfig, DEFAULT_MAX_FRAME_BYTES, FRAME_LENGTH_LIMIT};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for {var}: {reason}")]
    Env { var: String, reason: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// One entry of the fixed peer set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub process_id: String,
    /// "host:port"
    pub address: String,
}

/// Mutual exclusion settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutexSettings {
    /// Withdraw a request not granted within this many milliseconds
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

/// Transport settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub connect_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Configuration of one process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub process_id: String,
    pub listen_address: String,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// Starting balance of every client
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,
    #[serde(default)]
    pub mutex: MutexSettings,
    #[serde(default)]
    pub transport: TransportSettings,
}

fn default_initial_balance() -> Decimal {
    Decimal::new(100, 0)
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            process_id: "node-1".to_string(),
            listen_address: "127.0.0.1:7001".to_string(),
            peers: Vec::new(),
            initial_balance: default_initial_balance(),
            mutex: MutexSettings::default(),
            transport: TransportSettings::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(process_id: &str) -> Self {
        Self {
            process_id: process_id.to_string(),
            ..Self::default()
        }
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from LEDGER_* environment variables over the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Build from (name, value) pairs using the LEDGER_* names.
    ///
    /// LEDGER_PEERS is a comma-separated list of `id=host:port`.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::default();

        for (var, value) in vars {
            match var.as_str() {
                "LEDGER_PROCESS_ID" => config.process_id = value,
                "LEDGER_LISTEN_ADDRESS" => config.listen_address = value,
                "LEDGER_PEERS" => config.peers = parse_peers(&var, &value)?,
                "LEDGER_INITIAL_BALANCE" => {
                    config.initial_balance = value.parse().map_err(|e: rust_decimal::Error| env_error(&var, e))?;
                }
                "LEDGER_REQUEST_TIMEOUT_MS" => {
                    let ms = value.parse().map_err(|e: std::num::ParseIntError| env_error(&var, e))?;
                    config.mutex.request_timeout_ms = Some(ms);
                }
                "LEDGER_CONNECT_TIMEOUT_MS" => {
                    config.transport.connect_timeout_ms =
                        value.parse().map_err(|e: std::num::ParseIntError| env_error(&var, e))?;
                }
                "LEDGER_MAX_FRAME_BYTES" => {
                    config.transport.max_frame_bytes =
                        value.parse().map_err(|e: std::num::ParseIntError| env_error(&var, e))?;
                }
                _ => {}
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_listen_address(mut self, address: &str) -> Self {
        self.listen_address = address.to_string();
        self
    }

    pub fn with_peer(mut self, process_id: &str, address: &str) -> Self {
        self.peers.push(PeerConfig {
            process_id: process_id.to_string(),
            address: address.to_string(),
        });
        self
    }

    pub fn with_initial_balance(mut self, balance: Decimal) -> Self {
        self.initial_balance = balance;
        self
    }

    pub fn with_request_timeout_ms(mut self, ms: u64) -> Self {
        self.mutex.request_timeout_ms = Some(ms);
        self
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.process_id.trim().is_empty() {
            return Err(ConfigError::Invalid("process_id must not be empty".into()));
        }
        if self.initial_balance.is_sign_negative() {
            return Err(ConfigError::Invalid(format!(
                "initial_balance {} is negative",
                self.initial_balance
            )));
        }
        if self.transport.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("max_frame_bytes must be positive".into()));
        }
        if self.transport.max_frame_bytes > FRAME_LENGTH_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_frame_bytes {} exceeds the frame length limit of {}",
                self.transport.max_frame_bytes, FRAME_LENGTH_LIMIT
            )));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.process_id == self.process_id {
                return Err(ConfigError::Invalid(format!(
                    "peer {} is this process",
                    peer.process_id
                )));
            }
            if !seen.insert(peer.process_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "peer {} listed twice",
                    peer.process_id
                )));
            }
            parse_address(&peer.address)?;
        }

        Ok(())
    }

    pub fn process_id(&self) -> ProcessId {
        ProcessId::new(self.process_id.clone())
    }

    pub fn peer_ids(&self) -> Vec<ProcessId> {
        self.peers
            .iter()
            .map(|peer| ProcessId::new(peer.process_id.clone()))
            .collect()
    }

    pub fn mutex_config(&self) -> MutexConfig {
        match self.mutex.request_timeout_ms {
            Some(ms) => MutexConfig::new().with_request_timeout(Duration::from_millis(ms)),
            None => MutexConfig::new(),
        }
    }

    pub fn transport_config(&self) -> TcpMessengerConfig {
        TcpMessengerConfig::new()
            .with_bind_address(&self.listen_address)
            .with_connect_timeout_ms(self.transport.connect_timeout_ms)
            .with_max_frame_bytes(self.transport.max_frame_bytes)
    }

    /// Resolve the peer list into a registry
    pub fn peer_registry(&self) -> Result<PeerRegistry, ConfigError> {
        let mut peers = Vec::with_capacity(self.peers.len());
        for peer in &self.peers {
            peers.push((ProcessId::new(peer.process_id.clone()), parse_address(&peer.address)?));
        }
        PeerRegistry::from_peers(self.process_id(), peers).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

fn parse_address(address: &str) -> Result<SocketAddr, ConfigError> {
    address
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("bad peer address {}", address)))
}

fn parse_peers(var: &str, value: &str) -> Result<Vec<PeerConfig>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, address) = entry
                .split_once('=')
                .ok_or_else(|| env_error(var, format!("expected id=host:port, got {}", entry)))?;
            Ok(PeerConfig {
                process_id: id.trim().to_string(),
                address: address.trim().to_string(),
            })
        })
        .collect()
}

fn env_error(var: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Env {
        var: var.to_string(),
        reason: reason.to_string(),
    }
}
