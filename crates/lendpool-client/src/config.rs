//! pool and client configuration

use std::path::Path;
use std::time::Duration;

use alloy_primitives::Address;
use lendpool_core::ProtocolParams;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// the pool a session talks to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// network name, informational
    pub network: String,
    /// chain id of the network
    pub chain_id: u64,
    /// lending gateway json-rpc endpoint
    pub gateway_url: String,
    /// pool contract; also the spender for token approvals
    pub pool_address: Address,
    /// token decimals
    pub decimals: u8,
    /// token symbol
    pub symbol: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::local()
    }
}

impl PoolConfig {
    /// local development node
    pub fn local() -> Self {
        Self {
            network: "localhost".into(),
            chain_id: 31337,
            gateway_url: "http://127.0.0.1:8545".into(),
            pool_address: Address::ZERO,
            decimals: 18,
            symbol: "USD8".into(),
        }
    }

    /// sepolia testnet; the pool address must still be configured
    pub fn sepolia() -> Self {
        Self {
            network: "sepolia".into(),
            chain_id: 11155111,
            gateway_url: "https://rpc.sepolia.org".into(),
            ..Self::local()
        }
    }
}

/// which ledger backend to build
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// json-rpc lending gateway
    #[default]
    Rpc,
    /// in-process simulated ledger
    Simulated,
}

/// client configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub pool: PoolConfig,
    pub mode: BackendMode,
    /// per-request timeout for reads, in seconds
    pub request_timeout_secs: u64,
    /// how long to wait for a write to become final, in seconds
    pub finality_timeout_secs: u64,
    /// age after which a snapshot is no longer trusted, in seconds
    pub snapshot_ttl_secs: u64,
    /// background refresh period, in seconds
    pub poll_interval_secs: u64,
    pub params: ProtocolParams,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::local(),
            mode: BackendMode::Rpc,
            request_timeout_secs: 30,
            finality_timeout_secs: 120,
            snapshot_ttl_secs: 10,
            poll_interval_secs: 10,
            params: ProtocolParams::default(),
        }
    }
}

impl ClientConfig {
    pub fn simulated() -> Self {
        Self {
            mode: BackendMode::Simulated,
            ..Default::default()
        }
    }

    /// read a toml config file; missing keys take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.params.validate()?;
        if self.finality_timeout_secs == 0 {
            return Err(ClientError::Config("finality timeout must be positive".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ClientError::Config("request timeout must be positive".into()));
        }
        if self.snapshot_ttl_secs == 0 {
            return Err(ClientError::Config("snapshot ttl must be positive".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ClientError::Config("poll interval must be positive".into()));
        }
        if self.pool.decimals > 77 {
            return Err(ClientError::Config(format!(
                "token decimals {} out of range",
                self.pool.decimals
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn finality_timeout(&self) -> Duration {
        Duration::from_secs(self.finality_timeout_secs)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
