//! Node Configuration
//!
//! An optional JSON file supplies the base [`NodeConfig`]; command-line flags
//! override whatever they set.

use chain_consensus::{DiscoveryConfig, ProposerConfig, RelayConfig, SyncConfig, SyncError};
use chain_runtime::DEFAULT_CHAIN_NAME;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Permissioned single-authority blockchain node
#[derive(Parser, Debug, Default)]
#[command(name = "chain-node")]
#[command(about = "Permissioned single-authority blockchain node", long_about = None)]
pub struct Args {
    /// Run as the bootstrap (authority) node
    #[arg(long)]
    pub bootstrap: bool,

    /// Peer protocol and WebSocket bind address; also what peers dial
    #[arg(long)]
    pub listen_addr: Option<String>,

    /// HTTP RPC bind address
    #[arg(long)]
    pub rpc_addr: Option<String>,

    /// Peer to join through (required unless --bootstrap)
    #[arg(long)]
    pub seed: Option<String>,

    /// Data directory for keystore, genesis and block log
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Chain name written into a new genesis
    #[arg(long)]
    pub chain_name: Option<String>,

    /// Supply granted to the owner account in a new genesis
    #[arg(long)]
    pub owner_balance: Option<u64>,

    /// Password protecting the authority key
    #[arg(long, env = "CHAIN_AUTHORITY_PASSWORD", hide_env_values = true)]
    pub authority_password: Option<String>,

    /// Password protecting the owner key
    #[arg(long, env = "CHAIN_OWNER_PASSWORD", hide_env_values = true)]
    pub owner_password: Option<String>,

    /// Mean block period in milliseconds
    #[arg(long)]
    pub block_period_ms: Option<u64>,

    /// Relay tick in milliseconds
    #[arg(long)]
    pub relay_tick_ms: Option<u64>,

    /// Peer discovery period in milliseconds
    #[arg(long)]
    pub discovery_period_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// JSON config file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("{0} must be greater than zero")]
    ZeroPeriod(&'static str),
}

/// Resolved node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub bootstrap: bool,
    pub listen_addr: String,
    pub rpc_addr: String,
    pub seed: Option<String>,
    pub data_dir: PathBuf,
    pub chain_name: String,
    pub owner_balance: u64,
    #[serde(skip_serializing)]
    pub authority_password: Option<String>,
    #[serde(skip_serializing)]
    pub owner_password: Option<String>,
    pub block_period_ms: u64,
    pub relay_tick_ms: u64,
    pub discovery_period_ms: u64,
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bootstrap: false,
            listen_addr: "127.0.0.1:9000".to_string(),
            rpc_addr: "127.0.0.1:8899".to_string(),
            seed: None,
            data_dir: PathBuf::from("./data"),
            chain_name: DEFAULT_CHAIN_NAME.to_string(),
            owner_balance: 1_000_000,
            authority_password: None,
            owner_password: None,
            block_period_ms: 2_000,
            relay_tick_ms: 1_000,
            discovery_period_ms: 5_000,
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let read_error = |reason: String| ConfigError::Read {
            path: path.to_path_buf(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| read_error(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| read_error(e.to_string()))
    }

    /// Config file (if any) overlaid with the flags that were given
    pub fn resolve(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if args.bootstrap {
            config.bootstrap = true;
        }
        if let Some(v) = &args.listen_addr {
            config.listen_addr = v.clone();
        }
        if let Some(v) = &args.rpc_addr {
            config.rpc_addr = v.clone();
        }
        if let Some(v) = &args.seed {
            config.seed = Some(v.clone());
        }
        if let Some(v) = &args.data_dir {
            config.data_dir = v.clone();
        }
        if let Some(v) = &args.chain_name {
            config.chain_name = v.clone();
        }
        if let Some(v) = args.owner_balance {
            config.owner_balance = v;
        }
        if let Some(v) = &args.authority_password {
            config.authority_password = Some(v.clone());
        }
        if let Some(v) = &args.owner_password {
            config.owner_password = Some(v.clone());
        }
        if let Some(v) = args.block_period_ms {
            config.block_period_ms = v;
        }
        if let Some(v) = args.relay_tick_ms {
            config.relay_tick_ms = v;
        }
        if let Some(v) = args.discovery_period_ms {
            config.discovery_period_ms = v;
        }
        if let Some(v) = &args.log_level {
            config.log_level = v.clone();
        }

        Ok(config)
    }

    /// Startup checks; any failure aborts the node
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sync_config().validate()?;
        for (name, value) in [
            ("block period", self.block_period_ms),
            ("relay tick", self.relay_tick_ms),
            ("discovery period", self.discovery_period_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroPeriod(name));
            }
        }
        Ok(())
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            data_dir: self.data_dir.clone(),
            chain_name: self.chain_name.clone(),
            bootstrap: self.bootstrap,
            seed: self.seed.clone(),
            owner_balance: self.owner_balance,
            authority_password: self.authority_password.clone(),
            owner_password: self.owner_password.clone(),
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        let tick = Duration::from_millis(self.relay_tick_ms);
        RelayConfig {
            tick,
            margin: tick / 5,
            ..Default::default()
        }
    }

    pub fn proposer_config(&self) -> ProposerConfig {
        ProposerConfig {
            period: Duration::from_millis(self.block_period_ms),
        }
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            period: Duration::from_millis(self.discovery_period_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(flags: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("chain-node").chain(flags.iter().copied())).unwrap()
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = parse(&[
            "--bootstrap",
            "--listen-addr",
            "0.0.0.0:7000",
            "--authority-password",
            "authority",
            "--owner-password",
            "owner",
            "--relay-tick-ms",
            "500",
        ]);
        let config = NodeConfig::resolve(&args).unwrap();

        assert!(config.bootstrap);
        assert_eq!(config.listen_addr, "0.0.0.0:7000");
        assert_eq!(config.rpc_addr, "127.0.0.1:8899");
        assert_eq!(config.relay_config().tick, Duration::from_millis(500));
        assert_eq!(config.relay_config().margin, Duration::from_millis(100));
        config.validate().unwrap();
    }

    #[test]
    fn test_file_supplies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(
            &path,
            r#"{ "seed": "10.0.0.1:9000", "block_period_ms": 750, "chain_name": "lab" }"#,
        )
        .unwrap();

        let args = Args {
            config: Some(path),
            chain_name: Some("override".into()),
            ..Default::default()
        };
        let config = NodeConfig::resolve(&args).unwrap();

        assert_eq!(config.seed.as_deref(), Some("10.0.0.1:9000"));
        assert_eq!(config.proposer_config().period, Duration::from_millis(750));
        assert_eq!(config.chain_name, "override");
        assert_eq!(config.discovery_period_ms, 5_000);
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_failures() {
        // Joining without a seed
        assert!(matches!(
            NodeConfig::default().validate(),
            Err(ConfigError::Sync(SyncError::MissingSeed))
        ));

        let bootstrap = NodeConfig {
            bootstrap: true,
            authority_password: Some("authority".into()),
            owner_password: Some("abc".into()),
            ..Default::default()
        };
        assert!(matches!(
            bootstrap.validate(),
            Err(ConfigError::Sync(SyncError::Keystore(_)))
        ));

        let zero_balance = NodeConfig {
            owner_balance: 0,
            owner_password: Some("owner".into()),
            ..bootstrap.clone()
        };
        assert!(matches!(
            zero_balance.validate(),
            Err(ConfigError::Sync(SyncError::ZeroBalance))
        ));

        let zero_tick = NodeConfig {
            seed: Some("peer:1".into()),
            relay_tick_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            zero_tick.validate(),
            Err(ConfigError::ZeroPeriod("relay tick"))
        ));

        assert!(NodeConfig::from_file(Path::new("/nonexistent/node.json")).is_err());
    }
}
