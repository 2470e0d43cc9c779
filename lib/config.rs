//! Configuration for every component of the ledger.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    authorization::{OwnerPolicy, SettlementBinding},
    state::{
        consensus::{ConsensusConfig, ConsensusError, ConsensusParams},
        markets::LedgerConfig,
        registry::RegistryConfig,
    },
    types::Address,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config")]
    Json(#[from] serde_json::Error),
    #[error("`{field}` must not be the zero address")]
    ZeroAddress { field: &'static str },
}

fn default_map_size() -> usize {
    Config::DEFAULT_MAP_SIZE
}

#[cfg_attr(feature = "clap", derive(clap::Args))]
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Config {
    /// Owner of the market ledger
    #[cfg_attr(feature = "clap", arg(long))]
    pub ledger_owner: Address,
    /// Account holding escrowed collateral; also the ledger's settlement
    /// callback address
    #[cfg_attr(feature = "clap", arg(long))]
    pub escrow: Address,
    /// Identity of the consensus engine, the only caller allowed to
    /// resolve markets
    #[cfg_attr(feature = "clap", arg(long))]
    pub settlement_engine: Address,
    #[cfg_attr(feature = "clap", arg(long))]
    pub registry_owner: Address,
    #[cfg_attr(feature = "clap", arg(long))]
    pub consensus_owner: Address,
    #[cfg_attr(feature = "clap", command(flatten))]
    #[serde(default)]
    pub consensus: ConsensusParams,
    /// Callers allowed to respond to tasks without being registered
    #[cfg_attr(feature = "clap", arg(long = "test-operator"))]
    #[serde(default)]
    pub test_operators: Vec<Address>,
    /// LMDB map size, in bytes
    #[cfg_attr(
        feature = "clap",
        arg(long, default_value_t = Config::DEFAULT_MAP_SIZE)
    )]
    #[serde(default = "default_map_size")]
    pub map_size: usize,
}

impl Config {
    pub const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let addresses = [
            ("ledger_owner", self.ledger_owner),
            ("escrow", self.escrow),
            ("settlement_engine", self.settlement_engine),
            ("registry_owner", self.registry_owner),
            ("consensus_owner", self.consensus_owner),
        ];
        for (field, address) in addresses {
            if address.is_zero() {
                return Err(ConfigError::ZeroAddress { field });
            }
        }
        self.consensus.validate()?;
        Ok(())
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            owner: OwnerPolicy::new(self.ledger_owner),
            escrow: self.escrow,
            settlement: SettlementBinding {
                engine: self.settlement_engine,
            },
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            owner: OwnerPolicy::new(self.registry_owner),
        }
    }

    pub fn consensus_config(&self) -> ConsensusConfig {
        ConsensusConfig {
            owner: OwnerPolicy::new(self.consensus_owner),
            engine: self.settlement_engine,
        }
    }
}
