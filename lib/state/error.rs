//! State errors

use thiserror::Error;

use crate::{
    authorization::AuthorizationError,
    config::ConfigError,
    math::{normal_curve::CurveError, scale::ScaleError},
    state::{
        agents::AgentError, amm::AmmError, consensus::ConsensusError,
        markets::MarketError, registry::RegistryError, tokens::TokenError,
    },
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Amm(#[from] AmmError),
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
    #[error(transparent)]
    BorshSerialize(borsh::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Curve(#[from] CurveError),
    #[error("database error")]
    Db(#[from] heed::Error),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Market(#[from] MarketError),
    #[error("{component} has not been initialized")]
    NotInitialized { component: &'static str },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Scale(#[from] ScaleError),
    #[error(transparent)]
    Token(#[from] TokenError),
}
