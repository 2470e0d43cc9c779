//! AMM venue seam.
//!
//! The venue itself is external. The core only asks it to create pools and
//! exposes the hooks it must call before trades and liquidity changes.

use std::fmt;

use borsh::BorshSerialize;
use heed::{RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    state::{
        Error,
        markets::{MarketId, MarketLedger, MarketState, Side},
    },
    types::{Address, Hash, hashes},
};

#[derive(
    BorshSerialize,
    Clone,
    Copy,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct PoolId(pub Hash);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolId({self})")
    }
}

#[derive(
    BorshSerialize, Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct PoolSettings {
    /// Swap fee, in hundredths of a basis point
    pub fee: u32,
    pub tick_spacing: i32,
    pub min_tick: i32,
    pub max_tick: i32,
    pub starting_tick: i32,
}

impl PoolSettings {
    pub const MAX_FEE: u32 = 1_000_000;

    pub fn validate(&self) -> Result<(), AmmError> {
        let invalid = |reason: &'static str| AmmError::InvalidSettings {
            settings: *self,
            reason,
        };
        if self.fee > Self::MAX_FEE {
            return Err(invalid("fee exceeds 100%"));
        }
        if self.tick_spacing <= 0 {
            return Err(invalid("tick spacing must be positive"));
        }
        if self.min_tick >= self.max_tick {
            return Err(invalid("min tick must be below max tick"));
        }
        if !(self.min_tick..=self.max_tick).contains(&self.starting_tick) {
            return Err(invalid("starting tick out of range"));
        }
        Ok(())
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            fee: 3_000,
            tick_spacing: 60,
            min_tick: -887_220,
            max_tick: 887_220,
            starting_tick: 0,
        }
    }
}

/// Identifies a pool at the venue
#[derive(BorshSerialize, Clone, Debug, Eq, PartialEq)]
pub struct PoolKey {
    pub currency0: Address,
    pub currency1: Address,
    pub settings: PoolSettings,
    /// Address of the contract whose hooks the venue must call
    pub hooks: Address,
}

/// Which market and side a pool trades
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PoolBinding {
    pub market_id: MarketId,
    pub side: Side,
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AmmError {
    #[error("invalid pool settings {settings:?}: {reason}")]
    InvalidSettings {
        settings: PoolSettings,
        reason: &'static str,
    },
    #[error(
        "trading on market {market_id} is closed \
         ({state}, ends at {end_timestamp}, now {now})"
    )]
    TradingClosed {
        market_id: MarketId,
        state: MarketState,
        end_timestamp: u64,
        now: u64,
    },
    #[error("unknown pool {pool_id}")]
    UnknownPool { pool_id: PoolId },
    #[error("venue rejected pool: {reason}")]
    VenueRejected { reason: String },
}

pub trait AmmVenue {
    fn create_pool(
        &self,
        rwtxn: &mut RwTxn,
        key: &PoolKey,
    ) -> Result<PoolId, Error>;
}

/// Venue that derives pool ids by hashing the pool key
#[derive(Clone, Copy, Debug, Default)]
pub struct DeterministicVenue;

impl DeterministicVenue {
    pub fn pool_id(key: &PoolKey) -> Result<PoolId, Error> {
        hashes::hash_borsh("oracle_markets/pool", key)
            .map(PoolId)
            .map_err(Error::BorshSerialize)
    }
}

impl AmmVenue for DeterministicVenue {
    fn create_pool(
        &self,
        _rwtxn: &mut RwTxn,
        key: &PoolKey,
    ) -> Result<PoolId, Error> {
        let pool_id = Self::pool_id(key)?;
        tracing::debug!(
            %pool_id,
            currency0 = %key.currency0,
            currency1 = %key.currency1,
            "created pool"
        );
        Ok(pool_id)
    }
}

impl MarketLedger {
    fn check_trading_open(
        &self,
        rotxn: &RoTxn,
        pool_id: PoolId,
        now: u64,
    ) -> Result<PoolBinding, Error> {
        let binding = self
            .try_get_pool_binding(rotxn, pool_id)?
            .ok_or(AmmError::UnknownPool { pool_id })?;
        let market = self.get_market(rotxn, binding.market_id)?;
        if market.state != MarketState::Active || now > market.end_timestamp {
            tracing::warn!(
                %pool_id,
                market_id = %market.id,
                state = %market.state,
                now,
                "rejected pool access"
            );
            return Err(AmmError::TradingClosed {
                market_id: market.id,
                state: market.state,
                end_timestamp: market.end_timestamp,
                now,
            }
            .into());
        }
        Ok(binding)
    }

    /// Called by the venue before every swap
    pub fn before_swap(
        &self,
        rotxn: &RoTxn,
        pool_id: PoolId,
        now: u64,
    ) -> Result<PoolBinding, Error> {
        self.check_trading_open(rotxn, pool_id, now)
    }

    /// Called by the venue before liquidity is added or removed
    pub fn before_modify_liquidity(
        &self,
        rotxn: &RoTxn,
        pool_id: PoolId,
        now: u64,
    ) -> Result<PoolBinding, Error> {
        self.check_trading_open(rotxn, pool_id, now)
    }
}
