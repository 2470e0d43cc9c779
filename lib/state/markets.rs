//! Market ledger: per-market records, lifecycle state machine, escrowed
//! collateral and claim-token accounting.

use std::fmt;

use borsh::BorshSerialize;
use heed::{Env, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};
use thiserror::Error;

use crate::{
    authorization::{OwnerPolicy, SettlementBinding},
    math::{
        normal_curve,
        scale::{CLAIM_TOKEN_DECIMALS, Rounding, ScaleFactor},
    },
    state::{
        Db, Error, Singleton,
        amm::{AmmVenue, PoolBinding, PoolId, PoolKey, PoolSettings},
        consensus::{ConsensusEngine, SettlementTarget, TaskIndex},
        events::{Event, EventLog},
        tokens::{TokenError, TokenId, Tokens},
    },
    types::{Address, Hash, hashes},
};

#[derive(
    BorshSerialize,
    Clone,
    Copy,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct MarketId(pub Hash);

impl MarketId {
    pub const ZERO: Self = Self([0; 32]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MarketId({self})")
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumIter,
    Eq,
    Hash,
    PartialEq,
    Serialize,
)]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn from_outcome(outcome: bool) -> Self {
        if outcome { Self::Yes } else { Self::No }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumIter,
    Eq,
    Hash,
    PartialEq,
    Serialize,
)]
pub enum MarketState {
    Created,
    Active,
    Closed,
    InResolution,
    Resolved,
    Cancelled,
    /// No exit transition is defined
    Disputed,
}

impl MarketState {
    pub fn can_transition_to(&self, new_state: MarketState) -> bool {
        use MarketState::*;
        matches!(
            (self, new_state),
            (Created, Active)
                | (Active, Closed)
                | (Active, Cancelled)
                | (Closed, InResolution)
                | (InResolution, Resolved)
                | (InResolution, Disputed)
                | (Resolved, Disputed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MarketState::Resolved
                | MarketState::Cancelled
                | MarketState::Disputed
        )
    }
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MarketError {
    #[error("market {market_id} has already been claimed by {account}")]
    AlreadyClaimed {
        market_id: MarketId,
        account: Address,
    },
    #[error("market {market_id} collateral is {expected}, not {actual}")]
    CollateralMismatch {
        market_id: MarketId,
        expected: TokenId,
        actual: TokenId,
    },
    #[error("collateral total of market {market_id} would overflow")]
    CollateralOverflow { market_id: MarketId },
    #[error("{amount} claim units are worth no collateral")]
    DustAmount { amount: u128 },
    #[error("empty market title")]
    EmptyTitle,
    #[error("market id collision: {market_id}")]
    IdCollision { market_id: MarketId },
    #[error(
        "market {market_id} escrow holds {available}, cannot pay {required}"
    )]
    Insolvent {
        market_id: MarketId,
        required: u128,
        available: u128,
    },
    #[error("invalid market state transition from {from} to {to}")]
    InvalidStateTransition { from: MarketState, to: MarketState },
    #[error("market {market_id} ends at {end_timestamp}, now is {now}")]
    NotExpired {
        market_id: MarketId,
        end_timestamp: u64,
        now: u64,
    },
    #[error("market {market_id} not found")]
    NotFound { market_id: MarketId },
    #[error("{account} holds no winning tokens in market {market_id}")]
    NothingToClaim {
        market_id: MarketId,
        account: Address,
    },
    #[error("end timestamp overflows")]
    TimestampOverflow,
    #[error("market {market_id} is {actual}, expected {expected}")]
    WrongState {
        market_id: MarketId,
        expected: MarketState,
        actual: MarketState,
    },
    #[error(
        "task {actual} is not the resolution task of market {market_id} \
         ({expected:?})"
    )]
    WrongResolutionTask {
        market_id: MarketId,
        expected: Option<TaskIndex>,
        actual: TaskIndex,
    },
    #[error("zero address")]
    ZeroAddress,
    #[error("amount must be nonzero")]
    ZeroAmount,
    #[error("collateral amount must be nonzero")]
    ZeroCollateral,
    #[error("duration must be nonzero")]
    ZeroDuration,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Market {
    pub id: MarketId,
    /// Informational only; settlement is authorized by the ledger's
    /// settlement binding
    pub oracle: Address,
    pub creator: Address,
    pub collateral_asset: TokenId,
    pub scale: ScaleFactor,
    /// Collateral currently held in escrow
    pub total_collateral: u128,
    /// Cumulative collateral paid out via claims
    pub claimed_tokens: u128,
    /// Cumulative collateral paid out via cancellation redemption
    pub redeemed_collateral: u128,
    pub state: MarketState,
    pub outcome: Option<bool>,
    pub yes_token: TokenId,
    pub no_token: TokenId,
    pub yes_pool: PoolId,
    pub no_pool: PoolId,
    pub title: String,
    pub description: String,
    pub created_at: u64,
    pub end_timestamp: u64,
    pub settings: PoolSettings,
    pub resolution_task: Option<TaskIndex>,
}

impl Market {
    pub fn claim_token(&self, side: Side) -> TokenId {
        match side {
            Side::Yes => self.yes_token,
            Side::No => self.no_token,
        }
    }

    /// Winning side, once resolved
    pub fn winning_side(&self) -> Option<Side> {
        self.outcome.map(Side::from_outcome)
    }

    fn transition(&mut self, to: MarketState) -> Result<(), MarketError> {
        if !self.state.can_transition_to(to) {
            return Err(MarketError::InvalidStateTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    fn require_state(&self, expected: MarketState) -> Result<(), MarketError> {
        if self.state != expected {
            return Err(MarketError::WrongState {
                market_id: self.id,
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    /// Record a payout out of escrow
    fn debit_escrow(&mut self, amount: u128) -> Result<(), MarketError> {
        if amount > self.total_collateral {
            return Err(MarketError::Insolvent {
                market_id: self.id,
                required: amount,
                available: self.total_collateral,
            });
        }
        self.total_collateral -= amount;
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CreateMarketParams {
    pub oracle: Address,
    pub creator: Address,
    pub collateral_asset: TokenId,
    pub collateral_amount: u128,
    pub title: String,
    pub description: String,
    /// Seconds until trading ends
    pub duration: u64,
    pub settings: PoolSettings,
}

impl CreateMarketParams {
    fn validate(&self) -> Result<(), Error> {
        if self.oracle.is_zero() || self.creator.is_zero() {
            return Err(MarketError::ZeroAddress.into());
        }
        if self.collateral_amount == 0 {
            return Err(MarketError::ZeroCollateral.into());
        }
        if self.duration == 0 {
            return Err(MarketError::ZeroDuration.into());
        }
        if self.title.trim().is_empty() {
            return Err(MarketError::EmptyTitle.into());
        }
        self.settings.validate()?;
        Ok(())
    }
}

/// Canonical bytes hashed into a market id
#[derive(BorshSerialize)]
struct MarketIdPreimage {
    creator: Address,
    creator_nonce: u64,
    created_at: u64,
    oracle: Address,
    collateral_asset: TokenId,
    title: String,
    description: String,
    duration: u64,
    settings: PoolSettings,
}

impl MarketIdPreimage {
    fn market_id(&self) -> Result<MarketId, Error> {
        hashes::hash_borsh("oracle_markets/market", self)
            .map(MarketId)
            .map_err(Error::BorshSerialize)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ClaimRecord {
    pub claim_amount: u128,
    pub collateral_amount: u128,
}

/// Normal-curve quote for buying one side against the market's escrow
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OutcomeQuote {
    pub side: Side,
    pub collateral_in: u128,
    pub claims_in: u128,
    pub claims_out: u128,
    pub price_impact_bps: u32,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LedgerConfig {
    pub owner: OwnerPolicy,
    /// Account holding escrowed collateral. Also the ledger's settlement
    /// callback address and the minter of every claim token.
    pub escrow: Address,
    pub settlement: SettlementBinding,
}

#[derive(Clone)]
pub struct MarketLedger {
    config: Singleton<LedgerConfig>,
    markets: Db<MarketId, Market>,
    state_index: Db<MarketState, Vec<MarketId>>,
    creator_nonces: Db<Address, u64>,
    claims: Db<(MarketId, Address), ClaimRecord>,
    pools: Db<PoolId, PoolBinding>,
    tokens: Tokens,
    consensus: ConsensusEngine,
    events: EventLog,
}

impl MarketLedger {
    pub const NUM_DBS: u32 = 6;

    const CONFIG_KEY: &'static str = "config";

    pub fn new(
        env: &Env,
        rwtxn: &mut RwTxn,
        tokens: Tokens,
        consensus: ConsensusEngine,
        events: EventLog,
    ) -> Result<Self, Error> {
        let config = env.create_database(rwtxn, Some("ledger_config"))?;
        let markets = env.create_database(rwtxn, Some("markets"))?;
        let state_index =
            env.create_database(rwtxn, Some("markets_by_state"))?;
        let creator_nonces =
            env.create_database(rwtxn, Some("market_creator_nonces"))?;
        let claims = env.create_database(rwtxn, Some("market_claims"))?;
        let pools = env.create_database(rwtxn, Some("market_pools"))?;
        Ok(Self {
            config,
            markets,
            state_index,
            creator_nonces,
            claims,
            pools,
            tokens,
            consensus,
            events,
        })
    }

    /// Set the configuration if none is stored yet
    pub fn initialize(
        &self,
        rwtxn: &mut RwTxn,
        config: &LedgerConfig,
    ) -> Result<(), Error> {
        if config.escrow.is_zero() {
            return Err(MarketError::ZeroAddress.into());
        }
        if self.config.get(rwtxn, Self::CONFIG_KEY)?.is_none() {
            self.config.put(rwtxn, Self::CONFIG_KEY, config)?;
        }
        Ok(())
    }

    pub fn config(&self, rotxn: &RoTxn) -> Result<LedgerConfig, Error> {
        self.config
            .get(rotxn, Self::CONFIG_KEY)?
            .ok_or(Error::NotInitialized {
                component: "market ledger",
            })
    }

    pub fn try_get_market(
        &self,
        rotxn: &RoTxn,
        market_id: MarketId,
    ) -> Result<Option<Market>, Error> {
        Ok(self.markets.get(rotxn, &market_id)?)
    }

    pub fn get_market(
        &self,
        rotxn: &RoTxn,
        market_id: MarketId,
    ) -> Result<Market, Error> {
        self.try_get_market(rotxn, market_id)?
            .ok_or_else(|| MarketError::NotFound { market_id }.into())
    }

    pub fn get_markets_by_state(
        &self,
        rotxn: &RoTxn,
        state: MarketState,
    ) -> Result<Vec<Market>, Error> {
        let market_ids =
            self.state_index.get(rotxn, &state)?.unwrap_or_default();
        let mut markets = Vec::with_capacity(market_ids.len());
        for market_id in market_ids {
            if let Some(market) = self.try_get_market(rotxn, market_id)? {
                markets.push(market);
            }
        }
        Ok(markets)
    }

    pub fn has_claimed(
        &self,
        rotxn: &RoTxn,
        market_id: MarketId,
        account: Address,
    ) -> Result<bool, Error> {
        Ok(self.claims.get(rotxn, &(market_id, account))?.is_some())
    }

    /// Outstanding (YES, NO) claim-token supply
    pub fn claim_token_supply(
        &self,
        rotxn: &RoTxn,
        market_id: MarketId,
    ) -> Result<(u128, u128), Error> {
        let market = self.get_market(rotxn, market_id)?;
        let yes = self.tokens.total_supply(rotxn, market.yes_token)?;
        let no = self.tokens.total_supply(rotxn, market.no_token)?;
        Ok((yes, no))
    }

    pub fn creator_nonce(
        &self,
        rotxn: &RoTxn,
        creator: Address,
    ) -> Result<u64, Error> {
        Ok(self.creator_nonces.get(rotxn, &creator)?.unwrap_or_default())
    }

    pub(crate) fn try_get_pool_binding(
        &self,
        rotxn: &RoTxn,
        pool_id: PoolId,
    ) -> Result<Option<PoolBinding>, Error> {
        Ok(self.pools.get(rotxn, &pool_id)?)
    }

    /// Move a market between state index buckets
    fn update_state_index(
        &self,
        rwtxn: &mut RwTxn,
        market_id: MarketId,
        old_state: Option<MarketState>,
        new_state: MarketState,
    ) -> Result<(), Error> {
        if let Some(old_state) = old_state {
            let mut ids =
                self.state_index.get(rwtxn, &old_state)?.unwrap_or_default();
            ids.retain(|id| *id != market_id);
            if ids.is_empty() {
                self.state_index.delete(rwtxn, &old_state)?;
            } else {
                self.state_index.put(rwtxn, &old_state, &ids)?;
            }
        }
        let mut ids =
            self.state_index.get(rwtxn, &new_state)?.unwrap_or_default();
        ids.push(market_id);
        self.state_index.put(rwtxn, &new_state, &ids)?;
        Ok(())
    }

    /// Persist a market after a state transition from `old_state`
    fn put_transitioned(
        &self,
        rwtxn: &mut RwTxn,
        market: &Market,
        old_state: MarketState,
    ) -> Result<(), Error> {
        self.markets.put(rwtxn, &market.id, market)?;
        self.update_state_index(rwtxn, market.id, Some(old_state), market.state)
    }

    /// Mint an equal amount of YES and NO to `to`. The only path by which
    /// claim-token supply is created.
    fn mint_pair(
        &self,
        rwtxn: &mut RwTxn,
        escrow: Address,
        market: &Market,
        to: Address,
        claims: u128,
    ) -> Result<(), Error> {
        self.tokens
            .mint(rwtxn, market.yes_token, escrow, to, claims)?;
        self.tokens.mint(rwtxn, market.no_token, escrow, to, claims)?;
        Ok(())
    }

    /// Ask the venue for a claim-token/collateral pool and index it
    #[allow(clippy::too_many_arguments)]
    fn bind_pool(
        &self,
        rwtxn: &mut RwTxn,
        venue: &dyn AmmVenue,
        params: &CreateMarketParams,
        escrow: Address,
        market_id: MarketId,
        side: Side,
        claim_token: TokenId,
    ) -> Result<PoolId, Error> {
        let key = PoolKey {
            currency0: claim_token,
            currency1: params.collateral_asset,
            settings: params.settings,
            hooks: escrow,
        };
        let pool_id = venue.create_pool(rwtxn, &key)?;
        self.pools
            .put(rwtxn, &pool_id, &PoolBinding { market_id, side })?;
        Ok(pool_id)
    }

    pub fn create_market_and_deposit_collateral(
        &self,
        rwtxn: &mut RwTxn,
        venue: &dyn AmmVenue,
        params: CreateMarketParams,
        now: u64,
    ) -> Result<MarketId, Error> {
        params.validate()?;
        let config = self.config(rwtxn)?;
        let escrow = config.escrow;
        let collateral_decimals =
            self.tokens.decimals(rwtxn, params.collateral_asset)?;
        let scale = ScaleFactor::new(collateral_decimals)?;
        let claims = scale.collateral_to_claims(params.collateral_amount)?;
        let end_timestamp = now
            .checked_add(params.duration)
            .ok_or(MarketError::TimestampOverflow)?;

        let creator_nonce = self.creator_nonce(rwtxn, params.creator)?;
        let market_id = MarketIdPreimage {
            creator: params.creator,
            creator_nonce,
            created_at: now,
            oracle: params.oracle,
            collateral_asset: params.collateral_asset,
            title: params.title.clone(),
            description: params.description.clone(),
            duration: params.duration,
            settings: params.settings,
        }
        .market_id()?;
        if self.try_get_market(rwtxn, market_id)?.is_some() {
            return Err(MarketError::IdCollision { market_id }.into());
        }

        self.tokens.transfer_from(
            rwtxn,
            params.collateral_asset,
            escrow,
            params.creator,
            escrow,
            params.collateral_amount,
        )?;

        let yes_token =
            Address::derive("oracle_markets/yes", market_id.as_bytes());
        let no_token =
            Address::derive("oracle_markets/no", market_id.as_bytes());
        let short_id: String =
            hex::encode(market_id.0).chars().take(8).collect();
        for (token, side) in [(yes_token, Side::Yes), (no_token, Side::No)] {
            let symbol = format!("{side}-{short_id}").to_uppercase();
            self.tokens.create_token(
                rwtxn,
                token,
                &symbol,
                CLAIM_TOKEN_DECIMALS,
                escrow,
            )?;
        }
        let yes_pool = self.bind_pool(
            rwtxn,
            venue,
            &params,
            escrow,
            market_id,
            Side::Yes,
            yes_token,
        )?;
        let no_pool = self.bind_pool(
            rwtxn,
            venue,
            &params,
            escrow,
            market_id,
            Side::No,
            no_token,
        )?;

        let mut market = Market {
            id: market_id,
            oracle: params.oracle,
            creator: params.creator,
            collateral_asset: params.collateral_asset,
            scale,
            total_collateral: params.collateral_amount,
            claimed_tokens: 0,
            redeemed_collateral: 0,
            state: MarketState::Created,
            outcome: None,
            yes_token,
            no_token,
            yes_pool,
            no_pool,
            title: params.title,
            description: params.description,
            created_at: now,
            end_timestamp,
            settings: params.settings,
            resolution_task: None,
        };
        market.transition(MarketState::Active)?;
        self.mint_pair(rwtxn, escrow, &market, params.creator, claims)?;
        self.markets.put(rwtxn, &market_id, &market)?;
        self.update_state_index(rwtxn, market_id, None, market.state)?;
        self.creator_nonces
            .put(rwtxn, &params.creator, &(creator_nonce + 1))?;

        self.events.emit(
            rwtxn,
            Event::MarketCreated {
                market_id,
                creator: market.creator,
                collateral_amount: market.total_collateral,
                end_timestamp,
            },
        )?;
        self.events.emit(
            rwtxn,
            Event::OutcomeTokensMinted {
                market_id,
                account: market.creator,
                collateral_amount: market.total_collateral,
                claim_amount: claims,
            },
        )?;
        tracing::info!(
            %market_id,
            creator = %market.creator,
            collateral = market.total_collateral,
            end_timestamp,
            "created market"
        );
        Ok(market_id)
    }

    /// Deposit collateral and receive an equal amount of YES and NO
    pub fn mint_outcome_tokens(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        market_id: MarketId,
        collateral_amount: u128,
        collateral_asset: TokenId,
    ) -> Result<u128, Error> {
        let escrow = self.config(rwtxn)?.escrow;
        let mut market = self.get_market(rwtxn, market_id)?;
        market.require_state(MarketState::Active)?;
        if collateral_asset != market.collateral_asset {
            return Err(MarketError::CollateralMismatch {
                market_id,
                expected: market.collateral_asset,
                actual: collateral_asset,
            }
            .into());
        }
        if collateral_amount == 0 {
            return Err(MarketError::ZeroCollateral.into());
        }
        let claims = market.scale.collateral_to_claims(collateral_amount)?;
        market.total_collateral = market
            .total_collateral
            .checked_add(collateral_amount)
            .ok_or(MarketError::CollateralOverflow { market_id })?;

        self.tokens.transfer_from(
            rwtxn,
            collateral_asset,
            escrow,
            caller,
            escrow,
            collateral_amount,
        )?;
        self.mint_pair(rwtxn, escrow, &market, caller, claims)?;
        self.markets.put(rwtxn, &market_id, &market)?;
        self.events.emit(
            rwtxn,
            Event::OutcomeTokensMinted {
                market_id,
                account: caller,
                collateral_amount,
                claim_amount: claims,
            },
        )?;
        tracing::debug!(
            %market_id,
            account = %caller,
            collateral_amount,
            claims,
            "minted outcome tokens"
        );
        Ok(claims)
    }

    /// Close trading. Before the end timestamp only the ledger owner may
    /// close.
    pub fn close_market(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        market_id: MarketId,
        now: u64,
    ) -> Result<(), Error> {
        let config = self.config(rwtxn)?;
        let mut market = self.get_market(rwtxn, market_id)?;
        market.require_state(MarketState::Active)?;
        let expired = now > market.end_timestamp;
        if !expired && !config.owner.is_owner(caller) {
            tracing::warn!(
                %market_id,
                %caller,
                now,
                end_timestamp = market.end_timestamp,
                "market not expired"
            );
            return Err(MarketError::NotExpired {
                market_id,
                end_timestamp: market.end_timestamp,
                now,
            }
            .into());
        }
        let old_state = market.state;
        market.transition(MarketState::Closed)?;
        self.put_transitioned(rwtxn, &market, old_state)?;
        self.events.emit(
            rwtxn,
            Event::MarketClosed {
                market_id,
                by_owner_override: !expired,
            },
        )?;
        tracing::info!(%market_id, owner_override = !expired, "closed market");
        Ok(())
    }

    /// Move a closed market into resolution and open its consensus task
    pub fn enter_resolution(
        &self,
        rwtxn: &mut RwTxn,
        market_id: MarketId,
        now: u64,
    ) -> Result<TaskIndex, Error> {
        let config = self.config(rwtxn)?;
        let mut market = self.get_market(rwtxn, market_id)?;
        let old_state = market.state;
        market.transition(MarketState::InResolution)?;
        let task_index = self.consensus.create_market_resolution_task(
            rwtxn,
            &market.title,
            market_id,
            config.escrow,
            now,
        )?;
        market.resolution_task = Some(task_index);
        self.put_transitioned(rwtxn, &market, old_state)?;
        self.events.emit(
            rwtxn,
            Event::MarketEnteredResolution {
                market_id,
                task_index,
            },
        )?;
        tracing::info!(%market_id, %task_index, "market entered resolution");
        Ok(task_index)
    }

    /// Fix the outcome. Only the bound settlement engine may call this.
    pub fn resolve_market(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        market_id: MarketId,
        outcome: bool,
    ) -> Result<(), Error> {
        self.config(rwtxn)?.settlement.check(caller)?;
        let mut market = self.get_market(rwtxn, market_id)?;
        market.require_state(MarketState::InResolution)?;
        let old_state = market.state;
        market.transition(MarketState::Resolved)?;
        market.outcome = Some(outcome);
        self.put_transitioned(rwtxn, &market, old_state)?;
        self.events
            .emit(rwtxn, Event::MarketResolved { market_id, outcome })?;
        tracing::info!(%market_id, outcome, "resolved market");
        Ok(())
    }

    pub fn cancel_market(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        market_id: MarketId,
    ) -> Result<(), Error> {
        let config = self.config(rwtxn)?;
        let mut market = self.get_market(rwtxn, market_id)?;
        market.require_state(MarketState::Active)?;
        config
            .owner
            .check_principal_or_owner(caller, market.creator)?;
        let old_state = market.state;
        market.transition(MarketState::Cancelled)?;
        self.put_transitioned(rwtxn, &market, old_state)?;
        self.events.emit(rwtxn, Event::MarketCancelled { market_id })?;
        tracing::info!(%market_id, %caller, "cancelled market");
        Ok(())
    }

    /// Burn `amount` of both sides of a cancelled market for collateral.
    /// Returns the collateral paid.
    pub fn redeem_collateral(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        market_id: MarketId,
        amount: u128,
    ) -> Result<u128, Error> {
        let escrow = self.config(rwtxn)?.escrow;
        let mut market = self.get_market(rwtxn, market_id)?;
        market.require_state(MarketState::Cancelled)?;
        if amount == 0 {
            return Err(MarketError::ZeroAmount.into());
        }
        let payout = market.scale.claims_to_collateral(amount, Rounding::Down);
        if payout == 0 {
            return Err(MarketError::DustAmount { amount }.into());
        }
        // check both sides up front so a short NO balance cannot leave YES
        // burned
        for side in [Side::Yes, Side::No] {
            let token = market.claim_token(side);
            let balance = self.tokens.balance_of(rwtxn, token, caller)?;
            if balance < amount {
                return Err(TokenError::InsufficientBalance {
                    token,
                    account: caller,
                    balance,
                    required: amount,
                }
                .into());
            }
        }
        market.debit_escrow(payout)?;
        market.redeemed_collateral += payout;

        self.tokens
            .burn(rwtxn, market.yes_token, escrow, caller, amount)?;
        self.tokens.burn(rwtxn, market.no_token, escrow, caller, amount)?;
        self.tokens.transfer(
            rwtxn,
            market.collateral_asset,
            escrow,
            caller,
            payout,
        )?;
        self.markets.put(rwtxn, &market_id, &market)?;
        self.events.emit(
            rwtxn,
            Event::CollateralRedeemed {
                market_id,
                account: caller,
                claim_amount: amount,
                collateral_amount: payout,
            },
        )?;
        tracing::debug!(
            %market_id,
            account = %caller,
            amount,
            payout,
            "redeemed collateral"
        );
        Ok(payout)
    }

    /// Burn the caller's full winning balance for collateral. Returns the
    /// collateral paid.
    pub fn claim_winnings(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        market_id: MarketId,
    ) -> Result<u128, Error> {
        let escrow = self.config(rwtxn)?.escrow;
        let mut market = self.get_market(rwtxn, market_id)?;
        market.require_state(MarketState::Resolved)?;
        if self.has_claimed(rwtxn, market_id, caller)? {
            tracing::warn!(%market_id, account = %caller, "repeated claim");
            return Err(MarketError::AlreadyClaimed {
                market_id,
                account: caller,
            }
            .into());
        }
        let Some(side) = market.winning_side() else {
            return Err(MarketError::WrongState {
                market_id,
                expected: MarketState::Resolved,
                actual: market.state,
            }
            .into());
        };
        let token = market.claim_token(side);
        let balance = self.tokens.balance_of(rwtxn, token, caller)?;
        if balance == 0 {
            return Err(MarketError::NothingToClaim {
                market_id,
                account: caller,
            }
            .into());
        }
        let payout = market.scale.claims_to_collateral(balance, Rounding::Down);
        if payout == 0 {
            return Err(MarketError::DustAmount { amount: balance }.into());
        }
        market.debit_escrow(payout)?;
        market.claimed_tokens += payout;

        self.tokens.burn(rwtxn, token, escrow, caller, balance)?;
        self.tokens.transfer(
            rwtxn,
            market.collateral_asset,
            escrow,
            caller,
            payout,
        )?;
        self.claims.put(
            rwtxn,
            &(market_id, caller),
            &ClaimRecord {
                claim_amount: balance,
                collateral_amount: payout,
            },
        )?;
        self.markets.put(rwtxn, &market_id, &market)?;
        self.events.emit(
            rwtxn,
            Event::WinningsClaimed {
                market_id,
                account: caller,
                side,
                claim_amount: balance,
                collateral_amount: payout,
            },
        )?;
        tracing::info!(
            %market_id,
            account = %caller,
            %side,
            payout,
            "claimed winnings"
        );
        Ok(payout)
    }

    pub fn dispute_resolution(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        market_id: MarketId,
    ) -> Result<(), Error> {
        let mut market = self.get_market(rwtxn, market_id)?;
        let old_state = market.state;
        market.transition(MarketState::Disputed)?;
        self.put_transitioned(rwtxn, &market, old_state)?;
        self.events.emit(
            rwtxn,
            Event::MarketDisputed {
                market_id,
                disputant: caller,
            },
        )?;
        tracing::warn!(
            %market_id,
            disputant = %caller,
            from = %old_state,
            "market disputed"
        );
        Ok(())
    }

    /// Quote buying `side` with `collateral_in`, using the market's escrow
    /// as curve liquidity
    pub fn quote_outcome_purchase(
        &self,
        rotxn: &RoTxn,
        market_id: MarketId,
        side: Side,
        collateral_in: u128,
    ) -> Result<OutcomeQuote, Error> {
        let market = self.get_market(rotxn, market_id)?;
        market.require_state(MarketState::Active)?;
        let liquidity =
            market.scale.collateral_to_claims(market.total_collateral)?;
        let claims_in = market.scale.collateral_to_claims(collateral_in)?;
        let claims_out =
            normal_curve::compute_output_amount(claims_in, liquidity)?;
        let price_impact_bps = normal_curve::compute_price_impact(
            claims_in, claims_out, liquidity,
        )?;
        Ok(OutcomeQuote {
            side,
            collateral_in,
            claims_in,
            claims_out,
            price_impact_bps,
        })
    }
}

impl SettlementTarget for MarketLedger {
    fn callback_address(&self, rotxn: &RoTxn) -> Result<Address, Error> {
        Ok(self.config(rotxn)?.escrow)
    }

    fn settle(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        task_index: TaskIndex,
        market_id: MarketId,
        outcome: bool,
    ) -> Result<(), Error> {
        let market = self.get_market(rwtxn, market_id)?;
        if market.resolution_task != Some(task_index) {
            return Err(MarketError::WrongResolutionTask {
                market_id,
                expected: market.resolution_task,
                actual: task_index,
            }
            .into());
        }
        self.resolve_market(rwtxn, caller, market_id, outcome)
    }

    fn settled_outcome(
        &self,
        rotxn: &RoTxn,
        market_id: MarketId,
    ) -> Result<Option<bool>, Error> {
        let market = self.get_market(rotxn, market_id)?;
        Ok(match market.state {
            MarketState::Resolved => market.outcome,
            _ => None,
        })
    }
}
