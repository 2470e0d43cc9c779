#![allow(dead_code)]

use oracle_markets::{
    config::Config,
    heed::RwTxn,
    state::{
        State,
        agents::{AgentProfile, ModelDescriptor},
        amm::{DeterministicVenue, PoolSettings},
        consensus::ConsensusParams,
        events::Event,
        markets::{CreateMarketParams, MarketId},
    },
    types::Address,
};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub const LEDGER_OWNER: Address = Address([0x01; 20]);
pub const ESCROW: Address = Address([0x02; 20]);
pub const ENGINE: Address = Address([0x03; 20]);
pub const REGISTRY_OWNER: Address = Address([0x04; 20]);
pub const CONSENSUS_OWNER: Address = Address([0x05; 20]);
pub const FAUCET: Address = Address([0x06; 20]);
pub const TEST_OPERATOR: Address = Address([0x07; 20]);
pub const CREATOR: Address = Address([0x10; 20]);
pub const ORACLE: Address = Address([0x11; 20]);
pub const ALICE: Address = Address([0x12; 20]);
pub const BOB: Address = Address([0x13; 20]);

/// 6-decimal collateral
pub const USDC: Address = Address([0xc0; 20]);
pub const USDC_DECIMALS: u8 = 6;
/// Claim units per collateral unit
pub const SCALE: u128 = 1_000_000_000_000;

pub const NOW: u64 = 1_700_000_000;
pub const DURATION: u64 = 86_400;

pub fn init_tracing() {
    let _installed = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .is_ok();
}

pub fn config(consensus: ConsensusParams) -> Config {
    Config {
        ledger_owner: LEDGER_OWNER,
        escrow: ESCROW,
        settlement_engine: ENGINE,
        registry_owner: REGISTRY_OWNER,
        consensus_owner: CONSENSUS_OWNER,
        consensus,
        test_operators: vec![TEST_OPERATOR],
        map_size: 64 * 1024 * 1024,
    }
}

pub struct Fixture {
    _dir: TempDir,
    pub state: State,
}

impl Fixture {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_params(ConsensusParams {
            minimum_responses: 1,
            consensus_threshold: 10_000,
            reward_amount: 100,
        })
    }

    pub fn with_params(params: ConsensusParams) -> anyhow::Result<Self> {
        init_tracing();
        let dir = tempfile::tempdir()?;
        let state = State::open(dir.path(), &config(params))?;
        let mut rwtxn = state.write_txn()?;
        state.tokens().create_token(
            &mut rwtxn,
            USDC,
            "USDC",
            USDC_DECIMALS,
            FAUCET,
        )?;
        rwtxn.commit()?;
        Ok(Self { _dir: dir, state })
    }

    /// Mint collateral to `account` and approve the escrow to pull it
    pub fn fund(
        &self,
        rwtxn: &mut RwTxn,
        account: Address,
        amount: u128,
    ) -> anyhow::Result<()> {
        let tokens = self.state.tokens();
        tokens.mint(rwtxn, USDC, FAUCET, account, amount)?;
        let allowance = tokens.allowance(rwtxn, USDC, account, ESCROW)?;
        tokens.approve(rwtxn, USDC, account, ESCROW, allowance + amount)?;
        Ok(())
    }

    pub fn create_market(
        &self,
        rwtxn: &mut RwTxn,
        collateral_amount: u128,
    ) -> anyhow::Result<MarketId> {
        self.fund(rwtxn, CREATOR, collateral_amount)?;
        let market_id = self.state.create_market_and_deposit_collateral(
            rwtxn,
            &DeterministicVenue,
            market_params(collateral_amount),
            NOW,
        )?;
        Ok(market_id)
    }

    /// Create a market and drive it into resolution
    pub fn market_in_resolution(
        &self,
        rwtxn: &mut RwTxn,
        collateral_amount: u128,
    ) -> anyhow::Result<MarketId> {
        let market_id = self.create_market(rwtxn, collateral_amount)?;
        self.state
            .close_market(rwtxn, ALICE, market_id, NOW + DURATION + 1)?;
        self.state
            .enter_resolution(rwtxn, market_id, NOW + DURATION + 2)?;
        Ok(market_id)
    }

    /// Publish an agent profile bound to the engine and register it
    pub fn register_agent(
        &self,
        rwtxn: &mut RwTxn,
        byte: u8,
    ) -> anyhow::Result<Address> {
        let agent = Address([byte; 20]);
        let model = ModelDescriptor {
            name: format!("agent-{byte}"),
            version: "1.0".to_owned(),
        };
        self.state
            .agents()
            .deploy(rwtxn, agent, AgentProfile::new(model))?;
        self.state
            .agents()
            .bind_settlement_engine(rwtxn, agent, ENGINE)?;
        self.state
            .register_agent(rwtxn, REGISTRY_OWNER, agent, NOW)?;
        Ok(agent)
    }

    pub fn events(&self, rwtxn: &RwTxn) -> anyhow::Result<Vec<Event>> {
        Ok(self
            .state
            .events()
            .all(rwtxn)?
            .into_iter()
            .map(|logged| logged.event)
            .collect())
    }
}

pub fn market_params(collateral_amount: u128) -> CreateMarketParams {
    CreateMarketParams {
        oracle: ORACLE,
        creator: CREATOR,
        collateral_asset: USDC,
        collateral_amount,
        title: "Will it rain in Lisbon tomorrow?".to_owned(),
        description: "Resolves YES on any measurable rainfall".to_owned(),
        duration: DURATION,
        settings: PoolSettings::default(),
    }
}
