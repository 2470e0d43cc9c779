use std::path::Path;

use heed::{
    Env, RoTxn, RwTxn,
    types::{SerdeBincode, Str},
};

use crate::{
    config::Config,
    types::Address,
};

pub mod agents;
pub mod amm;
pub mod consensus;
pub mod error;
pub mod events;
pub mod markets;
pub mod registry;
pub mod tokens;

use agents::{AgentStatus, Agents};
use amm::AmmVenue;
use consensus::{
    ConsensusEngine, ResponseReceipt, RewardPayout, SettlementReport,
    TaskIndex,
};
pub use error::Error;
use events::EventLog;
use markets::{CreateMarketParams, MarketId, MarketLedger};
use registry::Registry;
use tokens::{TokenId, Tokens};

/// Table with bincode-encoded keys and values
pub type Db<K, V> = heed::Database<SerdeBincode<K>, SerdeBincode<V>>;

/// Table of named singleton values
pub type Singleton<V> = heed::Database<Str, SerdeBincode<V>>;

/// Run `f` in a transaction nested in `rwtxn`. The nested transaction is
/// committed if `f` succeeds and aborted otherwise, leaving `rwtxn`
/// untouched.
pub fn with_nested_txn<T, F>(
    env: &Env,
    rwtxn: &mut RwTxn,
    f: F,
) -> Result<T, Error>
where
    F: FnOnce(&mut RwTxn) -> Result<T, Error>,
{
    let mut child = env.nested_write_txn(rwtxn)?;
    match f(&mut child) {
        Ok(value) => {
            child.commit()?;
            Ok(value)
        }
        Err(err) => {
            child.abort();
            Err(err)
        }
    }
}

/// All components, opened over one LMDB environment.
///
/// Every mutating method runs in a nested transaction, so an operation
/// that fails leaves no partial effects in the caller's transaction.
#[derive(Clone)]
pub struct State {
    env: Env,
    events: EventLog,
    tokens: Tokens,
    agents: Agents,
    registry: Registry,
    consensus: ConsensusEngine,
    markets: MarketLedger,
}

impl State {
    pub const NUM_DBS: u32 = EventLog::NUM_DBS
        + Tokens::NUM_DBS
        + Agents::NUM_DBS
        + Registry::NUM_DBS
        + ConsensusEngine::NUM_DBS
        + MarketLedger::NUM_DBS;

    /// Open (or create) the environment at `path`
    pub fn open(path: &Path, config: &Config) -> Result<Self, Error> {
        std::fs::create_dir_all(path)?;
        let env = {
            let mut env_open_opts = heed::EnvOpenOptions::new();
            env_open_opts
                .map_size(config.map_size)
                .max_dbs(Self::NUM_DBS);
            unsafe { env_open_opts.open(path) }?
        };
        tracing::debug!(path = %path.display(), "opened environment");
        Self::new(env, config)
    }

    /// Create all tables and store configuration. Configuration already
    /// present in the environment is kept.
    pub fn new(env: Env, config: &Config) -> Result<Self, Error> {
        config.validate()?;
        let mut rwtxn = env.write_txn()?;
        let events = EventLog::new(&env, &mut rwtxn)?;
        let tokens = Tokens::new(&env, &mut rwtxn)?;
        let agents = Agents::new(&env, &mut rwtxn)?;
        let registry = Registry::new(&env, &mut rwtxn, events.clone())?;
        let consensus = ConsensusEngine::new(
            &env,
            &mut rwtxn,
            registry.clone(),
            events.clone(),
        )?;
        let markets = MarketLedger::new(
            &env,
            &mut rwtxn,
            tokens.clone(),
            consensus.clone(),
            events.clone(),
        )?;
        registry.initialize(&mut rwtxn, &config.registry_config())?;
        consensus.initialize(
            &mut rwtxn,
            &config.consensus_config(),
            &config.consensus,
            &config.test_operators,
        )?;
        markets.initialize(&mut rwtxn, &config.ledger_config())?;
        rwtxn.commit()?;
        Ok(Self {
            env,
            events,
            tokens,
            agents,
            registry,
            consensus,
            markets,
        })
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn read_txn(&self) -> Result<RoTxn<'_>, Error> {
        Ok(self.env.read_txn()?)
    }

    pub fn write_txn(&self) -> Result<RwTxn<'_>, Error> {
        Ok(self.env.write_txn()?)
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn tokens(&self) -> &Tokens {
        &self.tokens
    }

    pub fn agents(&self) -> &Agents {
        &self.agents
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn consensus(&self) -> &ConsensusEngine {
        &self.consensus
    }

    pub fn markets(&self) -> &MarketLedger {
        &self.markets
    }

    fn atomically<T, F>(&self, rwtxn: &mut RwTxn, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut RwTxn) -> Result<T, Error>,
    {
        with_nested_txn(&self.env, rwtxn, f)
    }

    pub fn create_market_and_deposit_collateral(
        &self,
        rwtxn: &mut RwTxn,
        venue: &dyn AmmVenue,
        params: CreateMarketParams,
        now: u64,
    ) -> Result<MarketId, Error> {
        self.atomically(rwtxn, |rwtxn| {
            self.markets
                .create_market_and_deposit_collateral(rwtxn, venue, params, now)
        })
    }

    pub fn mint_outcome_tokens(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        market_id: MarketId,
        collateral_amount: u128,
        collateral_asset: TokenId,
    ) -> Result<u128, Error> {
        self.atomically(rwtxn, |rwtxn| {
            self.markets.mint_outcome_tokens(
                rwtxn,
                caller,
                market_id,
                collateral_amount,
                collateral_asset,
            )
        })
    }

    pub fn close_market(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        market_id: MarketId,
        now: u64,
    ) -> Result<(), Error> {
        self.atomically(rwtxn, |rwtxn| {
            self.markets.close_market(rwtxn, caller, market_id, now)
        })
    }

    pub fn enter_resolution(
        &self,
        rwtxn: &mut RwTxn,
        market_id: MarketId,
        now: u64,
    ) -> Result<TaskIndex, Error> {
        self.atomically(rwtxn, |rwtxn| {
            self.markets.enter_resolution(rwtxn, market_id, now)
        })
    }

    pub fn resolve_market(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        market_id: MarketId,
        outcome: bool,
    ) -> Result<(), Error> {
        self.atomically(rwtxn, |rwtxn| {
            self.markets.resolve_market(rwtxn, caller, market_id, outcome)
        })
    }

    pub fn cancel_market(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        market_id: MarketId,
    ) -> Result<(), Error> {
        self.atomically(rwtxn, |rwtxn| {
            self.markets.cancel_market(rwtxn, caller, market_id)
        })
    }

    pub fn redeem_collateral(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        market_id: MarketId,
        amount: u128,
    ) -> Result<u128, Error> {
        self.atomically(rwtxn, |rwtxn| {
            self.markets
                .redeem_collateral(rwtxn, caller, market_id, amount)
        })
    }

    pub fn claim_winnings(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        market_id: MarketId,
    ) -> Result<u128, Error> {
        self.atomically(rwtxn, |rwtxn| {
            self.markets.claim_winnings(rwtxn, caller, market_id)
        })
    }

    pub fn dispute_resolution(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        market_id: MarketId,
    ) -> Result<(), Error> {
        self.atomically(rwtxn, |rwtxn| {
            self.markets.dispute_resolution(rwtxn, caller, market_id)
        })
    }

    pub fn register_agent(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        agent: Address,
        now: u64,
    ) -> Result<(), Error> {
        self.atomically(rwtxn, |rwtxn| {
            self.registry
                .register_agent(rwtxn, caller, agent, &self.agents, now)
        })
    }

    pub fn unregister_agent(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        agent: Address,
    ) -> Result<(), Error> {
        self.atomically(rwtxn, |rwtxn| {
            self.registry.unregister_agent(rwtxn, caller, agent)
        })
    }

    pub fn update_agent_status(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        agent: Address,
        status: AgentStatus,
    ) -> Result<(), Error> {
        self.atomically(rwtxn, |rwtxn| {
            self.registry.update_agent_status(
                rwtxn,
                caller,
                agent,
                status,
                &self.agents,
            )
        })
    }

    pub fn update_agent_stats(
        &self,
        rwtxn: &mut RwTxn,
        agent: Address,
    ) -> Result<agents::AgentStats, Error> {
        self.atomically(rwtxn, |rwtxn| {
            self.registry.update_agent_stats(rwtxn, agent, &self.agents)
        })
    }

    pub fn create_new_task(
        &self,
        rwtxn: &mut RwTxn,
        name: &str,
        now: u64,
    ) -> Result<TaskIndex, Error> {
        self.atomically(rwtxn, |rwtxn| {
            self.consensus.create_new_task(rwtxn, name, now)
        })
    }

    /// Respond to a task. A finalized market task settles against the
    /// market ledger.
    pub fn respond_to_task(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        task_index: TaskIndex,
        response: &[u8],
    ) -> Result<ResponseReceipt, Error> {
        self.atomically(rwtxn, |rwtxn| {
            let receipt = self.consensus.respond_to_task(
                &self.env,
                rwtxn,
                caller,
                task_index,
                response,
                &self.markets,
            )?;
            self.agents.record_response(rwtxn, caller)?;
            Ok(receipt)
        })
    }

    pub fn distribute_rewards(
        &self,
        rwtxn: &mut RwTxn,
        task_index: TaskIndex,
    ) -> Result<Vec<RewardPayout>, Error> {
        self.atomically(rwtxn, |rwtxn| {
            let payouts = self.consensus.distribute_rewards(rwtxn, task_index)?;
            for payout in &payouts {
                self.agents
                    .record_reward(rwtxn, payout.agent, payout.amount)?;
            }
            Ok(payouts)
        })
    }

    pub fn retry_settlement(
        &self,
        rwtxn: &mut RwTxn,
        task_index: TaskIndex,
    ) -> Result<SettlementReport, Error> {
        self.atomically(rwtxn, |rwtxn| {
            self.consensus.retry_settlement(
                &self.env,
                rwtxn,
                task_index,
                &self.markets,
            )
        })
    }

    pub fn update_consensus_parameters(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        minimum_responses: u32,
        consensus_threshold: u32,
    ) -> Result<(), Error> {
        self.atomically(rwtxn, |rwtxn| {
            self.consensus.update_consensus_parameters(
                rwtxn,
                caller,
                minimum_responses,
                consensus_threshold,
            )
        })
    }

    pub fn add_test_operator(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        operator: Address,
    ) -> Result<(), Error> {
        self.atomically(rwtxn, |rwtxn| {
            self.consensus.add_test_operator(rwtxn, caller, operator)
        })
    }

    pub fn remove_test_operator(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        operator: Address,
    ) -> Result<(), Error> {
        self.atomically(rwtxn, |rwtxn| {
            self.consensus.remove_test_operator(rwtxn, caller, operator)
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use heed::Env;
    use tempfile::TempDir;

    use super::*;

    pub(crate) fn test_env() -> (TempDir, Env) {
        let dir = tempfile::tempdir().unwrap();
        let env = {
            let mut env_open_opts = heed::EnvOpenOptions::new();
            env_open_opts.map_size(16 * 1024 * 1024).max_dbs(State::NUM_DBS);
            unsafe { env_open_opts.open(dir.path()) }.unwrap()
        };
        (dir, env)
    }

    #[test]
    fn nested_txn_aborts_on_error() {
        let (_dir, env) = test_env();
        let mut rwtxn = env.write_txn().unwrap();
        let events = EventLog::new(&env, &mut rwtxn).unwrap();
        let res: Result<(), Error> = with_nested_txn(&env, &mut rwtxn, |child| {
            events.emit(
                child,
                events::Event::RewardAmountUpdated { amount: 1 },
            )?;
            Err(Error::NotInitialized { component: "test" })
        });
        assert!(res.is_err());
        assert!(events.is_empty(&rwtxn).unwrap());

        with_nested_txn(&env, &mut rwtxn, |child| {
            events.emit(
                child,
                events::Event::RewardAmountUpdated { amount: 2 },
            )
        })
        .unwrap();
        assert_eq!(events.len(&rwtxn).unwrap(), 1);
    }
}
