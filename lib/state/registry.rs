//! Agent registry.
//!
//! Keeps the set of recognized agents and a cached snapshot of their
//! metadata. Cached stats are only refreshed by
//! [`Registry::update_agent_stats`], and are stale in between.

use heed::{Env, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    authorization::OwnerPolicy,
    state::{
        Db, Error, Singleton,
        agents::{AgentContract, AgentStats, AgentStatus, ModelDescriptor},
        events::{Event, EventLog},
    },
    types::Address,
};

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    #[error("agent {agent} is already registered")]
    AlreadyRegistered { agent: Address },
    #[error("agent {agent} has no settlement engine binding")]
    MissingSettlementEngine { agent: Address },
    #[error("agent {agent} is not registered")]
    NotRegistered { agent: Address },
    #[error("zero address")]
    ZeroAddress,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RegistryConfig {
    pub owner: OwnerPolicy,
}

/// Cached view of a registered agent
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RegisteredAgent {
    pub address: Address,
    /// Snapshot taken at registration
    pub model: ModelDescriptor,
    pub stats: AgentStats,
    pub status: AgentStatus,
    pub registered_at: u64,
}

#[derive(Clone)]
pub struct Registry {
    config: Singleton<RegistryConfig>,
    agents: Db<Address, RegisteredAgent>,
    /// Enumerable list of registered agents. Order is not preserved across
    /// removals.
    agent_list: Singleton<Vec<Address>>,
    events: EventLog,
}

impl Registry {
    pub const NUM_DBS: u32 = 3;

    const CONFIG_KEY: &'static str = "config";
    const AGENT_LIST_KEY: &'static str = "agents";

    pub fn new(
        env: &Env,
        rwtxn: &mut RwTxn,
        events: EventLog,
    ) -> Result<Self, Error> {
        let config = env.create_database(rwtxn, Some("registry_config"))?;
        let agents = env.create_database(rwtxn, Some("registry_agents"))?;
        let agent_list =
            env.create_database(rwtxn, Some("registry_agent_list"))?;
        Ok(Self {
            config,
            agents,
            agent_list,
            events,
        })
    }

    /// Set the configuration if none is stored yet
    pub fn initialize(
        &self,
        rwtxn: &mut RwTxn,
        config: &RegistryConfig,
    ) -> Result<(), Error> {
        if self.config.get(rwtxn, Self::CONFIG_KEY)?.is_none() {
            self.config.put(rwtxn, Self::CONFIG_KEY, config)?;
        }
        Ok(())
    }

    pub fn config(&self, rotxn: &RoTxn) -> Result<RegistryConfig, Error> {
        self.config
            .get(rotxn, Self::CONFIG_KEY)?
            .ok_or(Error::NotInitialized {
                component: "registry",
            })
    }

    fn agent_list(&self, rotxn: &RoTxn) -> Result<Vec<Address>, Error> {
        Ok(self
            .agent_list
            .get(rotxn, Self::AGENT_LIST_KEY)?
            .unwrap_or_default())
    }

    pub fn is_registered(
        &self,
        rotxn: &RoTxn,
        agent: Address,
    ) -> Result<bool, Error> {
        Ok(self.agents.get(rotxn, &agent)?.is_some())
    }

    pub fn get_agent_count(&self, rotxn: &RoTxn) -> Result<usize, Error> {
        Ok(self.agent_list(rotxn)?.len())
    }

    pub fn get_all_agents(&self, rotxn: &RoTxn) -> Result<Vec<Address>, Error> {
        self.agent_list(rotxn)
    }

    pub fn get_agent_details(
        &self,
        rotxn: &RoTxn,
        agent: Address,
    ) -> Result<RegisteredAgent, Error> {
        self.agents
            .get(rotxn, &agent)?
            .ok_or_else(|| RegistryError::NotRegistered { agent }.into())
    }

    pub fn register_agent(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        agent: Address,
        contract: &dyn AgentContract,
        now: u64,
    ) -> Result<(), Error> {
        self.config(rwtxn)?.owner.check(caller)?;
        if agent.is_zero() {
            return Err(RegistryError::ZeroAddress.into());
        }
        if self.is_registered(rwtxn, agent)? {
            return Err(RegistryError::AlreadyRegistered { agent }.into());
        }
        match contract.settlement_engine(rwtxn, agent)? {
            Some(engine) if !engine.is_zero() => (),
            _ => {
                return Err(
                    RegistryError::MissingSettlementEngine { agent }.into()
                );
            }
        }
        let registered = RegisteredAgent {
            address: agent,
            model: contract.model(rwtxn, agent)?,
            stats: AgentStats::default(),
            status: contract.status(rwtxn, agent)?,
            registered_at: now,
        };
        self.agents.put(rwtxn, &agent, &registered)?;
        let mut agent_list = self.agent_list(rwtxn)?;
        agent_list.push(agent);
        self.agent_list
            .put(rwtxn, Self::AGENT_LIST_KEY, &agent_list)?;
        self.events.emit(rwtxn, Event::AgentRegistered { agent })?;
        tracing::info!(
            %agent,
            model = %registered.model.name,
            "registered agent"
        );
        Ok(())
    }

    pub fn unregister_agent(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        agent: Address,
    ) -> Result<(), Error> {
        self.config(rwtxn)?.owner.check(caller)?;
        if !self.agents.delete(rwtxn, &agent)? {
            return Err(RegistryError::NotRegistered { agent }.into());
        }
        let mut agent_list = self.agent_list(rwtxn)?;
        if let Some(idx) = agent_list.iter().position(|a| *a == agent) {
            agent_list.swap_remove(idx);
        }
        self.agent_list
            .put(rwtxn, Self::AGENT_LIST_KEY, &agent_list)?;
        self.events.emit(rwtxn, Event::AgentUnregistered { agent })?;
        tracing::info!(%agent, "unregistered agent");
        Ok(())
    }

    /// Forward a status change to the agent and mirror it into the cache
    pub fn update_agent_status(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        agent: Address,
        status: AgentStatus,
        contract: &dyn AgentContract,
    ) -> Result<(), Error> {
        self.config(rwtxn)?.owner.check(caller)?;
        let mut registered = self.get_agent_details(rwtxn, agent)?;
        contract.set_status(rwtxn, agent, status)?;
        registered.status = status;
        self.agents.put(rwtxn, &agent, &registered)?;
        self.events
            .emit(rwtxn, Event::AgentStatusUpdated { agent, status })?;
        tracing::info!(%agent, %status, "updated agent status");
        Ok(())
    }

    /// Pull the agent's live stats into the cache. Callable by anyone.
    pub fn update_agent_stats(
        &self,
        rwtxn: &mut RwTxn,
        agent: Address,
        contract: &dyn AgentContract,
    ) -> Result<AgentStats, Error> {
        let mut registered = self.get_agent_details(rwtxn, agent)?;
        registered.stats = contract.stats(rwtxn, agent)?;
        self.agents.put(rwtxn, &agent, &registered)?;
        self.events.emit(rwtxn, Event::AgentStatsUpdated { agent })?;
        tracing::debug!(
            %agent,
            stats = ?registered.stats,
            "refreshed agent stats"
        );
        Ok(registered.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        authorization::AuthorizationError,
        state::{
            agents::{AgentProfile, Agents},
            tests::test_env,
        },
    };

    const OWNER: Address = Address([0xaa; 20]);
    const ENGINE: Address = Address([0xee; 20]);

    fn setup(env: &Env, rwtxn: &mut RwTxn) -> (Registry, Agents) {
        let events = EventLog::new(env, rwtxn).unwrap();
        let registry = Registry::new(env, rwtxn, events).unwrap();
        registry
            .initialize(
                rwtxn,
                &RegistryConfig {
                    owner: OwnerPolicy::new(OWNER),
                },
            )
            .unwrap();
        let agents = Agents::new(env, rwtxn).unwrap();
        (registry, agents)
    }

    fn deploy(rwtxn: &mut RwTxn, agents: &Agents, agent: Address, bind: bool) {
        let model = ModelDescriptor {
            name: "model".into(),
            version: "v1".into(),
        };
        agents
            .deploy(rwtxn, agent, AgentProfile::new(model))
            .unwrap();
        if bind {
            agents.bind_settlement_engine(rwtxn, agent, ENGINE).unwrap();
        }
    }

    #[test]
    fn registration_requires_owner_and_binding() {
        let (_dir, env) = test_env();
        let mut rwtxn = env.write_txn().unwrap();
        let (registry, agents) = setup(&env, &mut rwtxn);
        let (bound, unbound) = (Address([1; 20]), Address([2; 20]));
        deploy(&mut rwtxn, &agents, bound, true);
        deploy(&mut rwtxn, &agents, unbound, false);

        let err =
            registry.register_agent(&mut rwtxn, bound, bound, &agents, 1);
        assert!(matches!(
            err,
            Err(Error::Authorization(AuthorizationError::NotOwner { .. }))
        ));
        let err =
            registry.register_agent(&mut rwtxn, OWNER, unbound, &agents, 1);
        assert!(matches!(
            err,
            Err(Error::Registry(
                RegistryError::MissingSettlementEngine { .. }
            ))
        ));
        let err = registry.register_agent(
            &mut rwtxn,
            OWNER,
            Address::ZERO,
            &agents,
            1,
        );
        assert!(matches!(
            err,
            Err(Error::Registry(RegistryError::ZeroAddress))
        ));

        registry
            .register_agent(&mut rwtxn, OWNER, bound, &agents, 1)
            .unwrap();
        assert!(registry.is_registered(&rwtxn, bound).unwrap());
        assert!(!registry.is_registered(&rwtxn, unbound).unwrap());
        let err =
            registry.register_agent(&mut rwtxn, OWNER, bound, &agents, 2);
        assert!(matches!(
            err,
            Err(Error::Registry(RegistryError::AlreadyRegistered { .. }))
        ));
    }

    #[test]
    fn unregister_swap_removes() {
        let (_dir, env) = test_env();
        let mut rwtxn = env.write_txn().unwrap();
        let (registry, agents) = setup(&env, &mut rwtxn);
        let addrs: Vec<Address> = (1..=3).map(|b| Address([b; 20])).collect();
        for agent in &addrs {
            deploy(&mut rwtxn, &agents, *agent, true);
            registry
                .register_agent(&mut rwtxn, OWNER, *agent, &agents, 0)
                .unwrap();
        }
        registry.unregister_agent(&mut rwtxn, OWNER, addrs[0]).unwrap();
        assert_eq!(registry.get_agent_count(&rwtxn).unwrap(), 2);
        assert_eq!(
            registry.get_all_agents(&rwtxn).unwrap(),
            vec![addrs[2], addrs[1]]
        );
        assert!(matches!(
            registry.unregister_agent(&mut rwtxn, OWNER, addrs[0]),
            Err(Error::Registry(RegistryError::NotRegistered { .. }))
        ));
    }

    #[test]
    fn cached_stats_are_stale_until_refreshed() {
        let (_dir, env) = test_env();
        let mut rwtxn = env.write_txn().unwrap();
        let (registry, agents) = setup(&env, &mut rwtxn);
        let agent = Address([1; 20]);
        deploy(&mut rwtxn, &agents, agent, true);
        registry
            .register_agent(&mut rwtxn, OWNER, agent, &agents, 0)
            .unwrap();

        agents.record_response(&mut rwtxn, agent).unwrap();
        let cached = registry.get_agent_details(&rwtxn, agent).unwrap();
        assert_eq!(cached.stats.tasks_completed, 0);

        // anyone may refresh
        let stats = registry
            .update_agent_stats(&mut rwtxn, agent, &agents)
            .unwrap();
        assert_eq!(stats.tasks_completed, 1);
        let cached = registry.get_agent_details(&rwtxn, agent).unwrap();
        assert_eq!(cached.stats.tasks_completed, 1);
    }

    #[test]
    fn status_is_forwarded_to_agent() {
        let (_dir, env) = test_env();
        let mut rwtxn = env.write_txn().unwrap();
        let (registry, agents) = setup(&env, &mut rwtxn);
        let agent = Address([1; 20]);
        deploy(&mut rwtxn, &agents, agent, true);
        registry
            .register_agent(&mut rwtxn, OWNER, agent, &agents, 0)
            .unwrap();
        registry
            .update_agent_status(
                &mut rwtxn,
                OWNER,
                agent,
                AgentStatus::Suspended,
                &agents,
            )
            .unwrap();
        assert_eq!(
            agents.status(&rwtxn, agent).unwrap(),
            AgentStatus::Suspended
        );
        assert_eq!(
            registry.get_agent_details(&rwtxn, agent).unwrap().status,
            AgentStatus::Suspended
        );
    }
}
