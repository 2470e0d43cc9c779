//! Agent-side state.
//!
//! Agents are external identities. Each one owns a profile holding the
//! settlement engine it is bound to, its model descriptor, live statistics
//! and operational status. The registry only ever reads these through
//! [`AgentContract`], and may hold a stale copy.

use heed::{Env, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};
use thiserror::Error;

use crate::{
    state::{Db, Error},
    types::Address,
};

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    EnumIter,
    Eq,
    Hash,
    PartialEq,
    Serialize,
)]
pub enum AgentStatus {
    #[default]
    Active,
    Suspended,
    Inactive,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub version: String,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct AgentStats {
    pub tasks_completed: u64,
    pub consensus_participations: u64,
    pub total_rewards: u128,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AgentProfile {
    /// Consensus engine the agent answers to, if bound
    pub settlement_engine: Option<Address>,
    pub model: ModelDescriptor,
    pub status: AgentStatus,
    pub stats: AgentStats,
}

impl AgentProfile {
    pub fn new(model: ModelDescriptor) -> Self {
        Self {
            settlement_engine: None,
            model,
            status: AgentStatus::default(),
            stats: AgentStats::default(),
        }
    }
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AgentError {
    #[error("agent {agent} already has a profile")]
    AlreadyDeployed { agent: Address },
    #[error("no agent profile for {agent}")]
    UnknownAgent { agent: Address },
    #[error("zero address")]
    ZeroAddress,
}

/// Read/write surface of an agent, as seen by the registry
pub trait AgentContract {
    fn settlement_engine(
        &self,
        rotxn: &RoTxn,
        agent: Address,
    ) -> Result<Option<Address>, Error>;

    fn model(
        &self,
        rotxn: &RoTxn,
        agent: Address,
    ) -> Result<ModelDescriptor, Error>;

    fn stats(&self, rotxn: &RoTxn, agent: Address)
    -> Result<AgentStats, Error>;

    fn status(
        &self,
        rotxn: &RoTxn,
        agent: Address,
    ) -> Result<AgentStatus, Error>;

    fn set_status(
        &self,
        rwtxn: &mut RwTxn,
        agent: Address,
        status: AgentStatus,
    ) -> Result<(), Error>;
}

#[derive(Clone)]
pub struct Agents {
    profiles: Db<Address, AgentProfile>,
}

impl Agents {
    pub const NUM_DBS: u32 = 1;

    pub fn new(env: &Env, rwtxn: &mut RwTxn) -> Result<Self, Error> {
        let profiles = env.create_database(rwtxn, Some("agent_profiles"))?;
        Ok(Self { profiles })
    }

    /// Publish a new agent profile
    pub fn deploy(
        &self,
        rwtxn: &mut RwTxn,
        agent: Address,
        profile: AgentProfile,
    ) -> Result<(), Error> {
        if agent.is_zero() {
            return Err(AgentError::ZeroAddress.into());
        }
        if self.profiles.get(rwtxn, &agent)?.is_some() {
            return Err(AgentError::AlreadyDeployed { agent }.into());
        }
        self.profiles.put(rwtxn, &agent, &profile)?;
        tracing::debug!(%agent, model = %profile.model.name, "deployed agent");
        Ok(())
    }

    pub fn try_get_profile(
        &self,
        rotxn: &RoTxn,
        agent: Address,
    ) -> Result<Option<AgentProfile>, Error> {
        Ok(self.profiles.get(rotxn, &agent)?)
    }

    pub fn get_profile(
        &self,
        rotxn: &RoTxn,
        agent: Address,
    ) -> Result<AgentProfile, Error> {
        self.try_get_profile(rotxn, agent)?
            .ok_or_else(|| AgentError::UnknownAgent { agent }.into())
    }

    fn update_profile<F>(
        &self,
        rwtxn: &mut RwTxn,
        agent: Address,
        f: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut AgentProfile),
    {
        let mut profile = self.get_profile(rwtxn, agent)?;
        f(&mut profile);
        self.profiles.put(rwtxn, &agent, &profile)?;
        Ok(())
    }

    pub fn bind_settlement_engine(
        &self,
        rwtxn: &mut RwTxn,
        agent: Address,
        engine: Address,
    ) -> Result<(), Error> {
        self.update_profile(rwtxn, agent, |profile| {
            profile.settlement_engine = Some(engine)
        })
    }

    pub fn set_model(
        &self,
        rwtxn: &mut RwTxn,
        agent: Address,
        model: ModelDescriptor,
    ) -> Result<(), Error> {
        self.update_profile(rwtxn, agent, |profile| profile.model = model)
    }

    /// Count a completed task. Unknown agents (e.g. test operators) are
    /// ignored.
    pub fn record_response(
        &self,
        rwtxn: &mut RwTxn,
        agent: Address,
    ) -> Result<(), Error> {
        let Some(mut profile) = self.try_get_profile(rwtxn, agent)? else {
            return Ok(());
        };
        profile.stats.tasks_completed += 1;
        self.profiles.put(rwtxn, &agent, &profile)?;
        Ok(())
    }

    /// Count a consensus participation and the reward paid for it
    pub fn record_reward(
        &self,
        rwtxn: &mut RwTxn,
        agent: Address,
        amount: u128,
    ) -> Result<(), Error> {
        let Some(mut profile) = self.try_get_profile(rwtxn, agent)? else {
            return Ok(());
        };
        profile.stats.consensus_participations += 1;
        profile.stats.total_rewards =
            profile.stats.total_rewards.saturating_add(amount);
        self.profiles.put(rwtxn, &agent, &profile)?;
        Ok(())
    }
}

impl AgentContract for Agents {
    fn settlement_engine(
        &self,
        rotxn: &RoTxn,
        agent: Address,
    ) -> Result<Option<Address>, Error> {
        Ok(self.get_profile(rotxn, agent)?.settlement_engine)
    }

    fn model(
        &self,
        rotxn: &RoTxn,
        agent: Address,
    ) -> Result<ModelDescriptor, Error> {
        Ok(self.get_profile(rotxn, agent)?.model)
    }

    fn stats(
        &self,
        rotxn: &RoTxn,
        agent: Address,
    ) -> Result<AgentStats, Error> {
        Ok(self.get_profile(rotxn, agent)?.stats)
    }

    fn status(
        &self,
        rotxn: &RoTxn,
        agent: Address,
    ) -> Result<AgentStatus, Error> {
        Ok(self.get_profile(rotxn, agent)?.status)
    }

    fn set_status(
        &self,
        rwtxn: &mut RwTxn,
        agent: Address,
        status: AgentStatus,
    ) -> Result<(), Error> {
        self.update_profile(rwtxn, agent, |profile| profile.status = status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_env;

    #[test]
    fn records_stats_for_known_agents_only() {
        let (_dir, env) = test_env();
        let mut rwtxn = env.write_txn().unwrap();
        let agents = Agents::new(&env, &mut rwtxn).unwrap();
        let agent = Address([7; 20]);
        let model = ModelDescriptor {
            name: "gpt".into(),
            version: "1".into(),
        };
        agents
            .deploy(&mut rwtxn, agent, AgentProfile::new(model))
            .unwrap();
        agents.record_response(&mut rwtxn, agent).unwrap();
        agents.record_reward(&mut rwtxn, agent, 25).unwrap();
        agents.record_response(&mut rwtxn, Address([8; 20])).unwrap();

        let stats = agents.stats(&rwtxn, agent).unwrap();
        assert_eq!(
            stats,
            AgentStats {
                tasks_completed: 1,
                consensus_participations: 1,
                total_rewards: 25,
            }
        );
        assert!(
            agents
                .try_get_profile(&rwtxn, Address([8; 20]))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn deploy_twice_fails() {
        let (_dir, env) = test_env();
        let mut rwtxn = env.write_txn().unwrap();
        let agents = Agents::new(&env, &mut rwtxn).unwrap();
        let agent = Address([7; 20]);
        let profile = AgentProfile::new(ModelDescriptor::default());
        agents.deploy(&mut rwtxn, agent, profile.clone()).unwrap();
        assert!(matches!(
            agents.deploy(&mut rwtxn, agent, profile),
            Err(Error::Agent(AgentError::AlreadyDeployed { .. }))
        ));
    }
}
