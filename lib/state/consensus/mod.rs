//! Consensus engine.
//!
//! Agents answer tasks; once enough of them agree the task finalizes and,
//! for market tasks, the engine settles the linked market. Settlement runs
//! in a nested transaction that is aborted on failure, so a failing market
//! never unwinds a finalized task.

use heed::{Env, RoTxn, RwTxn};

use crate::{
    authorization::Responder,
    state::{
        Db, Error, Singleton,
        events::{Event, EventLog},
        markets::MarketId,
        registry::Registry,
        with_nested_txn,
    },
    types::Address,
};

mod types;

pub use types::{
    BPS_DENOMINATOR, ConsensusConfig, ConsensusError, ConsensusParams,
    MarketLink, NO_RESPONSE, ResponseHash, ResponseReceipt, RewardPayout,
    SettlementReport, Task, TaskIndex, TaskStatus, YES_RESPONSE,
};

/// Receiver of the engine's settlement call
pub trait SettlementTarget {
    /// Address tasks must name as their callback to settle on this target
    fn callback_address(&self, rotxn: &RoTxn) -> Result<Address, Error>;

    fn settle(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        task_index: TaskIndex,
        market_id: MarketId,
        outcome: bool,
    ) -> Result<(), Error>;

    /// Outcome already recorded for the market, if it is settled
    fn settled_outcome(
        &self,
        rotxn: &RoTxn,
        market_id: MarketId,
    ) -> Result<Option<bool>, Error>;
}

#[derive(Clone)]
pub struct ConsensusEngine {
    config: Singleton<ConsensusConfig>,
    params: Singleton<ConsensusParams>,
    task_count: Singleton<u32>,
    tasks: Db<TaskIndex, Task>,
    /// (task, response hash) -> votes
    votes: Db<(TaskIndex, ResponseHash), u32>,
    /// (task, respondent) -> response hash
    responses: Db<(TaskIndex, Address), ResponseHash>,
    /// Respondents of each task, in response order
    respondents: Db<TaskIndex, Vec<Address>>,
    test_operators: Db<Address, bool>,
    reward_balances: Db<Address, u128>,
    registry: Registry,
    events: EventLog,
}

impl ConsensusEngine {
    pub const NUM_DBS: u32 = 9;

    const CONFIG_KEY: &'static str = "config";
    const PARAMS_KEY: &'static str = "params";
    const TASK_COUNT_KEY: &'static str = "task_count";

    pub fn new(
        env: &Env,
        rwtxn: &mut RwTxn,
        registry: Registry,
        events: EventLog,
    ) -> Result<Self, Error> {
        let config = env.create_database(rwtxn, Some("consensus_config"))?;
        let params = env.create_database(rwtxn, Some("consensus_params"))?;
        let task_count =
            env.create_database(rwtxn, Some("consensus_task_count"))?;
        let tasks = env.create_database(rwtxn, Some("consensus_tasks"))?;
        let votes = env.create_database(rwtxn, Some("consensus_votes"))?;
        let responses =
            env.create_database(rwtxn, Some("consensus_responses"))?;
        let respondents =
            env.create_database(rwtxn, Some("consensus_respondents"))?;
        let test_operators =
            env.create_database(rwtxn, Some("consensus_test_operators"))?;
        let reward_balances =
            env.create_database(rwtxn, Some("consensus_reward_balances"))?;
        Ok(Self {
            config,
            params,
            task_count,
            tasks,
            votes,
            responses,
            respondents,
            test_operators,
            reward_balances,
            registry,
            events,
        })
    }

    /// Store configuration, parameters and bootstrap test operators if no
    /// configuration is stored yet
    pub fn initialize(
        &self,
        rwtxn: &mut RwTxn,
        config: &ConsensusConfig,
        params: &ConsensusParams,
        test_operators: &[Address],
    ) -> Result<(), Error> {
        if self.config.get(rwtxn, Self::CONFIG_KEY)?.is_some() {
            return Ok(());
        }
        params.validate()?;
        self.config.put(rwtxn, Self::CONFIG_KEY, config)?;
        self.params.put(rwtxn, Self::PARAMS_KEY, params)?;
        for operator in test_operators {
            self.test_operators.put(rwtxn, operator, &true)?;
        }
        Ok(())
    }

    pub fn config(&self, rotxn: &RoTxn) -> Result<ConsensusConfig, Error> {
        self.config
            .get(rotxn, Self::CONFIG_KEY)?
            .ok_or(Error::NotInitialized {
                component: "consensus engine",
            })
    }

    pub fn params(&self, rotxn: &RoTxn) -> Result<ConsensusParams, Error> {
        self.params
            .get(rotxn, Self::PARAMS_KEY)?
            .ok_or(Error::NotInitialized {
                component: "consensus engine",
            })
    }

    pub fn get_task_count(&self, rotxn: &RoTxn) -> Result<u32, Error> {
        Ok(self
            .task_count
            .get(rotxn, Self::TASK_COUNT_KEY)?
            .unwrap_or_default())
    }

    pub fn try_get_task(
        &self,
        rotxn: &RoTxn,
        task_index: TaskIndex,
    ) -> Result<Option<Task>, Error> {
        Ok(self.tasks.get(rotxn, &task_index)?)
    }

    pub fn get_task(
        &self,
        rotxn: &RoTxn,
        task_index: TaskIndex,
    ) -> Result<Task, Error> {
        self.try_get_task(rotxn, task_index)?
            .ok_or_else(|| ConsensusError::TaskNotFound { task_index }.into())
    }

    pub fn get_votes(
        &self,
        rotxn: &RoTxn,
        task_index: TaskIndex,
        response_hash: ResponseHash,
    ) -> Result<u32, Error> {
        Ok(self
            .votes
            .get(rotxn, &(task_index, response_hash))?
            .unwrap_or_default())
    }

    pub fn get_response(
        &self,
        rotxn: &RoTxn,
        task_index: TaskIndex,
        respondent: Address,
    ) -> Result<Option<ResponseHash>, Error> {
        Ok(self.responses.get(rotxn, &(task_index, respondent))?)
    }

    pub fn get_respondents(
        &self,
        rotxn: &RoTxn,
        task_index: TaskIndex,
    ) -> Result<Vec<Address>, Error> {
        Ok(self
            .respondents
            .get(rotxn, &task_index)?
            .unwrap_or_default())
    }

    pub fn reward_balance(
        &self,
        rotxn: &RoTxn,
        agent: Address,
    ) -> Result<u128, Error> {
        Ok(self
            .reward_balances
            .get(rotxn, &agent)?
            .unwrap_or_default())
    }

    pub fn is_test_operator(
        &self,
        rotxn: &RoTxn,
        operator: Address,
    ) -> Result<bool, Error> {
        Ok(self.test_operators.get(rotxn, &operator)?.unwrap_or(false))
    }

    fn open_task(
        &self,
        rwtxn: &mut RwTxn,
        name: &str,
        market: Option<MarketLink>,
        now: u64,
    ) -> Result<TaskIndex, Error> {
        let count = self.get_task_count(rwtxn)?;
        let next = count
            .checked_add(1)
            .ok_or(ConsensusError::TaskIndexOverflow)?;
        let task_index = TaskIndex(count);
        let task = Task::new(task_index, name.to_owned(), market, now);
        self.tasks.put(rwtxn, &task_index, &task)?;
        self.task_count.put(rwtxn, Self::TASK_COUNT_KEY, &next)?;
        self.events.emit(
            rwtxn,
            Event::TaskCreated {
                task_index,
                name: task.name,
                market_id: market.map(|link| link.market_id),
            },
        )?;
        tracing::info!(%task_index, name, "created task");
        Ok(task_index)
    }

    pub fn create_new_task(
        &self,
        rwtxn: &mut RwTxn,
        name: &str,
        now: u64,
    ) -> Result<TaskIndex, Error> {
        self.open_task(rwtxn, name, None, now)
    }

    pub fn create_market_resolution_task(
        &self,
        rwtxn: &mut RwTxn,
        name: &str,
        market_id: MarketId,
        callback: Address,
        now: u64,
    ) -> Result<TaskIndex, Error> {
        if market_id.is_zero() {
            return Err(ConsensusError::ZeroMarketId.into());
        }
        if callback.is_zero() {
            return Err(ConsensusError::ZeroCallback.into());
        }
        let link = MarketLink {
            market_id,
            callback,
        };
        self.open_task(rwtxn, name, Some(link), now)
    }

    /// Record `caller`'s response. Finalizes the task once consensus is
    /// reached and, for market tasks, settles the market.
    pub fn respond_to_task(
        &self,
        env: &Env,
        rwtxn: &mut RwTxn,
        caller: Address,
        task_index: TaskIndex,
        response: &[u8],
        target: &dyn SettlementTarget,
    ) -> Result<ResponseReceipt, Error> {
        let responder = Responder::authorize(
            caller,
            self.registry.is_registered(rwtxn, caller)?,
            self.is_test_operator(rwtxn, caller)?,
        )?;
        let mut task = self.get_task(rwtxn, task_index)?;
        if task.is_resolved() {
            return Err(
                ConsensusError::TaskAlreadyResolved { task_index }.into()
            );
        }
        if self.get_response(rwtxn, task_index, caller)?.is_some() {
            return Err(ConsensusError::AlreadyResponded {
                task_index,
                respondent: caller,
            }
            .into());
        }
        if task.market.is_some()
            && response != YES_RESPONSE
            && response != NO_RESPONSE
        {
            tracing::warn!(%task_index, %caller, "malformed market response");
            return Err(
                ConsensusError::InvalidMarketResponse { task_index }.into()
            );
        }

        let response_hash = ResponseHash::of(response);
        let votes = self.get_votes(rwtxn, task_index, response_hash)? + 1;
        self.votes.put(rwtxn, &(task_index, response_hash), &votes)?;
        self.responses
            .put(rwtxn, &(task_index, caller), &response_hash)?;
        let mut respondents = self.get_respondents(rwtxn, task_index)?;
        respondents.push(caller);
        self.respondents.put(rwtxn, &task_index, &respondents)?;

        task.total_responses += 1;
        if votes > task.max_votes {
            task.max_votes = votes;
            task.leading_hash = Some(response_hash);
        }
        self.events.emit(
            rwtxn,
            Event::TaskResponded {
                task_index,
                respondent: caller,
                response_hash,
                responder,
            },
        )?;
        tracing::debug!(
            %task_index,
            %caller,
            %responder,
            %response_hash,
            votes,
            total = task.total_responses,
            "accepted response"
        );

        let params = self.params(rwtxn)?;
        let reached = params.is_reached(task.total_responses, task.max_votes);
        let consensus_hash = match task.leading_hash {
            Some(leading) if reached => leading,
            _ => {
                task.status = TaskStatus::InProgress;
                self.tasks.put(rwtxn, &task_index, &task)?;
                return Ok(ResponseReceipt {
                    task_index,
                    response_hash,
                    responder,
                    status: task.status,
                    settlement: None,
                });
            }
        };

        task.status = TaskStatus::Resolved;
        task.consensus_hash = Some(consensus_hash);
        self.tasks.put(rwtxn, &task_index, &task)?;
        self.events.emit(
            rwtxn,
            Event::TaskFinalized {
                task_index,
                consensus_hash,
            },
        )?;
        tracing::info!(
            %task_index,
            %consensus_hash,
            votes = task.max_votes,
            total = task.total_responses,
            "task finalized"
        );

        let settlement = match task.market {
            Some(link) => {
                Some(self.settle_isolated(env, rwtxn, &task, link, target)?)
            }
            None => None,
        };
        Ok(ResponseReceipt {
            task_index,
            response_hash,
            responder,
            status: task.status,
            settlement,
        })
    }

    fn try_settle(
        &self,
        env: &Env,
        rwtxn: &mut RwTxn,
        task: &Task,
        link: MarketLink,
        target: &dyn SettlementTarget,
    ) -> Result<bool, Error> {
        let task_index = task.index;
        let outcome = task
            .consensus_hash
            .and_then(|hash| hash.decode_outcome())
            .ok_or(ConsensusError::UndecodableOutcome { task_index })?;
        let callback = target.callback_address(rwtxn)?;
        if callback != link.callback {
            return Err(ConsensusError::CallbackMismatch {
                task_index,
                expected: link.callback,
                actual: callback,
            }
            .into());
        }
        let engine = self.config(rwtxn)?.engine;
        with_nested_txn(env, rwtxn, |child| {
            target.settle(child, engine, task_index, link.market_id, outcome)
        })?;
        Ok(outcome)
    }

    /// Invoke the settlement target inside a nested transaction. Target
    /// failures are recorded as `SettlementFailed`, never returned; only
    /// failures to write the engine's own state are.
    fn settle_isolated(
        &self,
        env: &Env,
        rwtxn: &mut RwTxn,
        task: &Task,
        link: MarketLink,
        target: &dyn SettlementTarget,
    ) -> Result<SettlementReport, Error> {
        let task_index = task.index;
        let market_id = link.market_id;
        match self.try_settle(env, rwtxn, task, link, target) {
            Ok(outcome) => {
                self.events.emit(
                    rwtxn,
                    Event::MarketSettled {
                        task_index,
                        market_id,
                        outcome,
                    },
                )?;
                tracing::info!(
                    %task_index,
                    %market_id,
                    outcome,
                    "settled market"
                );
                Ok(SettlementReport::Settled { market_id, outcome })
            }
            Err(err) => {
                let reason = err.to_string();
                tracing::error!(
                    %task_index,
                    %market_id,
                    error = %reason,
                    "market settlement failed"
                );
                self.events.emit(
                    rwtxn,
                    Event::SettlementFailed {
                        task_index,
                        market_id,
                        reason: reason.clone(),
                    },
                )?;
                Ok(SettlementReport::Failed { market_id, reason })
            }
        }
    }

    /// Re-drive settlement of a resolved market task. A no-op if the
    /// market already holds the consensus outcome.
    pub fn retry_settlement(
        &self,
        env: &Env,
        rwtxn: &mut RwTxn,
        task_index: TaskIndex,
        target: &dyn SettlementTarget,
    ) -> Result<SettlementReport, Error> {
        let task = self.get_task(rwtxn, task_index)?;
        if !task.is_resolved() {
            return Err(ConsensusError::TaskNotResolved { task_index }.into());
        }
        let link = task
            .market
            .ok_or(ConsensusError::NotMarketTask { task_index })?;
        let outcome = task
            .consensus_hash
            .and_then(|hash| hash.decode_outcome())
            .ok_or(ConsensusError::UndecodableOutcome { task_index })?;
        if target.settled_outcome(rwtxn, link.market_id)? == Some(outcome) {
            tracing::debug!(
                %task_index,
                market_id = %link.market_id,
                "market already settled"
            );
            return Ok(SettlementReport::AlreadySettled {
                market_id: link.market_id,
                outcome,
            });
        }
        tracing::info!(
            %task_index,
            market_id = %link.market_id,
            "retrying settlement"
        );
        self.settle_isolated(env, rwtxn, &task, link, target)
    }

    /// Credit the reward to every respondent that agreed with consensus.
    /// Each task pays out at most once.
    ///
    /// Rewards accrue in the engine's reward ledger only. No tokens move
    /// here; an external payer settles the balances reported by
    /// [`Self::reward_balance`].
    pub fn distribute_rewards(
        &self,
        rwtxn: &mut RwTxn,
        task_index: TaskIndex,
    ) -> Result<Vec<RewardPayout>, Error> {
        let mut task = self.get_task(rwtxn, task_index)?;
        let consensus_hash = match task.consensus_hash {
            Some(hash) if task.is_resolved() => hash,
            _ => {
                return Err(
                    ConsensusError::TaskNotResolved { task_index }.into()
                );
            }
        };
        if task.rewards_distributed {
            tracing::warn!(%task_index, "rewards already distributed");
            return Err(
                ConsensusError::RewardsAlreadyDistributed { task_index }.into()
            );
        }
        let amount = self.params(rwtxn)?.reward_amount;
        let mut payouts = Vec::new();
        for agent in self.get_respondents(rwtxn, task_index)? {
            if self.get_response(rwtxn, task_index, agent)?
                != Some(consensus_hash)
            {
                tracing::debug!(
                    %task_index,
                    %agent,
                    "no reward for dissenting response"
                );
                continue;
            }
            let balance =
                self.reward_balance(rwtxn, agent)?.saturating_add(amount);
            self.reward_balances.put(rwtxn, &agent, &balance)?;
            self.events.emit(
                rwtxn,
                Event::RewardPaid {
                    task_index,
                    agent,
                    amount,
                },
            )?;
            payouts.push(RewardPayout { agent, amount });
        }
        task.rewards_distributed = true;
        self.tasks.put(rwtxn, &task_index, &task)?;
        tracing::info!(
            %task_index,
            winners = payouts.len(),
            amount,
            "distributed rewards"
        );
        Ok(payouts)
    }

    pub fn update_consensus_parameters(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        minimum_responses: u32,
        consensus_threshold: u32,
    ) -> Result<(), Error> {
        self.config(rwtxn)?.owner.check(caller)?;
        let params = ConsensusParams {
            minimum_responses,
            consensus_threshold,
            ..self.params(rwtxn)?
        };
        params.validate()?;
        self.params.put(rwtxn, Self::PARAMS_KEY, &params)?;
        self.events.emit(
            rwtxn,
            Event::ConsensusParametersUpdated {
                minimum_responses,
                consensus_threshold,
            },
        )?;
        tracing::info!(
            minimum_responses,
            consensus_threshold,
            "updated consensus parameters"
        );
        Ok(())
    }

    pub fn set_reward_amount(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        amount: u128,
    ) -> Result<(), Error> {
        self.config(rwtxn)?.owner.check(caller)?;
        let params = ConsensusParams {
            reward_amount: amount,
            ..self.params(rwtxn)?
        };
        self.params.put(rwtxn, Self::PARAMS_KEY, &params)?;
        self.events
            .emit(rwtxn, Event::RewardAmountUpdated { amount })?;
        Ok(())
    }

    pub fn add_test_operator(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        operator: Address,
    ) -> Result<(), Error> {
        self.config(rwtxn)?.owner.check(caller)?;
        if self.is_test_operator(rwtxn, operator)? {
            return Err(ConsensusError::TestOperatorExists { operator }.into());
        }
        self.test_operators.put(rwtxn, &operator, &true)?;
        self.events
            .emit(rwtxn, Event::TestOperatorAdded { operator })?;
        tracing::info!(%operator, "added test operator");
        Ok(())
    }

    pub fn remove_test_operator(
        &self,
        rwtxn: &mut RwTxn,
        caller: Address,
        operator: Address,
    ) -> Result<(), Error> {
        self.config(rwtxn)?.owner.check(caller)?;
        if !self.test_operators.delete(rwtxn, &operator)? {
            return Err(
                ConsensusError::UnknownTestOperator { operator }.into()
            );
        }
        self.events
            .emit(rwtxn, Event::TestOperatorRemoved { operator })?;
        tracing::info!(%operator, "removed test operator");
        Ok(())
    }
}
