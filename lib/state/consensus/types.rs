use std::fmt;

use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

use crate::{
    authorization::{OwnerPolicy, Responder},
    state::markets::MarketId,
    types::{Address, Hash, hashes},
};

/// Threshold denominator: thresholds are expressed in basis points.
pub const BPS_DENOMINATOR: u32 = 10_000;

/// Payload an agent submits to vote YES on a market task
pub const YES_RESPONSE: &[u8] = b"YES";
/// Payload an agent submits to vote NO on a market task
pub const NO_RESPONSE: &[u8] = b"NO";

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct TaskIndex(pub u32);

impl fmt::Display for TaskIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(
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
pub struct ResponseHash(pub Hash);

impl ResponseHash {
    pub fn of(response: &[u8]) -> Self {
        Self(hashes::hash(response))
    }

    pub fn yes() -> Self {
        Self::of(YES_RESPONSE)
    }

    pub fn no() -> Self {
        Self::of(NO_RESPONSE)
    }

    /// Outcome of a market task, if this is the hash of a YES or NO
    /// payload
    pub fn decode_outcome(&self) -> Option<bool> {
        if *self == Self::yes() {
            Some(true)
        } else if *self == Self::no() {
            Some(false)
        } else {
            None
        }
    }
}

impl fmt::Display for ResponseHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ResponseHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseHash({self})")
    }
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize,
)]
pub enum TaskStatus {
    Created,
    InProgress,
    Resolved,
}

/// Market settled by a task once it finalizes
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MarketLink {
    pub market_id: MarketId,
    /// Address of the settlement target
    pub callback: Address,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Task {
    pub index: TaskIndex,
    pub name: String,
    pub created_at: u64,
    pub status: TaskStatus,
    pub market: Option<MarketLink>,
    /// Set once resolved, never changed afterwards
    pub consensus_hash: Option<ResponseHash>,
    pub total_responses: u32,
    /// Highest vote count among distinct response hashes
    pub max_votes: u32,
    /// First hash to reach `max_votes`
    pub leading_hash: Option<ResponseHash>,
    pub rewards_distributed: bool,
}

impl Task {
    pub fn new(
        index: TaskIndex,
        name: String,
        market: Option<MarketLink>,
        created_at: u64,
    ) -> Self {
        Self {
            index,
            name,
            created_at,
            status: TaskStatus::Created,
            market,
            consensus_hash: None,
            total_responses: 0,
            max_votes: 0,
            leading_hash: None,
            rewards_distributed: false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == TaskStatus::Resolved
    }
}

#[cfg_attr(feature = "clap", derive(clap::Args))]
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConsensusParams {
    /// Responses required before a task may finalize
    #[cfg_attr(feature = "clap", arg(long, default_value_t = 3))]
    pub minimum_responses: u32,
    /// Share of responses the leading answer needs, in basis points
    #[cfg_attr(feature = "clap", arg(long, default_value_t = 7_000))]
    pub consensus_threshold: u32,
    /// Reward credited to each agent that agreed with consensus
    #[cfg_attr(feature = "clap", arg(long, default_value_t = 100))]
    pub reward_amount: u128,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            minimum_responses: 3,
            consensus_threshold: 7_000,
            reward_amount: 100,
        }
    }
}

impl ConsensusParams {
    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.minimum_responses == 0 {
            return Err(ConsensusError::InvalidMinimumResponses(
                self.minimum_responses,
            ));
        }
        if self.consensus_threshold == 0
            || self.consensus_threshold > BPS_DENOMINATOR
        {
            return Err(ConsensusError::InvalidThreshold(
                self.consensus_threshold,
            ));
        }
        Ok(())
    }

    /// `total >= minimum_responses && max_votes * 10000 >= total * threshold`
    pub fn is_reached(&self, total: u32, max_votes: u32) -> bool {
        total >= self.minimum_responses
            && u128::from(max_votes) * u128::from(BPS_DENOMINATOR)
                >= u128::from(total) * u128::from(self.consensus_threshold)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConsensusConfig {
    pub owner: OwnerPolicy,
    /// Identity the engine presents when settling markets
    pub engine: Address,
}

/// Result of attempting to settle a market after finalization
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SettlementReport {
    Settled {
        market_id: MarketId,
        outcome: bool,
    },
    /// The market already holds this outcome
    AlreadySettled {
        market_id: MarketId,
        outcome: bool,
    },
    Failed {
        market_id: MarketId,
        reason: String,
    },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResponseReceipt {
    pub task_index: TaskIndex,
    pub response_hash: ResponseHash,
    pub responder: Responder,
    pub status: TaskStatus,
    /// Present when this response finalized a market task
    pub settlement: Option<SettlementReport>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RewardPayout {
    pub agent: Address,
    pub amount: u128,
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConsensusError {
    #[error("{respondent} already responded to task {task_index}")]
    AlreadyResponded {
        task_index: TaskIndex,
        respondent: Address,
    },
    #[error("task {task_index} callback is {expected}, target is {actual}")]
    CallbackMismatch {
        task_index: TaskIndex,
        expected: Address,
        actual: Address,
    },
    #[error("minimum responses must be at least 1, got {0}")]
    InvalidMinimumResponses(u32),
    #[error("market task {task_index} only accepts YES or NO")]
    InvalidMarketResponse { task_index: TaskIndex },
    #[error(
        "consensus threshold must be within 1..={BPS_DENOMINATOR} bps, got {0}"
    )]
    InvalidThreshold(u32),
    #[error("task {task_index} is not linked to a market")]
    NotMarketTask { task_index: TaskIndex },
    #[error("rewards for task {task_index} were already distributed")]
    RewardsAlreadyDistributed { task_index: TaskIndex },
    #[error("task {task_index} is already resolved")]
    TaskAlreadyResolved { task_index: TaskIndex },
    #[error("task {task_index} not found")]
    TaskNotFound { task_index: TaskIndex },
    #[error("task {task_index} is not resolved")]
    TaskNotResolved { task_index: TaskIndex },
    #[error("task index overflow")]
    TaskIndexOverflow,
    #[error("test operator {operator} is already present")]
    TestOperatorExists { operator: Address },
    #[error("{operator} is not a test operator")]
    UnknownTestOperator { operator: Address },
    #[error("consensus hash of task {task_index} is not an outcome")]
    UndecodableOutcome { task_index: TaskIndex },
    #[error("zero callback address")]
    ZeroCallback,
    #[error("zero market id")]
    ZeroMarketId,
}
