//! Append-only event log.
//!
//! Events written inside a transaction that is later aborted disappear with
//! it, so the log only ever reflects committed effects.

use heed::{
    Env, RoTxn, RwTxn,
    byteorder::BigEndian,
    types::{SerdeBincode, U64},
};
use serde::{Deserialize, Serialize};

use crate::{
    authorization::Responder,
    state::{
        Error, Singleton,
        agents::AgentStatus,
        consensus::{ResponseHash, TaskIndex},
        markets::{MarketId, Side},
    },
    types::Address,
};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum Event {
    MarketCreated {
        market_id: MarketId,
        creator: Address,
        collateral_amount: u128,
        end_timestamp: u64,
    },
    OutcomeTokensMinted {
        market_id: MarketId,
        account: Address,
        collateral_amount: u128,
        claim_amount: u128,
    },
    MarketClosed {
        market_id: MarketId,
        by_owner_override: bool,
    },
    MarketEnteredResolution {
        market_id: MarketId,
        task_index: TaskIndex,
    },
    MarketResolved {
        market_id: MarketId,
        outcome: bool,
    },
    MarketCancelled {
        market_id: MarketId,
    },
    MarketDisputed {
        market_id: MarketId,
        disputant: Address,
    },
    CollateralRedeemed {
        market_id: MarketId,
        account: Address,
        claim_amount: u128,
        collateral_amount: u128,
    },
    WinningsClaimed {
        market_id: MarketId,
        account: Address,
        side: Side,
        claim_amount: u128,
        collateral_amount: u128,
    },
    AgentRegistered {
        agent: Address,
    },
    AgentUnregistered {
        agent: Address,
    },
    AgentStatusUpdated {
        agent: Address,
        status: AgentStatus,
    },
    AgentStatsUpdated {
        agent: Address,
    },
    TaskCreated {
        task_index: TaskIndex,
        name: String,
        market_id: Option<MarketId>,
    },
    TaskResponded {
        task_index: TaskIndex,
        respondent: Address,
        response_hash: ResponseHash,
        responder: Responder,
    },
    TaskFinalized {
        task_index: TaskIndex,
        consensus_hash: ResponseHash,
    },
    MarketSettled {
        task_index: TaskIndex,
        market_id: MarketId,
        outcome: bool,
    },
    SettlementFailed {
        task_index: TaskIndex,
        market_id: MarketId,
        reason: String,
    },
    RewardPaid {
        task_index: TaskIndex,
        agent: Address,
        amount: u128,
    },
    ConsensusParametersUpdated {
        minimum_responses: u32,
        consensus_threshold: u32,
    },
    RewardAmountUpdated {
        amount: u128,
    },
    TestOperatorAdded {
        operator: Address,
    },
    TestOperatorRemoved {
        operator: Address,
    },
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LoggedEvent {
    pub seq: u64,
    pub event: Event,
}

/// Big-endian keys so cursor order is emission order
type SeqDb = heed::Database<U64<BigEndian>, SerdeBincode<Event>>;

#[derive(Clone)]
pub struct EventLog {
    events: SeqDb,
    next_seq: Singleton<u64>,
}

impl EventLog {
    pub const NUM_DBS: u32 = 2;

    const NEXT_SEQ_KEY: &'static str = "next_seq";

    pub fn new(env: &Env, rwtxn: &mut RwTxn) -> Result<Self, Error> {
        let events = env.create_database(rwtxn, Some("events"))?;
        let next_seq = env.create_database(rwtxn, Some("events_next_seq"))?;
        Ok(Self { events, next_seq })
    }

    pub fn emit(&self, rwtxn: &mut RwTxn, event: Event) -> Result<u64, Error> {
        let seq = self
            .next_seq
            .get(rwtxn, Self::NEXT_SEQ_KEY)?
            .unwrap_or_default();
        tracing::trace!(seq, ?event, "emit");
        self.events.put(rwtxn, &seq, &event)?;
        self.next_seq.put(rwtxn, Self::NEXT_SEQ_KEY, &(seq + 1))?;
        Ok(seq)
    }

    pub fn len(&self, rotxn: &RoTxn) -> Result<u64, Error> {
        Ok(self
            .next_seq
            .get(rotxn, Self::NEXT_SEQ_KEY)?
            .unwrap_or_default())
    }

    pub fn is_empty(&self, rotxn: &RoTxn) -> Result<bool, Error> {
        Ok(self.len(rotxn)? == 0)
    }

    /// All events in emission order
    pub fn all(&self, rotxn: &RoTxn) -> Result<Vec<LoggedEvent>, Error> {
        self.since(rotxn, 0)
    }

    /// Events with sequence number `>= from`, in emission order
    pub fn since(
        &self,
        rotxn: &RoTxn,
        from: u64,
    ) -> Result<Vec<LoggedEvent>, Error> {
        let mut res = Vec::new();
        for item in self.events.range(rotxn, &(from..))? {
            let (seq, event) = item?;
            res.push(LoggedEvent { seq, event });
        }
        Ok(res)
    }
}
