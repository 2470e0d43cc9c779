//! Access-control capabilities checked on every privileged call.
//!
//! Each component stores its owner (or bound identity) explicitly and
//! checks it through one of the policies below, rather than consulting any
//! ambient global state.

use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

use crate::types::Address;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum AuthorizationError {
    #[error("caller {caller} is not the owner ({owner})")]
    NotOwner { caller: Address, owner: Address },
    #[error("caller {caller} is not the settlement engine ({engine})")]
    NotSettlementEngine { caller: Address, engine: Address },
    #[error(
        "caller {caller} is neither a registered agent nor a test operator"
    )]
    NotResponder { caller: Address },
    #[error("caller {caller} is neither the market creator nor the owner")]
    NotCreatorOrOwner { caller: Address },
}

/// Single-owner capability.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct OwnerPolicy {
    pub owner: Address,
}

impl OwnerPolicy {
    pub fn new(owner: Address) -> Self {
        Self { owner }
    }

    pub fn is_owner(&self, caller: Address) -> bool {
        caller == self.owner
    }

    pub fn check(&self, caller: Address) -> Result<(), AuthorizationError> {
        if self.is_owner(caller) {
            Ok(())
        } else {
            Err(AuthorizationError::NotOwner {
                caller,
                owner: self.owner,
            })
        }
    }

    /// Passes for the owner, or for `principal` (e.g. a market creator).
    pub fn check_principal_or_owner(
        &self,
        caller: Address,
        principal: Address,
    ) -> Result<(), AuthorizationError> {
        if caller == principal || self.is_owner(caller) {
            Ok(())
        } else {
            Err(AuthorizationError::NotCreatorOrOwner { caller })
        }
    }
}

/// The only identity allowed to settle markets.
///
/// Distinct from a market's informational `oracle` field.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SettlementBinding {
    pub engine: Address,
}

impl SettlementBinding {
    pub fn check(&self, caller: Address) -> Result<(), AuthorizationError> {
        if caller == self.engine {
            Ok(())
        } else {
            Err(AuthorizationError::NotSettlementEngine {
                caller,
                engine: self.engine,
            })
        }
    }
}

/// How a caller was admitted to respond to a consensus task.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize,
)]
pub enum Responder {
    RegisteredAgent,
    BootstrapTestOperator,
}

impl Responder {
    /// The single decision point for task responders. Registration takes
    /// precedence over the test-operator allow-list.
    pub fn authorize(
        caller: Address,
        is_registered_agent: bool,
        is_test_operator: bool,
    ) -> Result<Self, AuthorizationError> {
        match (is_registered_agent, is_test_operator) {
            (true, _) => Ok(Self::RegisteredAgent),
            (false, true) => Ok(Self::BootstrapTestOperator),
            (false, false) => Err(AuthorizationError::NotResponder { caller }),
        }
    }
}
