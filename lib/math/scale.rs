//! Unit conversion with standardized rounding.
//!
//! Claim tokens use a fixed decimal scale that is independent of the
//! collateral asset's native decimals. Every comparison between a collateral
//! amount and a claim amount goes through a [`ScaleFactor`].
//!
//! # Rounding Conventions
//! - `Rounding::Up` (ceil): Use for amounts charged TO a user
//! - `Rounding::Down` (floor): Use for payouts TO a user
//! - `Rounding::Nearest` (round): Use for neutral/balanced calculations

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decimals of every claim token.
pub const CLAIM_TOKEN_DECIMALS: u8 = 18;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScaleError {
    #[error("Non-finite value: {0}")]
    NonFinite(f64),
    #[error("Negative value not allowed: {0}")]
    Negative(f64),
    #[error("Value exceeds maximum: {0}")]
    Overflow(f64),
    #[error(
        "collateral decimals ({collateral}) exceed claim decimals ({claim})"
    )]
    UnsupportedDecimals { collateral: u8, claim: u8 },
    #[error("amount {0} overflows when scaled")]
    AmountOverflow(u128),
}

/// Rounding strategy for unit conversions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rounding {
    /// Round up (ceil) - use for amounts charged TO user.
    Up,
    /// Round down (floor) - use for payouts TO user.
    Down,
    /// Round to nearest - use for neutral calculations.
    Nearest,
}

/// Convert a nonnegative f64 to integer base units with explicit rounding.
///
/// # Errors
/// Returns `ScaleError` if:
/// - Value is NaN or infinite
/// - Value is negative
/// - Rounded value exceeds u128::MAX
pub fn to_units(value: f64, mode: Rounding) -> Result<u128, ScaleError> {
    if !value.is_finite() {
        return Err(ScaleError::NonFinite(value));
    }
    if value < 0.0 {
        return Err(ScaleError::Negative(value));
    }
    let rounded = match mode {
        Rounding::Up => value.ceil(),
        Rounding::Down => value.floor(),
        Rounding::Nearest => value.round(),
    };
    if rounded >= u128::MAX as f64 {
        return Err(ScaleError::Overflow(value));
    }
    Ok(rounded as u128)
}

/// Ratio between one collateral base unit and one claim base unit.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ScaleFactor(u128);

impl ScaleFactor {
    pub fn new(collateral_decimals: u8) -> Result<Self, ScaleError> {
        if collateral_decimals > CLAIM_TOKEN_DECIMALS {
            return Err(ScaleError::UnsupportedDecimals {
                collateral: collateral_decimals,
                claim: CLAIM_TOKEN_DECIMALS,
            });
        }
        let exponent = u32::from(CLAIM_TOKEN_DECIMALS - collateral_decimals);
        Ok(Self(10u128.pow(exponent)))
    }

    pub fn factor(&self) -> u128 {
        self.0
    }

    pub fn collateral_to_claims(
        &self,
        collateral: u128,
    ) -> Result<u128, ScaleError> {
        collateral
            .checked_mul(self.0)
            .ok_or(ScaleError::AmountOverflow(collateral))
    }

    pub fn claims_to_collateral(&self, claims: u128, mode: Rounding) -> u128 {
        let quotient = claims / self.0;
        let remainder = claims % self.0;
        match mode {
            Rounding::Down => quotient,
            Rounding::Up if remainder > 0 => quotient + 1,
            Rounding::Up => quotient,
            Rounding::Nearest if remainder * 2 >= self.0 => quotient + 1,
            Rounding::Nearest => quotient,
        }
    }
}
