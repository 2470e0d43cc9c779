//! Binary-outcome prediction markets settled by oracle agent consensus.
//!
//! The crate is organised around a single LMDB environment that plays the
//! role of the host ledger. Every mutating operation receives an explicit
//! write transaction, so each call is atomic and totally ordered with respect
//! to every other call on the same environment.

pub mod authorization;
pub mod config;
pub mod math;
pub mod state;
pub mod types;

pub use heed;
