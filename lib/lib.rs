//! Poll result engine.
//!
//! Reconstructs a poll's outcome from three vote channels (the on-chain
//! ledger, dust transfers to per-option addresses, and Bitcoin activity
//! mapped through the PoX reward-cycle registry) and merges them into a
//! single [`types::PollResultSet`].

pub mod balance;
pub mod btc;
pub mod cache;
pub mod chain;
pub mod config;
pub mod dust;
pub mod merge;
pub mod poll;
pub mod retry;
pub mod stacker;
pub mod types;
pub mod upstream;

#[cfg(test)]
mod test_util;
