//! RPC API

use jsonrpsee::{core::RpcResult, proc_macros::rpc};
use poll_tally::{
    cache::SnapshotBalances,
    chain::VoteLog,
    poll::PollSummary,
    stacker::StackerMapping,
    types::{PollId, PollResultSet, StacksAddress, VoteRecord},
};
use serde::{Deserialize, Serialize};

/// Daemon status reported by `status`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Status {
    pub network: String,
    pub polls: usize,
    pub version: String,
}

#[rpc(client, server)]
pub trait Rpc {
    /// List the configured polls
    #[method(name = "list_polls")]
    async fn list_polls(&self) -> RpcResult<Vec<PollSummary>>;

    /// Merged results across the direct, dust and BTC channels
    #[method(name = "poll_results")]
    async fn poll_results(&self, poll_id: PollId) -> RpcResult<PollResultSet>;

    /// Load the next batch of ledger votes, newest first
    #[method(name = "poll_votes")]
    async fn poll_votes(
        &self,
        poll_id: PollId,
        already_loaded: u64,
        page_size: Option<u64>,
    ) -> RpcResult<VoteLog>;

    /// Cached snapshot balances for a poll
    #[method(name = "snapshot_balances")]
    async fn snapshot_balances(
        &self,
        poll_id: PollId,
    ) -> RpcResult<Option<SnapshotBalances>>;

    /// BTC reward address to stacker mapping for the given PoX cycles
    #[method(name = "stacker_mapping")]
    async fn stacker_mapping(
        &self,
        cycles: Vec<u32>,
    ) -> RpcResult<StackerMapping>;

    #[method(name = "status")]
    async fn status(&self) -> RpcResult<Status>;

    /// Stop the daemon
    #[method(name = "stop")]
    async fn stop(&self);

    /// Vote cast by one address in a poll's ledger
    #[method(name = "vote_by_user")]
    async fn vote_by_user(
        &self,
        poll_id: PollId,
        address: StacksAddress,
    ) -> RpcResult<Option<VoteRecord>>;
}
