//! Engine configuration

use std::{num::NonZeroU32, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{btc, retry::RetryPolicy, types::Network};

/// Endpoints and client limits for the upstream HTTP APIs
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UpstreamConfig {
    pub network: Network,
    /// Stacks node / indexer API root (read-only calls, balances, BNS, PoX)
    pub stacks_api_url: Url,
    /// Esplora-compatible Bitcoin API root
    pub bitcoin_api_url: Url,
    /// Public read root of the snapshot cache blob store
    pub cache_read_url: Option<Url>,
    /// Authenticated write root of the snapshot cache blob store
    pub cache_write_url: Option<Url>,
    #[serde(skip_serializing)]
    pub cache_token: Option<String>,
    pub request_timeout: Duration,
    /// Process-wide limit across all upstream requests
    pub requests_per_second: NonZeroU32,
    pub user_agent: String,
}

impl UpstreamConfig {
    pub const DEFAULT_REQUESTS_PER_SECOND: NonZeroU32 =
        NonZeroU32::MIN.saturating_add(19);

    pub fn new(
        network: Network,
        stacks_api_url: Url,
        bitcoin_api_url: Url,
    ) -> Self {
        Self {
            network,
            stacks_api_url,
            bitcoin_api_url,
            cache_read_url: None,
            cache_write_url: None,
            cache_token: None,
            request_timeout: Duration::from_secs(30),
            requests_per_second: Self::DEFAULT_REQUESTS_PER_SECOND,
            user_agent: format!("poll-tally/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Limits applied by the resolvers themselves
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TallyConfig {
    pub network: Network,
    /// Bound on in-flight requests for any one fan-out
    pub max_concurrent_requests: usize,
    /// Default "load more" batch size for ledger votes
    pub vote_page_size: u64,
    pub stacker_page_size: u32,
    /// Cap on confirmed BTC transactions read per option address
    pub btc_history_limit: usize,
    pub retry: RetryPolicy,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            max_concurrent_requests: 16,
            vote_page_size: 20,
            stacker_page_size: 50,
            btc_history_limit: btc::DEFAULT_HISTORY_LIMIT,
            retry: RetryPolicy::default(),
        }
    }
}
