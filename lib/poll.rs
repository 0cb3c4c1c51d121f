//! Poll definitions and the service that tallies them.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    balance::BalanceFetcher,
    btc::{self, BtcOption, BtcVoteResolver, HeightWindow},
    cache::{SnapshotBalances, SnapshotCache},
    chain::{self, ChainResultReader, NameLookup, PageCursor, VoteLog},
    config::{TallyConfig, UpstreamConfig},
    dust::{DustOption, DustVoteResolver},
    merge::merge,
    stacker::{StackerMapping, StackerMappingBuilder},
    types::{
        ChannelTally, ContractId, Network, PollId, PollResultSet,
        StacksAddress, Token, VoteRecord,
    },
    upstream::{
        self, BalanceIndexer, BitcoinTxSource, BlobStore, NameResolver,
        PoxRegistry, ReadOnlyCaller,
        http::{EsploraApi, HttpBlobStore, HttpClient, StacksApi},
        memory::MemoryBlobStore,
    },
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Chain(#[from] chain::Error),
    #[error(transparent)]
    Upstream(#[from] upstream::Error),
    #[error("unknown poll `{0}`")]
    UnknownPoll(PollId),
    #[error("poll `{0}` is defined more than once")]
    DuplicatePoll(PollId),
    #[error("invalid poll `{poll_id}`: {reason}")]
    InvalidPoll { poll_id: PollId, reason: String },
    #[error("failed to parse poll definitions")]
    Json(#[from] serde_json::Error),
    #[error("failed to read poll definitions from `{path}`")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct PollDefinition {
    pub poll_id: PollId,
    pub contract: ContractId,
    /// Stacks block height balances are weighed at. Without one, balances
    /// are read at the chain tip.
    #[serde(default)]
    pub snapshot_height: Option<u64>,
    #[serde(default)]
    pub token: Token,
    #[serde(default)]
    pub dust_options: Vec<DustOption>,
    #[serde(default)]
    pub btc_options: Vec<BtcOption>,
    #[serde(default)]
    pub btc_height_window: Option<HeightWindow>,
}

impl PollDefinition {
    fn invalid(&self, reason: impl ToString) -> Error {
        Error::InvalidPoll {
            poll_id: self.poll_id.clone(),
            reason: reason.to_string(),
        }
    }

    pub fn validate(&self, network: Network) -> Result<(), Error> {
        if self.poll_id.0.trim().is_empty() {
            return Err(self.invalid("empty poll id"));
        }
        if self.contract.address.network() != network {
            return Err(self.invalid(format!(
                "contract `{}` is not a {network} contract",
                self.contract
            )));
        }
        if let Some(window) = self.btc_height_window {
            if window.start > window.end {
                return Err(
                    self.invalid("BTC height window ends before it starts")
                );
            }
        }
        if self
            .btc_options
            .iter()
            .any(|option| option.pox_cycles.0.is_empty())
        {
            return Err(self.invalid("BTC option without PoX cycles"));
        }
        btc::validate_options(&self.btc_options, network)
            .map_err(|err| self.invalid(err))
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct PollSummary {
    pub poll_id: PollId,
    pub contract: ContractId,
    pub snapshot_height: Option<u64>,
    pub dust_options: usize,
    pub btc_options: usize,
}

impl From<&PollDefinition> for PollSummary {
    fn from(def: &PollDefinition) -> Self {
        Self {
            poll_id: def.poll_id.clone(),
            contract: def.contract.clone(),
            snapshot_height: def.snapshot_height,
            dust_options: def.dust_options.len(),
            btc_options: def.btc_options.len(),
        }
    }
}

/// Validated set of polls, keyed by id
#[derive(Clone, Debug, Default)]
pub struct PollRegistry {
    polls: BTreeMap<PollId, PollDefinition>,
}

impl PollRegistry {
    pub fn from_definitions(
        definitions: Vec<PollDefinition>,
        network: Network,
    ) -> Result<Self, Error> {
        let mut polls = BTreeMap::new();
        for def in definitions {
            def.validate(network)?;
            let poll_id = def.poll_id.clone();
            if polls.insert(poll_id.clone(), def).is_some() {
                return Err(Error::DuplicatePoll(poll_id));
            }
        }
        Ok(Self { polls })
    }

    /// JSON array of [`PollDefinition`]s
    pub fn from_json(bytes: &[u8], network: Network) -> Result<Self, Error> {
        let definitions: Vec<PollDefinition> = serde_json::from_slice(bytes)?;
        Self::from_definitions(definitions, network)
    }

    pub fn load(path: &Path, network: Network) -> Result<Self, Error> {
        let bytes = std::fs::read(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&bytes, network)
    }

    pub fn get(&self, poll_id: &PollId) -> Result<&PollDefinition, Error> {
        self.polls
            .get(poll_id)
            .ok_or_else(|| Error::UnknownPoll(poll_id.clone()))
    }

    pub fn len(&self) -> usize {
        self.polls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polls.is_empty()
    }

    pub fn summaries(&self) -> Vec<PollSummary> {
        self.polls.values().map(PollSummary::from).collect()
    }
}

/// The external services a [`PollTallier`] reads from
#[derive(Clone)]
pub struct Upstreams {
    pub caller: Arc<dyn ReadOnlyCaller>,
    pub indexer: Arc<dyn BalanceIndexer>,
    pub names: Arc<dyn NameResolver>,
    pub pox: Arc<dyn PoxRegistry>,
    pub bitcoin: Arc<dyn BitcoinTxSource>,
    pub blobs: Arc<dyn BlobStore>,
}

impl Upstreams {
    /// HTTP clients sharing one rate limit. Without a cache read URL the
    /// snapshot cache lives in memory.
    pub fn http(config: &UpstreamConfig) -> Result<Self, reqwest::Error> {
        let http = HttpClient::new(config)?;
        let stacks = Arc::new(StacksApi::new(
            http.clone(),
            config.stacks_api_url.clone(),
        ));
        let blobs: Arc<dyn BlobStore> = match &config.cache_read_url {
            Some(read_url) => Arc::new(HttpBlobStore::new(
                http.clone(),
                read_url.clone(),
                config.cache_write_url.clone(),
                config.cache_token.clone(),
            )),
            None => {
                tracing::info!(
                    "no cache URL configured, caching snapshots in memory"
                );
                Arc::new(MemoryBlobStore::new())
            }
        };
        Ok(Self {
            caller: stacks.clone(),
            indexer: stacks.clone(),
            names: stacks.clone(),
            pox: stacks,
            bitcoin: Arc::new(EsploraApi::new(
                http,
                config.bitcoin_api_url.clone(),
            )),
            blobs,
        })
    }
}

pub struct PollTallier {
    indexer: Arc<dyn BalanceIndexer>,
    bitcoin: Arc<dyn BitcoinTxSource>,
    cache: Arc<SnapshotCache>,
    chain: ChainResultReader,
    stackers: StackerMappingBuilder,
    config: TallyConfig,
}

impl PollTallier {
    pub fn new(upstreams: Upstreams, config: TallyConfig) -> Self {
        let cache =
            Arc::new(SnapshotCache::new(upstreams.blobs, config.network));
        let chain = ChainResultReader::new(
            upstreams.caller,
            NameLookup::for_network(config.network, upstreams.names),
            config.max_concurrent_requests,
        );
        let stackers = StackerMappingBuilder::new(
            upstreams.pox,
            config.retry.clone(),
            config.stacker_page_size,
            config.max_concurrent_requests,
        );
        Self {
            indexer: upstreams.indexer,
            bitcoin: upstreams.bitcoin,
            cache,
            chain,
            stackers,
            config,
        }
    }

    pub fn config(&self) -> &TallyConfig {
        &self.config
    }

    fn fetcher(&self, def: &PollDefinition) -> BalanceFetcher {
        BalanceFetcher::new(self.indexer.clone(), def.token.clone())
    }

    /// Direct tally first (the only hard failure), then dust and BTC
    /// concurrently, then merge.
    pub async fn tally(
        &self,
        def: &PollDefinition,
    ) -> Result<PollResultSet, Error> {
        let direct = self.chain.get_aggregate(&def.contract).await?;
        let max_concurrent = self.config.max_concurrent_requests;
        let dust = DustVoteResolver::new(
            self.cache.clone(),
            self.fetcher(def),
            max_concurrent,
        );
        let btc = BtcVoteResolver::new(
            self.bitcoin.clone(),
            self.stackers.clone(),
            self.cache.clone(),
            self.fetcher(def),
            self.config.network,
            max_concurrent,
        )
        .with_window(def.btc_height_window)
        .with_history_limit(self.config.btc_history_limit);
        let (dust, btc) = tokio::join!(
            dust.resolve(&def.poll_id, &def.dust_options, def.snapshot_height),
            btc.resolve(&def.poll_id, &def.btc_options, def.snapshot_height),
        );
        let btc = btc.unwrap_or_else(|err| {
            tracing::warn!(
                poll_id = %def.poll_id,
                error = %err,
                "BTC channel failed, counting it as empty"
            );
            ChannelTally::default()
        });
        let results = merge(
            def.poll_id.clone(),
            def.snapshot_height,
            &direct,
            &dust,
            &btc,
        );
        tracing::info!(
            poll_id = %def.poll_id,
            total_votes = results.total_votes,
            total_unique_voters = results.total_unique_voters,
            options = results.tallies.len(),
            "tallied poll"
        );
        Ok(results)
    }

    /// One "load more" step over the ledger, newest first
    pub async fn votes(
        &self,
        def: &PollDefinition,
        already_loaded: u64,
        page_size: Option<u64>,
    ) -> Result<VoteLog, Error> {
        let direct = self.chain.get_aggregate(&def.contract).await?;
        let cursor = PageCursor {
            total_votes: direct.unique_voters,
            already_loaded,
            page_size: page_size.unwrap_or(self.config.vote_page_size),
        };
        Ok(self.chain.load_more(&def.contract, VoteLog::new(cursor)).await)
    }

    pub async fn vote_by_user(
        &self,
        def: &PollDefinition,
        address: &StacksAddress,
    ) -> Option<VoteRecord> {
        self.chain.get_by_user(&def.contract, address).await
    }

    pub async fn stacker_mapping(
        &self,
        cycles: &[u32],
    ) -> Result<StackerMapping, Error> {
        Ok(self.stackers.build(cycles).await?)
    }

    /// Cached balances for the poll's snapshot. `None` without a snapshot
    /// height or on a cache miss.
    pub async fn snapshot_balances(
        &self,
        def: &PollDefinition,
    ) -> Option<SnapshotBalances> {
        let height = def.snapshot_height?;
        self.cache.get(&def.poll_id, height).await
    }
}
