//! Interfaces to the external services the engine reads from.
//!
//! Each collaborator is an object-safe async trait so the resolvers can be
//! driven by the HTTP clients in [`http`] or by in-memory fakes.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{
    ClarityValue, ContractId, StacksAddress, Token,
    clarity::{DecodeError, SchemaError},
};

pub mod http;
pub mod memory;
pub mod schema;

pub use schema::{BtcTransaction, Page, SignerEntry, StackerEntry};

/// Failure taxonomy for upstream calls
#[derive(Debug, Error)]
pub enum Error {
    /// Timeout, 5xx, or network failure
    #[error("upstream unavailable ({endpoint}): {reason}")]
    UpstreamUnavailable { endpoint: String, reason: String },
    /// Valid "no data yet" signal
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed response from {endpoint}: {reason}")]
    MalformedResponse { endpoint: String, reason: String },
    /// Client error status other than 404, 408 and 429. The same request
    /// fails the same way.
    #[error("request rejected by {endpoint}: status {status}")]
    Rejected { endpoint: String, status: u16 },
    /// Rejected before any network call
    #[error("validation failed: {0}")]
    ValidationFailure(String),
}

impl Error {
    pub fn malformed(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedResponse {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable { .. } | Self::MalformedResponse { .. }
        )
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Self::malformed("clarity value", err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Self::malformed("clarity value", err)
    }
}

/// Balance as reported by the indexer, in base units
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RawBalance {
    pub balance: u128,
    pub locked: u128,
}

/// Read-only contract calls
#[async_trait]
pub trait ReadOnlyCaller: Send + Sync {
    async fn call_read_only(
        &self,
        contract: &ContractId,
        function: &str,
        args: &[ClarityValue],
    ) -> Result<ClarityValue, Error>;
}

#[async_trait]
pub trait BalanceIndexer: Send + Sync {
    async fn balance(
        &self,
        address: &StacksAddress,
        token: &Token,
        until_block: Option<u64>,
    ) -> Result<RawBalance, Error>;
}

/// Reverse BNS lookup
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn primary_name(
        &self,
        address: &StacksAddress,
    ) -> Result<Option<String>, Error>;
}

/// PoX reward-cycle registry
#[async_trait]
pub trait PoxRegistry: Send + Sync {
    async fn signers(
        &self,
        cycle: u32,
        limit: u32,
        offset: u32,
    ) -> Result<Page<SignerEntry>, Error>;

    async fn stackers(
        &self,
        cycle: u32,
        signing_key: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Page<StackerEntry>, Error>;
}

/// Confirmed transactions per page of Esplora address history
pub const BTC_HISTORY_PAGE_SIZE: usize = 25;

/// Bitcoin transaction history
#[async_trait]
pub trait BitcoinTxSource: Send + Sync {
    /// One page of confirmed transactions, newest first. With `last_seen`,
    /// the page starts after that transaction.
    async fn confirmed_txs(
        &self,
        btc_address: &str,
        last_seen: Option<&str>,
    ) -> Result<Vec<BtcTransaction>, Error>;

    /// Confirmed history, newest first, capped at `limit` transactions.
    /// Pages until a short page, or a page that makes no progress.
    async fn address_txs(
        &self,
        btc_address: &str,
        limit: usize,
    ) -> Result<Vec<BtcTransaction>, Error> {
        let mut txs: Vec<BtcTransaction> = Vec::new();
        while txs.len() < limit {
            let last_seen = txs.last().map(|tx| tx.txid.clone());
            let page = match self
                .confirmed_txs(btc_address, last_seen.as_deref())
                .await
            {
                Ok(page) => page,
                Err(Error::NotFound(_)) => break,
                Err(err) => return Err(err),
            };
            let stalled = page.last().is_none_or(|tx| {
                tx.txid.is_empty() || Some(&tx.txid) == last_seen.as_ref()
            });
            let short = page.len() < BTC_HISTORY_PAGE_SIZE;
            txs.extend(page);
            tracing::debug!(btc_address, loaded = txs.len(), "BTC history page");
            if short || stalled {
                break;
            }
        }
        if txs.len() > limit {
            tracing::warn!(
                btc_address,
                limit,
                "BTC history truncated, older transactions are ignored"
            );
            txs.truncate(limit);
        }
        Ok(txs)
    }
}

/// Key/value blob store backing the snapshot cache
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), Error>;
}
