//! Snapshot balance cache.
//!
//! Maps `(poll, snapshot height)` to the balances already looked up for that
//! snapshot. A balance at a fixed height never changes, so entries have no
//! TTL and a write only ever adds or overwrites addresses: every `put` reads
//! the stored map, merges the new entries in, and writes the union back.
//! Concurrent writers from different processes may interleave; the loser's
//! addresses then look like misses and get refetched on the next load.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use futures::{StreamExt as _, stream};
use tokio::sync::Mutex;

use crate::{
    balance::BalanceFetcher,
    types::{Balance, Network, PollId, StacksAddress},
    upstream::{BlobStore, Error},
};

pub type SnapshotBalances = BTreeMap<StacksAddress, Balance>;

pub struct SnapshotCache {
    store: Arc<dyn BlobStore>,
    network: Network,
    /// Serializes read-merge-write cycles issued from this process
    write_lock: Mutex<()>,
}

impl SnapshotCache {
    pub fn new(store: Arc<dyn BlobStore>, network: Network) -> Self {
        Self {
            store,
            network,
            write_lock: Mutex::new(()),
        }
    }

    pub fn key(&self, poll_id: &PollId, height: u64) -> String {
        format!(
            "{}/polls/{poll_id}/stx-dust-voting-by-snapshot-{height}.json",
            self.network
        )
    }

    async fn load(&self, key: &str) -> Result<Option<SnapshotBalances>, Error> {
        let Some(bytes) = self.store.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| Error::malformed(key, err))
    }

    /// A miss is normal control flow. Store failures and undecodable blobs
    /// are logged and reported as a miss.
    pub async fn get(
        &self,
        poll_id: &PollId,
        height: u64,
    ) -> Option<SnapshotBalances> {
        let key = self.key(poll_id, height);
        match self.load(&key).await {
            Ok(balances) => balances,
            Err(err) => {
                tracing::warn!(%key, error = %err, "snapshot cache read failed");
                None
            }
        }
    }

    /// Merge `partial` into the stored map. Entries in `partial` win on
    /// collision.
    pub async fn put(
        &self,
        poll_id: &PollId,
        height: u64,
        partial: SnapshotBalances,
    ) -> Result<(), Error> {
        let key = self.key(poll_id, height);
        let _write_guard = self.write_lock.lock().await;
        // A failed read aborts the write, or the existing entries would be
        // dropped.
        let existing = self.store.get(&key).await?;
        let mut merged = match existing
            .map(|bytes| serde_json::from_slice::<SnapshotBalances>(&bytes))
        {
            None => SnapshotBalances::new(),
            Some(Ok(balances)) => balances,
            Some(Err(err)) => {
                tracing::warn!(
                    %key,
                    error = %err,
                    "replacing undecodable snapshot"
                );
                SnapshotBalances::new()
            }
        };
        let added = partial.len();
        merged.extend(partial);
        let bytes = serde_json::to_vec(&merged)
            .map_err(|err| Error::malformed(key.as_str(), err))?;
        self.store.put(&key, bytes).await?;
        tracing::debug!(
            %key,
            added,
            total = merged.len(),
            "snapshot cache updated"
        );
        Ok(())
    }

    /// Balances for every address in `addresses`.
    ///
    /// With a snapshot height, cached balances are served from the cache and
    /// the rest are fetched and merged back. Failed lookups count as zero
    /// and are not cached. Without a height, balances are current and the
    /// cache is bypassed.
    pub async fn resolve(
        &self,
        poll_id: &PollId,
        height: Option<u64>,
        addresses: &BTreeSet<StacksAddress>,
        fetcher: &BalanceFetcher,
        max_concurrent: usize,
    ) -> SnapshotBalances {
        let cached = match height {
            Some(height) => {
                self.get(poll_id, height).await.unwrap_or_default()
            }
            None => SnapshotBalances::new(),
        };
        let mut resolved: SnapshotBalances = cached
            .into_iter()
            .filter(|(address, _)| addresses.contains(address))
            .collect();
        let missing: Vec<StacksAddress> = addresses
            .iter()
            .filter(|address| !resolved.contains_key(address))
            .copied()
            .collect();
        tracing::debug!(
            %poll_id,
            ?height,
            hits = resolved.len(),
            misses = missing.len(),
            "resolving snapshot balances"
        );
        let fresh: SnapshotBalances = stream::iter(missing)
            .map(|address| async move {
                (address, fetcher.try_fetch(&address, height).await)
            })
            .buffer_unordered(max_concurrent.max(1))
            .fold(SnapshotBalances::new(), |mut fresh, (address, res)| {
                match res {
                    Ok(balance) => {
                        fresh.insert(address, balance);
                    }
                    Err(err) => tracing::warn!(
                        %address,
                        ?height,
                        error = %err,
                        "balance lookup failed, counting as zero"
                    ),
                }
                futures::future::ready(fresh)
            })
            .await;
        for address in addresses {
            resolved.entry(*address).or_default();
        }
        if let Some(height) = height {
            if !fresh.is_empty() {
                if let Err(err) =
                    self.put(poll_id, height, fresh.clone()).await
                {
                    tracing::warn!(
                        %poll_id,
                        height,
                        error = %err,
                        "failed to cache snapshot balances"
                    );
                }
            }
        }
        resolved.extend(fresh);
        resolved
    }
}
