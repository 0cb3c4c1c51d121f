//! BTC reward address to STX stacker mapping, crawled from the PoX registry.
//!
//! For each cycle, signers are paged through, and for each signer its
//! stackers. A page that still fails once the retry policy is exhausted ends
//! only its own branch, so the mapping may be partial.

use std::{collections::BTreeMap, future::Future, sync::Arc};

use futures::{StreamExt as _, stream};
use serde::{Deserialize, Serialize};

use crate::{
    retry::RetryPolicy,
    types::StacksAddress,
    upstream::{Error, Page, PoxRegistry},
};

pub const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct StackerMapping(BTreeMap<String, Vec<StacksAddress>>);

impl StackerMapping {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stackers rewarded at `btc_address`
    pub fn get(&self, btc_address: &str) -> &[StacksAddress] {
        self.0.get(btc_address).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn insert(&mut self, btc_address: String, stacker: StacksAddress) {
        let stackers = self.0.entry(btc_address).or_default();
        if !stackers.contains(&stacker) {
            stackers.push(stacker);
        }
    }

    pub fn merge(&mut self, other: Self) {
        for (btc_address, stackers) in other.0 {
            for stacker in stackers {
                self.insert(btc_address.clone(), stacker);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[StacksAddress])> {
        self.0
            .iter()
            .map(|(btc, stackers)| (btc.as_str(), stackers.as_slice()))
    }
}

#[derive(Clone)]
pub struct StackerMappingBuilder {
    registry: Arc<dyn PoxRegistry>,
    retry: RetryPolicy,
    page_size: u32,
    max_concurrent: usize,
}

impl StackerMappingBuilder {
    pub fn new(
        registry: Arc<dyn PoxRegistry>,
        retry: RetryPolicy,
        page_size: u32,
        max_concurrent: usize,
    ) -> Self {
        Self {
            registry,
            retry,
            page_size: page_size.max(1),
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Page through an offset-paginated listing until `offset >= total` or
    /// an empty page. Items collected before a failed page are kept.
    async fn collect_pages<T, F, Fut>(&self, label: &str, fetch: F) -> Vec<T>
    where
        F: Fn(u32, u32) -> Fut,
        Fut: Future<Output = Result<Page<T>, Error>>,
    {
        let limit = self.page_size;
        let mut offset = 0u32;
        let mut items = Vec::new();
        loop {
            let fetched = self.retry.retry(label, || fetch(limit, offset)).await;
            let page = match fetched {
                Ok(page) => page,
                Err(Error::NotFound(_)) => break,
                Err(err) => {
                    tracing::warn!(
                        label,
                        offset,
                        error = %err,
                        "abandoning branch, mapping will be partial"
                    );
                    break;
                }
            };
            tracing::debug!(
                label,
                offset,
                received = page.results.len(),
                total = page.total,
                "page"
            );
            if page.results.is_empty() {
                break;
            }
            items.extend(page.results);
            offset = offset.saturating_add(limit);
            if offset >= page.total {
                break;
            }
        }
        items
    }

    async fn crawl_signer(
        &self,
        cycle: u32,
        signing_key: String,
    ) -> StackerMapping {
        let label = format!("cycle {cycle} signer {signing_key} stackers");
        let stackers = self
            .collect_pages(&label, |limit, offset| {
                self.registry.stackers(cycle, &signing_key, limit, offset)
            })
            .await;
        let mut mapping = StackerMapping::default();
        for entry in stackers {
            match entry.stacker_address.parse::<StacksAddress>() {
                Ok(stacker) => mapping.insert(entry.pox_address, stacker),
                Err(err) => tracing::warn!(
                    cycle,
                    stacker = %entry.stacker_address,
                    error = %err,
                    "skipping stacker with invalid address"
                ),
            }
        }
        mapping
    }

    async fn crawl_cycle(&self, cycle: u32) -> StackerMapping {
        let label = format!("cycle {cycle} signers");
        let signers = self
            .collect_pages(&label, |limit, offset| {
                self.registry.signers(cycle, limit, offset)
            })
            .await;
        tracing::debug!(cycle, signers = signers.len(), "crawling signers");
        stream::iter(signers)
            .map(|signer| self.crawl_signer(cycle, signer.signing_key))
            .buffer_unordered(self.max_concurrent)
            .fold(StackerMapping::default(), |mut acc, mapping| {
                acc.merge(mapping);
                futures::future::ready(acc)
            })
            .await
    }

    pub async fn build(&self, cycles: &[u32]) -> Result<StackerMapping, Error> {
        if let Some(cycle) = cycles.iter().find(|cycle| **cycle == 0) {
            return Err(Error::ValidationFailure(format!(
                "invalid PoX cycle {cycle}"
            )));
        }
        let mut cycles = cycles.to_vec();
        cycles.sort_unstable();
        cycles.dedup();
        let mapping = stream::iter(cycles)
            .map(|cycle| self.crawl_cycle(cycle))
            .buffer_unordered(self.max_concurrent)
            .fold(StackerMapping::default(), |mut acc, mapping| {
                acc.merge(mapping);
                futures::future::ready(acc)
            })
            .await;
        tracing::info!(btc_addresses = mapping.len(), "built stacker mapping");
        Ok(mapping)
    }
}
