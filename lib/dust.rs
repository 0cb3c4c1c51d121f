//! Votes cast by sending a dust transfer to an option's receiving address.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    balance::BalanceFetcher,
    cache::SnapshotCache,
    types::{Attributions, ChannelTally, OptionId, PollId, StacksAddress},
};

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct DustOption {
    pub id: OptionId,
    pub receiving_address: StacksAddress,
    /// Addresses observed sending to `receiving_address`
    #[serde(default)]
    pub senders: Vec<StacksAddress>,
}

pub struct DustVoteResolver {
    cache: Arc<SnapshotCache>,
    fetcher: BalanceFetcher,
    max_concurrent: usize,
}

impl DustVoteResolver {
    pub fn new(
        cache: Arc<SnapshotCache>,
        fetcher: BalanceFetcher,
        max_concurrent: usize,
    ) -> Self {
        Self {
            cache,
            fetcher,
            max_concurrent,
        }
    }

    pub async fn resolve(
        &self,
        poll_id: &PollId,
        options: &[DustOption],
        snapshot_height: Option<u64>,
    ) -> ChannelTally {
        let mut attributions = Attributions::new();
        for option in options {
            let voters = attributions.entry(option.id.clone()).or_default();
            for sender in &option.senders {
                if *sender != option.receiving_address {
                    voters.insert(*sender, BTreeSet::new());
                }
            }
        }
        let senders: BTreeSet<StacksAddress> = attributions
            .values()
            .flat_map(BTreeMap::keys)
            .copied()
            .collect();
        let balances = self
            .cache
            .resolve(
                poll_id,
                snapshot_height,
                &senders,
                &self.fetcher,
                self.max_concurrent,
            )
            .await;
        let tally = ChannelTally::from_attributions(&attributions, &balances);
        tracing::info!(
            %poll_id,
            options = tally.options.len(),
            unique_voters = tally.unique_voters,
            "resolved dust votes"
        );
        tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_util::{MockIndexer, addr, stx},
        types::{Network, Token},
        upstream::memory::MemoryBlobStore,
    };

    fn resolver(indexer: MockIndexer) -> DustVoteResolver {
        let cache = SnapshotCache::new(
            Arc::new(MemoryBlobStore::new()),
            Network::Mainnet,
        );
        DustVoteResolver::new(
            Arc::new(cache),
            BalanceFetcher::new(Arc::new(indexer), Token::Stx),
            4,
        )
    }

    #[tokio::test]
    async fn test_zero_balance_sender_still_counts() {
        let indexer = MockIndexer::default()
            .with_balance(addr(1), stx(100, 40))
            .with_balance(addr(2), stx(0, 0));
        let options = [DustOption {
            id: OptionId::from("yes"),
            receiving_address: addr(50),
            senders: vec![addr(1), addr(2)],
        }];
        let tally = resolver(indexer)
            .resolve(&PollId::from("p"), &options, Some(1000))
            .await;
        let yes = &tally.options[&OptionId::from("yes")];
        assert_eq!(yes.total_voters, 2);
        assert_eq!(yes.total_stx, 100);
        assert_eq!(yes.total_locked_stx, 40);
        assert_eq!(yes.total_unlocked_stx, 60);
        assert_eq!(tally.unique_voters, 2);
    }

    #[tokio::test]
    async fn test_unique_voters_across_options() {
        let indexer = MockIndexer::default()
            .with_balance(addr(1), stx(10, 0))
            .with_balance(addr(2), stx(20, 0))
            .with_balance(addr(3), stx(30, 0));
        let options = [
            DustOption {
                id: OptionId::from("a"),
                receiving_address: addr(50),
                senders: vec![addr(1), addr(2), addr(2)],
            },
            DustOption {
                id: OptionId::from("b"),
                receiving_address: addr(51),
                senders: vec![addr(2), addr(3), addr(51)],
            },
        ];
        let tally = resolver(indexer)
            .resolve(&PollId::from("p"), &options, Some(1000))
            .await;
        assert_eq!(tally.unique_voters, 3);
        let a = &tally.options[&OptionId::from("a")];
        let b = &tally.options[&OptionId::from("b")];
        assert_eq!((a.total_voters, a.total_stx), (2, 30));
        assert_eq!((b.total_voters, b.total_stx), (2, 50));
        let both = b.voters.iter().find(|v| v.address == addr(2)).unwrap();
        assert_eq!(both.voted_options.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_balance_counts_as_zero() {
        let indexer = MockIndexer::default()
            .with_balance(addr(1), stx(5, 0))
            .failing(addr(2));
        let options = [DustOption {
            id: OptionId::from("a"),
            receiving_address: addr(50),
            senders: vec![addr(1), addr(2)],
        }];
        let tally = resolver(indexer)
            .resolve(&PollId::from("p"), &options, None)
            .await;
        let a = &tally.options[&OptionId::from("a")];
        assert_eq!((a.total_voters, a.total_stx), (2, 5));
    }

    #[test]
    fn test_option_deserialize() {
        let option: DustOption = serde_json::from_value(serde_json::json!({
            "id": "yes",
            "receiving_address": "SP000000000000000000002Q6VF78",
        }))
        .unwrap();
        assert!(option.senders.is_empty());
    }
}
