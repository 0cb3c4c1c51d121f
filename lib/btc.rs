//! Votes cast by sending BTC to an option's address.
//!
//! A BTC sender is attributed to the STX stackers whose PoX reward address it
//! is, for the reward cycles the option lists. Senders that are not a known
//! reward address carry no vote.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    ops::RangeInclusive,
    str::FromStr,
    sync::Arc,
};

use bitcoin::address::{Address, NetworkUnchecked};
use futures::{StreamExt as _, stream};
use serde::{Deserialize, Deserializer, Serialize, de};

use crate::{
    balance::BalanceFetcher,
    cache::SnapshotCache,
    stacker::StackerMappingBuilder,
    types::{
        Attributions, ChannelTally, Network, OptionId, PollId, StacksAddress,
    },
    upstream::{BitcoinTxSource, Error},
};

/// PoX reward cycles, written either as `"120,121"` or `[120, 121]`
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PoxCycles(pub Vec<u32>);

impl FromStr for PoxCycles {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

impl fmt::Display for PoxCycles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = itertools::join(&self.0, ",");
        f.write_str(&joined)
    }
}

impl<'de> Deserialize<'de> for PoxCycles {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            List(Vec<u32>),
            Text(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::List(cycles) => Ok(Self(cycles)),
            Repr::Text(text) => text.parse().map_err(de::Error::custom),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct BtcOption {
    pub id: OptionId,
    pub btc_address: String,
    pub pox_cycles: PoxCycles,
}

/// Bitcoin block heights whose confirmed transactions count
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct HeightWindow {
    pub start: u64,
    pub end: u64,
}

impl HeightWindow {
    pub fn range(&self) -> RangeInclusive<u64> {
        self.start..=self.end
    }
}

fn bitcoin_network(network: Network) -> bitcoin::Network {
    match network {
        Network::Mainnet => bitcoin::Network::Bitcoin,
        Network::Testnet => bitcoin::Network::Testnet,
    }
}

/// Reject options with an unparsable BTC address, one for another network,
/// or PoX cycle 0
pub fn validate_options(
    options: &[BtcOption],
    network: Network,
) -> Result<(), Error> {
    let expected = bitcoin_network(network);
    for option in options {
        if option.pox_cycles.0.contains(&0) {
            return Err(Error::ValidationFailure(format!(
                "option `{}`: invalid PoX cycle 0",
                option.id
            )));
        }
        let address: Address<NetworkUnchecked> =
            option.btc_address.parse().map_err(|err| {
                Error::ValidationFailure(format!(
                    "option `{}`: invalid BTC address `{}`: {err}",
                    option.id, option.btc_address
                ))
            })?;
        if !address.is_valid_for_network(expected) {
            return Err(Error::ValidationFailure(format!(
                "option `{}`: BTC address `{}` is not a {network} address",
                option.id, option.btc_address
            )));
        }
    }
    Ok(())
}

/// Default cap on confirmed transactions read per option address
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

pub struct BtcVoteResolver {
    txs: Arc<dyn BitcoinTxSource>,
    stackers: StackerMappingBuilder,
    cache: Arc<SnapshotCache>,
    fetcher: BalanceFetcher,
    network: Network,
    max_concurrent: usize,
    window: Option<HeightWindow>,
    history_limit: usize,
}

impl BtcVoteResolver {
    pub fn new(
        txs: Arc<dyn BitcoinTxSource>,
        stackers: StackerMappingBuilder,
        cache: Arc<SnapshotCache>,
        fetcher: BalanceFetcher,
        network: Network,
        max_concurrent: usize,
    ) -> Self {
        Self {
            txs,
            stackers,
            cache,
            fetcher,
            network,
            max_concurrent: max_concurrent.max(1),
            window: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_window(mut self, window: Option<HeightWindow>) -> Self {
        self.window = window;
        self
    }

    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit.max(1);
        self
    }

    /// Distinct senders of counted transactions to `option`, excluding the
    /// option's own address. Empty when the history cannot be read.
    async fn senders(&self, option: &BtcOption) -> BTreeSet<String> {
        let txs = match self
            .txs
            .address_txs(&option.btc_address, self.history_limit)
            .await
        {
            Ok(txs) => txs,
            Err(err) => {
                tracing::warn!(
                    option = %option.id,
                    btc_address = %option.btc_address,
                    error = %err,
                    "failed to read BTC history, treating as inactive"
                );
                return BTreeSet::new();
            }
        };
        let window = self.window.map(|window| window.range());
        txs.iter()
            .filter(|tx| tx.counts_within(window.as_ref()))
            .flat_map(|tx| tx.sender_addresses())
            .filter(|sender| *sender != option.btc_address)
            .map(str::to_owned)
            .collect()
    }

    pub async fn resolve(
        &self,
        poll_id: &PollId,
        options: &[BtcOption],
        snapshot_height: Option<u64>,
    ) -> Result<ChannelTally, Error> {
        validate_options(options, self.network)?;
        let active: Vec<(&BtcOption, BTreeSet<String>)> = stream::iter(
            options
                .iter()
                .map(|option| async move { (option, self.senders(option).await) })
                .collect::<Vec<_>>(),
        )
            .buffered(self.max_concurrent)
            .filter(|(_, senders)| futures::future::ready(!senders.is_empty()))
            .collect()
            .await;
        if active.is_empty() {
            tracing::info!(%poll_id, "no BTC vote activity");
            return Ok(ChannelTally::default());
        }
        let cycles: Vec<u32> = active
            .iter()
            .flat_map(|(option, _)| option.pox_cycles.0.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mapping = self.stackers.build(&cycles).await?;

        let mut attributions = Attributions::new();
        for (option, senders) in &active {
            let voters = attributions.entry(option.id.clone()).or_default();
            for sender in senders {
                for stacker in mapping.get(sender) {
                    voters
                        .entry(*stacker)
                        .or_insert_with(BTreeSet::new)
                        .insert(sender.clone());
                }
            }
        }
        let stackers: BTreeSet<StacksAddress> = attributions
            .values()
            .flat_map(BTreeMap::keys)
            .copied()
            .collect();
        let balances = self
            .cache
            .resolve(
                poll_id,
                snapshot_height,
                &stackers,
                &self.fetcher,
                self.max_concurrent,
            )
            .await;
        let tally = ChannelTally::from_attributions(&attributions, &balances);
        tracing::info!(
            %poll_id,
            active_options = active.len(),
            unique_voters = tally.unique_voters,
            "resolved BTC votes"
        );
        Ok(tally)
    }
}
