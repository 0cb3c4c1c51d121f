//! Reads the voting contract's ledger: the aggregate tally, individual
//! positions, and per-user votes.

use std::{collections::BTreeMap, sync::Arc};

use futures::{StreamExt as _, stream};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    types::{
        AggregateOption, AggregateTally, ClarityValue, ContractId, Network,
        OptionId, StacksAddress, VoteRecord,
        clarity::{Principal, SchemaError, TupleExt as _},
    },
    upstream::{self, NameResolver, ReadOnlyCaller},
};

mod function {
    pub const GET_RESULTS: &str = "get-results";
    pub const GET_RESULT_AT_POSITION: &str = "get-result-at-position";
    pub const GET_RESULT_BY_USER: &str = "get-result-by-user";
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read aggregate results of `{contract}`")]
    Aggregate {
        contract: ContractId,
        #[source]
        source: upstream::Error,
    },
}

/// How voter addresses get a display name
#[derive(Clone)]
pub enum NameLookup {
    Disabled,
    /// Derived from the address, for networks without BNS data
    Synthetic,
    Resolver(Arc<dyn NameResolver>),
}

impl NameLookup {
    pub fn for_network(
        network: Network,
        resolver: Arc<dyn NameResolver>,
    ) -> Self {
        match network {
            Network::Mainnet => Self::Resolver(resolver),
            Network::Testnet => Self::Synthetic,
        }
    }
}

/// Last five characters of the address, with a `.btc` suffix
pub fn synthetic_name(address: &StacksAddress) -> String {
    let address = address.to_string();
    let tail = address
        .char_indices()
        .rev()
        .nth(4)
        .map_or(address.as_str(), |(idx, _)| &address[idx..]);
    format!("{tail}.btc")
}

fn parse_aggregate(value: ClarityValue) -> Result<AggregateTally, SchemaError> {
    let mut fields = value.into_ok()?.into_tuple()?;
    let unique_voters = fields.u64_or("total", 0)?;
    let options = fields
        .take_required("options")?
        .into_list()?
        .into_iter()
        .map(|option| {
            let option = option.into_tuple()?;
            Ok(AggregateOption {
                option_id: OptionId(option.required("id")?.to_label()?),
                votes: option.u64_or("votes", 0)?,
                locked: option.u64_or("locked", 0)?,
                unlocked: option.u64_or("unlocked", 0)?,
            })
        })
        .collect::<Result<Vec<_>, SchemaError>>()?;
    let total_votes = options
        .iter()
        .fold(0u64, |acc, option| acc.saturating_add(option.votes));
    Ok(AggregateTally {
        total_votes,
        unique_voters,
        options,
    })
}

/// `None` when the contract has no vote at this slot
fn parse_vote(
    position: u64,
    value: ClarityValue,
) -> Result<Option<VoteRecord>, SchemaError> {
    let Some(value) = value.into_present()? else {
        return Ok(None);
    };
    let mut fields = value.into_tuple()?;
    let voter = match fields.required("user")?.as_principal()? {
        Principal::Standard(address) | Principal::Contract(address, _) => {
            *address
        }
    };
    let position = fields.u64_or("position", position)?;
    let mut option_votes = BTreeMap::<OptionId, u64>::new();
    if let Some(vote) = fields.remove("vote") {
        for entry in vote.into_list()? {
            let entry = entry.into_tuple()?;
            let option_id = OptionId(entry.required("option")?.to_label()?);
            let volume = entry.u64_or("volume", 0)?;
            let slot = option_votes.entry(option_id).or_default();
            *slot = slot.saturating_add(volume);
        }
    }
    let cast = option_votes
        .values()
        .fold(0u64, |acc, volume| acc.saturating_add(*volume));
    let voting_power = fields.u64_or("voting-power", cast)?;
    Ok(Some(VoteRecord {
        position,
        voter,
        bns_name: None,
        option_votes,
        voting_power,
    }))
}

/// Position window of one "load more" step over the ledger, newest first
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct PageCursor {
    /// Number of ledger positions
    pub total_votes: u64,
    pub already_loaded: u64,
    pub page_size: u64,
}

impl PageCursor {
    pub fn new(total_votes: u64, page_size: u64) -> Self {
        Self {
            total_votes,
            already_loaded: 0,
            page_size,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.already_loaded >= self.total_votes
    }

    /// `(from, to_exclusive)` of the next batch
    pub fn next_range(&self) -> Option<(u64, u64)> {
        if self.is_exhausted() || self.page_size == 0 {
            return None;
        }
        let from = self.total_votes - self.already_loaded;
        Some((from, from.saturating_sub(self.page_size)))
    }

    /// Advance past `(from, to_exclusive)`, whether or not every position in
    /// it could be read.
    pub fn advance(&mut self, (from, to_exclusive): (u64, u64)) {
        self.already_loaded = self
            .already_loaded
            .saturating_add(from - to_exclusive)
            .min(self.total_votes);
    }
}

/// Votes loaded so far, newest first
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct VoteLog {
    pub cursor: PageCursor,
    pub records: Vec<VoteRecord>,
}

impl VoteLog {
    pub fn new(cursor: PageCursor) -> Self {
        Self {
            cursor,
            records: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct ChainResultReader {
    caller: Arc<dyn ReadOnlyCaller>,
    names: NameLookup,
    max_concurrent: usize,
}

impl ChainResultReader {
    pub fn new(
        caller: Arc<dyn ReadOnlyCaller>,
        names: NameLookup,
        max_concurrent: usize,
    ) -> Self {
        Self {
            caller,
            names,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// The only read allowed to fail the whole tally
    pub async fn get_aggregate(
        &self,
        contract: &ContractId,
    ) -> Result<AggregateTally, Error> {
        let read = async {
            let value = self
                .caller
                .call_read_only(contract, function::GET_RESULTS, &[])
                .await?;
            Ok::<_, upstream::Error>(parse_aggregate(value)?)
        };
        let tally = read.await.map_err(|source| Error::Aggregate {
            contract: contract.clone(),
            source,
        })?;
        tracing::debug!(
            %contract,
            total_votes = tally.total_votes,
            unique_voters = tally.unique_voters,
            options = tally.options.len(),
            "read aggregate tally"
        );
        Ok(tally)
    }

    async fn with_name(&self, mut record: VoteRecord) -> VoteRecord {
        record.bns_name = match &self.names {
            NameLookup::Disabled => None,
            NameLookup::Synthetic => Some(synthetic_name(&record.voter)),
            NameLookup::Resolver(resolver) => {
                match resolver.primary_name(&record.voter).await {
                    Ok(name) => name,
                    Err(err) => {
                        tracing::debug!(
                            voter = %record.voter,
                            error = %err,
                            "name lookup failed"
                        );
                        None
                    }
                }
            }
        };
        record
    }

    async fn read_position(
        &self,
        contract: &ContractId,
        position: u64,
    ) -> Option<VoteRecord> {
        let read = async {
            let value = self
                .caller
                .call_read_only(
                    contract,
                    function::GET_RESULT_AT_POSITION,
                    &[ClarityValue::from(u128::from(position))],
                )
                .await?;
            Ok::<_, upstream::Error>(parse_vote(position, value)?)
        };
        match read.await {
            Ok(Some(record)) => Some(self.with_name(record).await),
            Ok(None) => {
                tracing::debug!(%contract, position, "empty ledger position");
                None
            }
            Err(err) => {
                tracing::warn!(
                    %contract,
                    position,
                    error = %err,
                    "failed to read ledger position"
                );
                None
            }
        }
    }

    /// Records at positions `(to_exclusive, from]`, newest first. Positions
    /// that cannot be read are left out.
    pub async fn get_range(
        &self,
        contract: &ContractId,
        from: u64,
        to_exclusive: u64,
    ) -> Vec<VoteRecord> {
        if from <= to_exclusive {
            return Vec::new();
        }
        let mut records = stream::iter((to_exclusive + 1..=from).rev())
            .map(|position| self.read_position(contract, position))
            .buffer_unordered(self.max_concurrent)
            .fold(Vec::new(), |mut acc, record| {
                acc.extend(record);
                futures::future::ready(acc)
            })
            .await;
        records.sort_by(|a, b| b.position.cmp(&a.position));
        tracing::debug!(
            %contract,
            from,
            to_exclusive,
            read = records.len(),
            "read ledger range"
        );
        records
    }

    /// Load the next batch described by `log.cursor` and append it
    pub async fn load_more(
        &self,
        contract: &ContractId,
        log: VoteLog,
    ) -> VoteLog {
        let VoteLog {
            mut cursor,
            mut records,
        } = log;
        if let Some(range) = cursor.next_range() {
            records.extend(self.get_range(contract, range.0, range.1).await);
            cursor.advance(range);
        }
        VoteLog { cursor, records }
    }

    pub async fn get_by_user(
        &self,
        contract: &ContractId,
        address: &StacksAddress,
    ) -> Option<VoteRecord> {
        let read = async {
            let value = self
                .caller
                .call_read_only(
                    contract,
                    function::GET_RESULT_BY_USER,
                    &[ClarityValue::from(*address)],
                )
                .await?;
            Ok::<_, upstream::Error>(parse_vote(0, value)?)
        };
        match read.await {
            Ok(Some(record)) => Some(self.with_name(record).await),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(
                    %contract,
                    %address,
                    error = %err,
                    "failed to read user vote"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{
        MockCaller, MockNames, addr, aggregate_value, contract, testnet_addr,
        vote_value,
    };

    fn reader(caller: MockCaller) -> ChainResultReader {
        ChainResultReader::new(Arc::new(caller), NameLookup::Disabled, 4)
    }

    #[tokio::test]
    async fn test_aggregate_sums_option_votes() {
        let caller = MockCaller::default().with_aggregate(aggregate_value(
            3,
            &[("yes", 120, 100, 20), ("no", 30, 0, 30)],
        ));
        let tally = reader(caller).get_aggregate(&contract()).await.unwrap();
        assert_eq!(tally.total_votes, 150);
        assert_eq!(tally.unique_voters, 3);
        assert_eq!(tally.options[0].option_id, OptionId::from("yes"));
        assert_eq!(tally.options[0].locked, 100);
        assert_eq!(tally.options[1].votes, 30);
    }

    #[tokio::test]
    async fn test_aggregate_accepts_bare_tuple_and_missing_fields() {
        let option = ClarityValue::Tuple(BTreeMap::from([
            ("id".to_owned(), ClarityValue::UInt(7)),
            ("votes".to_owned(), ClarityValue::UInt(4)),
        ]));
        let value = ClarityValue::Tuple(BTreeMap::from([(
            "options".to_owned(),
            ClarityValue::List(vec![option]),
        )]));
        let tally = parse_aggregate(value).unwrap();
        assert_eq!(tally.unique_voters, 0);
        assert_eq!(tally.total_votes, 4);
        assert_eq!(tally.options[0].option_id, OptionId::from("7"));
        assert_eq!(tally.options[0].unlocked, 0);
    }

    #[tokio::test]
    async fn test_aggregate_failure_is_an_error() {
        let err = reader(MockCaller::default())
            .get_aggregate(&contract())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Aggregate {
                source: upstream::Error::UpstreamUnavailable { .. },
                ..
            }
        ));
        let caller = MockCaller::default().with_aggregate(
            ClarityValue::ResponseErr(Box::new(ClarityValue::UInt(1))),
        );
        assert!(reader(caller).get_aggregate(&contract()).await.is_err());
    }

    #[tokio::test]
    async fn test_range_reads_half_open_window_newest_first() {
        let caller = MockCaller::default().with_ledger(15);
        let records = reader(caller).get_range(&contract(), 10, 0).await;
        assert_eq!(records.len(), 10);
        assert!(records.iter().all(|r| (1..=10).contains(&r.position)));
        let positions: Vec<u64> = records.iter().map(|r| r.position).collect();
        assert_eq!(positions, (1..=10).rev().collect::<Vec<_>>());
        assert_eq!(records[0].voter, addr(10));
        assert_eq!(records[0].option_votes[&OptionId::from("a")], 10);
        assert_eq!(records[0].voting_power, 10);
    }

    #[tokio::test]
    async fn test_range_omits_failed_and_empty_positions() {
        let caller = MockCaller::default()
            .with_ledger(3)
            .failing_position(2)
            .with_position(3, ClarityValue::OptionalNone);
        let records = reader(caller).get_range(&contract(), 3, 0).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].position, 1);
    }

    #[tokio::test]
    async fn test_empty_range() {
        let caller = Arc::new(MockCaller::default().with_ledger(3));
        let reader =
            ChainResultReader::new(caller.clone(), NameLookup::Disabled, 2);
        assert!(reader.get_range(&contract(), 0, 0).await.is_empty());
        assert!(reader.get_range(&contract(), 2, 5).await.is_empty());
        assert_eq!(caller.position_calls(), 0);
    }

    #[test]
    fn test_synthetic_name_uses_address_tail() {
        let address = testnet_addr(9);
        let text = address.to_string();
        assert_eq!(
            synthetic_name(&address),
            format!("{}.btc", &text[text.len() - 5..])
        );
    }

    #[tokio::test]
    async fn test_testnet_names_are_synthetic() {
        let names = Arc::new(MockNames::default());
        let caller = MockCaller::default()
            .with_position(1, vote_value(testnet_addr(4), &[("a", 1)]));
        let reader = ChainResultReader::new(
            Arc::new(caller),
            NameLookup::for_network(Network::Testnet, names.clone()),
            1,
        );
        let records = reader.get_range(&contract(), 1, 0).await;
        assert_eq!(
            records[0].bns_name.as_deref(),
            Some(synthetic_name(&testnet_addr(4)).as_str())
        );
        assert_eq!(names.calls(), 0);
    }

    #[tokio::test]
    async fn test_name_lookup_failure_leaves_name_unset() {
        let names = MockNames::default()
            .with_name(addr(1), "alice.btc")
            .failing(addr(2));
        let caller = MockCaller::default().with_ledger(2);
        let reader = ChainResultReader::new(
            Arc::new(caller),
            NameLookup::for_network(Network::Mainnet, Arc::new(names)),
            2,
        );
        let records = reader.get_range(&contract(), 2, 0).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].bns_name, None);
        assert_eq!(records[1].bns_name.as_deref(), Some("alice.btc"));
    }

    #[test]
    fn test_cursor_arithmetic() {
        let mut cursor = PageCursor::new(45, 20);
        assert_eq!(cursor.next_range(), Some((45, 25)));
        cursor.advance((45, 25));
        assert_eq!(cursor.next_range(), Some((25, 5)));
        cursor.advance((25, 5));
        assert_eq!(cursor.next_range(), Some((5, 0)));
        cursor.advance((5, 0));
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.next_range(), None);
        assert_eq!(PageCursor::new(0, 20).next_range(), None);
    }

    #[tokio::test]
    async fn test_load_more_advances_by_range_length() {
        let caller = MockCaller::default().with_ledger(5).failing_position(4);
        let reader = reader(caller);
        let log = VoteLog::new(PageCursor::new(5, 3));
        let log = reader.load_more(&contract(), log).await;
        assert_eq!(log.cursor.already_loaded, 3);
        let positions: Vec<u64> =
            log.records.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![5, 3]);
        let log = reader.load_more(&contract(), log).await;
        assert_eq!(log.cursor.already_loaded, 5);
        assert_eq!(log.records.len(), 4);
        let log = reader.load_more(&contract(), log).await;
        assert_eq!(log.records.len(), 4);
    }

    #[tokio::test]
    async fn test_get_by_user() {
        let caller = MockCaller::default()
            .with_user_vote(addr(7), vote_value(addr(7), &[("b", 42)]));
        let reader = reader(caller);
        let record = reader.get_by_user(&contract(), &addr(7)).await.unwrap();
        assert_eq!(record.voter, addr(7));
        assert_eq!(record.option_votes[&OptionId::from("b")], 42);
        assert!(reader.get_by_user(&contract(), &addr(8)).await.is_none());
    }
}
