//! In-memory collaborators for unit tests

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

use async_trait::async_trait;

use crate::{
    types::{ClarityValue, ContractId, StacksAddress, Token, clarity::Principal},
    upstream::{
        BTC_HISTORY_PAGE_SIZE, BalanceIndexer, BitcoinTxSource,
        BtcTransaction, Error, NameResolver, Page, PoxRegistry, RawBalance,
        ReadOnlyCaller, SignerEntry, StackerEntry,
        schema::{Prevout, TxInput, TxStatus},
    },
};

pub fn addr(n: u8) -> StacksAddress {
    StacksAddress::new(StacksAddress::MAINNET_SINGLESIG, [n; 20]).unwrap()
}

pub fn testnet_addr(n: u8) -> StacksAddress {
    StacksAddress::new(StacksAddress::TESTNET_SINGLESIG, [n; 20]).unwrap()
}

pub fn contract() -> ContractId {
    "SP000000000000000000002Q6VF78.poll".parse().unwrap()
}

pub fn unavailable(endpoint: &str) -> Error {
    Error::UpstreamUnavailable {
        endpoint: endpoint.to_owned(),
        reason: "connection refused".to_owned(),
    }
}

/// `whole` STX expressed in micro-units, `locked` of it locked
pub fn stx(whole: u64, locked: u64) -> RawBalance {
    RawBalance {
        balance: u128::from(whole) * 1_000_000,
        locked: u128::from(locked) * 1_000_000,
    }
}

fn page<T: Clone>(items: &[T], limit: u32, offset: u32) -> Page<T> {
    Page {
        total: items.len() as u32,
        results: items
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect(),
    }
}

#[derive(Default)]
pub struct MockIndexer {
    balances: HashMap<StacksAddress, RawBalance>,
    failing: HashSet<StacksAddress>,
    calls: AtomicUsize,
}

impl MockIndexer {
    pub fn with_balance(
        mut self,
        address: StacksAddress,
        raw: RawBalance,
    ) -> Self {
        self.balances.insert(address, raw);
        self
    }

    pub fn failing(mut self, address: StacksAddress) -> Self {
        self.failing.insert(address);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BalanceIndexer for MockIndexer {
    async fn balance(
        &self,
        address: &StacksAddress,
        _token: &Token,
        _until_block: Option<u64>,
    ) -> Result<RawBalance, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(address) {
            return Err(unavailable("balance"));
        }
        Ok(self.balances.get(address).copied().unwrap_or_default())
    }
}

/// `(some {user, vote: (list {option, volume})})`
pub fn vote_value(user: StacksAddress, votes: &[(&str, u128)]) -> ClarityValue {
    let vote = votes
        .iter()
        .map(|(option, volume)| {
            ClarityValue::Tuple(BTreeMap::from([
                (
                    "option".to_owned(),
                    ClarityValue::StringAscii((*option).to_owned()),
                ),
                ("volume".to_owned(), ClarityValue::UInt(*volume)),
            ]))
        })
        .collect();
    ClarityValue::OptionalSome(Box::new(ClarityValue::Tuple(BTreeMap::from([
        ("user".to_owned(), ClarityValue::from(user)),
        ("vote".to_owned(), ClarityValue::List(vote)),
    ]))))
}

/// `(ok {total, options: (list {id, votes, locked, unlocked})})`
pub fn aggregate_value(
    total: u128,
    options: &[(&str, u128, u128, u128)],
) -> ClarityValue {
    let options = options
        .iter()
        .map(|(id, votes, locked, unlocked)| {
            ClarityValue::Tuple(BTreeMap::from([
                ("id".to_owned(), ClarityValue::StringAscii((*id).to_owned())),
                ("votes".to_owned(), ClarityValue::UInt(*votes)),
                ("locked".to_owned(), ClarityValue::UInt(*locked)),
                ("unlocked".to_owned(), ClarityValue::UInt(*unlocked)),
            ]))
        })
        .collect();
    ClarityValue::ResponseOk(Box::new(ClarityValue::Tuple(BTreeMap::from([
        ("total".to_owned(), ClarityValue::UInt(total)),
        ("options".to_owned(), ClarityValue::List(options)),
    ]))))
}

#[derive(Default)]
pub struct MockCaller {
    aggregate: Option<ClarityValue>,
    positions: HashMap<u64, ClarityValue>,
    failing_positions: HashSet<u64>,
    by_user: HashMap<StacksAddress, ClarityValue>,
    position_calls: AtomicUsize,
}

impl MockCaller {
    pub fn with_aggregate(mut self, value: ClarityValue) -> Self {
        self.aggregate = Some(value);
        self
    }

    pub fn with_position(mut self, position: u64, value: ClarityValue) -> Self {
        self.positions.insert(position, value);
        self
    }

    pub fn failing_position(mut self, position: u64) -> Self {
        self.failing_positions.insert(position);
        self
    }

    pub fn with_user_vote(
        mut self,
        user: StacksAddress,
        value: ClarityValue,
    ) -> Self {
        self.by_user.insert(user, value);
        self
    }

    /// Positions `1..=n`, voter `n` votes `n` on option `a`
    pub fn with_ledger(mut self, n: u8) -> Self {
        for i in 1..=n {
            self.positions.insert(
                u64::from(i),
                vote_value(addr(i), &[("a", u128::from(i))]),
            );
        }
        self
    }

    pub fn position_calls(&self) -> usize {
        self.position_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadOnlyCaller for MockCaller {
    async fn call_read_only(
        &self,
        _contract: &ContractId,
        function: &str,
        args: &[ClarityValue],
    ) -> Result<ClarityValue, Error> {
        match (function, args) {
            ("get-results", []) => self
                .aggregate
                .clone()
                .ok_or_else(|| unavailable("get-results")),
            ("get-result-at-position", [position]) => {
                self.position_calls.fetch_add(1, Ordering::SeqCst);
                let position = position.as_u64()?;
                if self.failing_positions.contains(&position) {
                    return Err(unavailable("get-result-at-position"));
                }
                Ok(self
                    .positions
                    .get(&position)
                    .cloned()
                    .unwrap_or(ClarityValue::OptionalNone))
            }
            (
                "get-result-by-user",
                [ClarityValue::Principal(Principal::Standard(user))],
            ) => Ok(self
                .by_user
                .get(user)
                .cloned()
                .unwrap_or(ClarityValue::OptionalNone)),
            _ => Err(Error::malformed(function, "unexpected call")),
        }
    }
}

#[derive(Default)]
pub struct MockNames {
    names: HashMap<StacksAddress, String>,
    failing: HashSet<StacksAddress>,
    calls: AtomicUsize,
}

impl MockNames {
    pub fn with_name(mut self, address: StacksAddress, name: &str) -> Self {
        self.names.insert(address, name.to_owned());
        self
    }

    pub fn failing(mut self, address: StacksAddress) -> Self {
        self.failing.insert(address);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NameResolver for MockNames {
    async fn primary_name(
        &self,
        address: &StacksAddress,
    ) -> Result<Option<String>, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(address) {
            return Err(unavailable("names"));
        }
        Ok(self.names.get(address).cloned())
    }
}

#[derive(Default)]
pub struct MockPox {
    signers: HashMap<u32, Vec<SignerEntry>>,
    stackers: HashMap<(u32, String), Vec<StackerEntry>>,
    failing_keys: HashSet<String>,
    rejecting_keys: HashSet<String>,
    missing_cycles: HashSet<u32>,
    /// Signer page requests left to fail before succeeding
    flaky_signer_pages: AtomicU32,
    calls: AtomicUsize,
}

impl MockPox {
    pub fn with_signer(mut self, cycle: u32, signing_key: &str) -> Self {
        self.signers.entry(cycle).or_default().push(SignerEntry {
            signing_key: signing_key.to_owned(),
            stacked_amount: None,
        });
        self
    }

    pub fn with_stacker(
        mut self,
        cycle: u32,
        signing_key: &str,
        stacker: StacksAddress,
        pox_address: &str,
    ) -> Self {
        self.stackers
            .entry((cycle, signing_key.to_owned()))
            .or_default()
            .push(StackerEntry {
                stacker_address: stacker.to_string(),
                pox_address: pox_address.to_owned(),
            });
        self
    }

    pub fn failing_signer(mut self, signing_key: &str) -> Self {
        self.failing_keys.insert(signing_key.to_owned());
        self
    }

    /// Stacker pages for `signing_key` answer with a 400
    pub fn rejecting_signer(mut self, signing_key: &str) -> Self {
        self.rejecting_keys.insert(signing_key.to_owned());
        self
    }

    pub fn missing_cycle(mut self, cycle: u32) -> Self {
        self.missing_cycles.insert(cycle);
        self
    }

    pub fn flaky(self, failures: u32) -> Self {
        self.flaky_signer_pages.store(failures, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PoxRegistry for MockPox {
    async fn signers(
        &self,
        cycle: u32,
        limit: u32,
        offset: u32,
    ) -> Result<Page<SignerEntry>, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .flaky_signer_pages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
        {
            return Err(unavailable("signers"));
        }
        if self.missing_cycles.contains(&cycle) {
            return Err(Error::NotFound(format!("cycle {cycle}")));
        }
        let signers = self.signers.get(&cycle).map(Vec::as_slice).unwrap_or(&[]);
        Ok(page(signers, limit, offset))
    }

    async fn stackers(
        &self,
        cycle: u32,
        signing_key: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Page<StackerEntry>, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_keys.contains(signing_key) {
            return Err(unavailable("stackers"));
        }
        if self.rejecting_keys.contains(signing_key) {
            return Err(Error::Rejected {
                endpoint: "stackers".to_owned(),
                status: 400,
            });
        }
        let stackers = self
            .stackers
            .get(&(cycle, signing_key.to_owned()))
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        Ok(page(stackers, limit, offset))
    }
}

static NEXT_TXID: AtomicU64 = AtomicU64::new(1);

/// Transaction spending from `senders`, confirmed at `height` when given
pub fn btc_tx(height: Option<u64>, senders: &[&str]) -> BtcTransaction {
    BtcTransaction {
        txid: format!("{:064x}", NEXT_TXID.fetch_add(1, Ordering::SeqCst)),
        status: TxStatus {
            confirmed: height.is_some(),
            block_height: height,
        },
        vin: senders
            .iter()
            .map(|sender| TxInput {
                prevout: Some(Prevout {
                    scriptpubkey_address: Some((*sender).to_owned()),
                }),
            })
            .collect(),
    }
}

#[derive(Default)]
pub struct MockBitcoin {
    txs: HashMap<String, Vec<BtcTransaction>>,
    failing: HashSet<String>,
    page_calls: AtomicUsize,
}

impl MockBitcoin {
    pub fn with_tx(mut self, btc_address: &str, tx: BtcTransaction) -> Self {
        self.txs.entry(btc_address.to_owned()).or_default().push(tx);
        self
    }

    pub fn failing(mut self, btc_address: &str) -> Self {
        self.failing.insert(btc_address.to_owned());
        self
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BitcoinTxSource for MockBitcoin {
    /// Transactions in insertion order count as newest first
    async fn confirmed_txs(
        &self,
        btc_address: &str,
        last_seen: Option<&str>,
    ) -> Result<Vec<BtcTransaction>, Error> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(btc_address) {
            return Err(unavailable("address txs"));
        }
        let confirmed = self
            .txs
            .get(btc_address)
            .into_iter()
            .flatten()
            .filter(|tx| tx.status.confirmed);
        let page: Vec<BtcTransaction> = match last_seen {
            Some(txid) => confirmed
                .skip_while(|tx| tx.txid != txid)
                .skip(1)
                .take(BTC_HISTORY_PAGE_SIZE)
                .cloned()
                .collect(),
            None => confirmed.take(BTC_HISTORY_PAGE_SIZE).cloned().collect(),
        };
        Ok(page)
    }
}
