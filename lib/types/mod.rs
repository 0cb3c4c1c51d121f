use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use serde::{Deserialize, Serialize};

pub mod address;
pub mod clarity;

pub use address::{ContractId, StacksAddress};
pub use clarity::ClarityValue;

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Hash,
    PartialEq,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub fn default_stacks_api_url(&self) -> &'static str {
        match self {
            Self::Mainnet => "https://api.hiro.so",
            Self::Testnet => "https://api.testnet.hiro.so",
        }
    }

    pub fn default_bitcoin_api_url(&self) -> &'static str {
        match self {
            Self::Mainnet => "https://mempool.space/api",
            Self::Testnet => "https://mempool.space/testnet4/api",
        }
    }
}

#[derive(
    Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct PollId(pub String);

impl fmt::Display for PollId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for PollId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[derive(
    Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct OptionId(pub String);

impl fmt::Display for OptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for OptionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Token whose balance weighs dust and BTC votes
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Token {
    #[default]
    Stx,
    Fungible {
        /// `ADDRESS.contract::token-name`
        asset_identifier: String,
        decimals: u32,
    },
}

impl Token {
    pub const STX_DECIMALS: u32 = 6;

    pub fn decimals(&self) -> u32 {
        match self {
            Self::Stx => Self::STX_DECIMALS,
            Self::Fungible { decimals, .. } => *decimals,
        }
    }
}

/// Balance at a snapshot height, in whole token units
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize,
)]
pub struct Balance {
    pub locked: u64,
    pub unlocked: u64,
    pub total: u64,
}

impl Balance {
    /// Convert indexer micro-units to whole units.
    pub fn from_base_units(total: u128, locked: u128, decimals: u32) -> Self {
        let scale = 10u128.saturating_pow(decimals);
        let to_whole =
            |v: u128| u64::try_from(v / scale).unwrap_or(u64::MAX);
        let total = to_whole(total);
        let locked = to_whole(locked).min(total);
        Self {
            locked,
            unlocked: total - locked,
            total,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.total == 0
    }
}

/// Vote recorded in the on-chain ledger
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct VoteRecord {
    /// 1-indexed position in the ledger
    pub position: u64,
    pub voter: StacksAddress,
    pub bns_name: Option<String>,
    pub option_votes: BTreeMap<OptionId, u64>,
    pub voting_power: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct AggregateOption {
    pub option_id: OptionId,
    pub votes: u64,
    pub locked: u64,
    pub unlocked: u64,
}

/// Authoritative totals read from the voting contract
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct AggregateTally {
    pub total_votes: u64,
    pub unique_voters: u64,
    pub options: Vec<AggregateOption>,
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct OptionContribution {
    pub option_id: OptionId,
    pub amount: u64,
}

/// Voter inferred from dust transfers or BTC activity
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct VoterRecord {
    pub address: StacksAddress,
    pub balance: Balance,
    pub voted_options: Vec<OptionContribution>,
    /// BTC addresses this voter was attributed through. Empty for dust votes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub btc_addresses: Vec<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct OptionChannelTally {
    pub total_voters: u64,
    pub total_stx: u64,
    pub total_locked_stx: u64,
    pub total_unlocked_stx: u64,
    pub voters: Vec<VoterRecord>,
}

impl OptionChannelTally {
    pub fn add_voter(&mut self, voter: VoterRecord, amount: u64) {
        self.total_voters += 1;
        self.total_stx = self.total_stx.saturating_add(amount);
        self.total_locked_stx =
            self.total_locked_stx.saturating_add(voter.balance.locked);
        self.total_unlocked_stx =
            self.total_unlocked_stx.saturating_add(voter.balance.unlocked);
        self.voters.push(voter);
    }
}

/// Per-option tally for one inferred vote channel
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct ChannelTally {
    pub options: BTreeMap<OptionId, OptionChannelTally>,
    /// Distinct voters within this channel only
    pub unique_voters: u64,
}

/// Voters attributed to each option of a channel, with the BTC addresses
/// each one was attributed through
pub type Attributions =
    BTreeMap<OptionId, BTreeMap<StacksAddress, BTreeSet<String>>>;

impl ChannelTally {
    /// Every voter weighs its full balance on each option it voted for.
    /// Addresses missing from `balances` weigh zero and still count.
    pub fn from_attributions(
        attributions: &Attributions,
        balances: &BTreeMap<StacksAddress, Balance>,
    ) -> Self {
        let balance_of = |address: &StacksAddress| {
            balances.get(address).copied().unwrap_or_default()
        };
        let mut voted =
            BTreeMap::<StacksAddress, Vec<OptionContribution>>::new();
        for (option_id, voters) in attributions {
            for address in voters.keys() {
                voted.entry(*address).or_default().push(OptionContribution {
                    option_id: option_id.clone(),
                    amount: balance_of(address).total,
                });
            }
        }
        let mut tally = Self {
            options: BTreeMap::new(),
            unique_voters: voted.len() as u64,
        };
        for (option_id, voters) in attributions {
            let option = tally.options.entry(option_id.clone()).or_default();
            for (address, btc_addresses) in voters {
                let balance = balance_of(address);
                option.add_voter(
                    VoterRecord {
                        address: *address,
                        balance,
                        voted_options: voted
                            .get(address)
                            .cloned()
                            .unwrap_or_default(),
                        btc_addresses: btc_addresses.iter().cloned().collect(),
                    },
                    balance.total,
                );
            }
        }
        tally
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct OptionTally {
    pub option_id: OptionId,
    pub raw_count: u64,
    pub percentage: f64,
    pub locked_stx: u64,
    pub unlocked_stx: u64,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct PollResultSet {
    pub poll_id: PollId,
    pub snapshot_height: Option<u64>,
    pub total_votes: u64,
    pub total_unique_voters: u64,
    pub tallies: Vec<OptionTally>,
}
