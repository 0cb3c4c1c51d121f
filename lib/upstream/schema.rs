//! Typed response schemas for the upstream REST APIs.
//!
//! Unknown fields are ignored and optional fields default, so a response is
//! validated once here and never re-checked field by field downstream.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};

/// `{total, results}` page returned by the PoX registry
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Page<T> {
    #[serde(default)]
    pub total: u32,
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SignerEntry {
    pub signing_key: String,
    #[serde(default)]
    pub stacked_amount: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StackerEntry {
    pub stacker_address: String,
    pub pox_address: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct TxStatus {
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub block_height: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Prevout {
    #[serde(default)]
    pub scriptpubkey_address: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct TxInput {
    #[serde(default)]
    pub prevout: Option<Prevout>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct BtcTransaction {
    #[serde(default)]
    pub txid: String,
    #[serde(default)]
    pub status: TxStatus,
    #[serde(default)]
    pub vin: Vec<TxInput>,
}

impl BtcTransaction {
    /// Confirmed, and inside `window` when one is given
    pub fn counts_within(
        &self,
        window: Option<&std::ops::RangeInclusive<u64>>,
    ) -> bool {
        if !self.status.confirmed {
            return false;
        }
        match (window, self.status.block_height) {
            (None, _) => true,
            (Some(window), Some(height)) => window.contains(&height),
            (Some(_), None) => false,
        }
    }

    pub fn sender_addresses(&self) -> BTreeSet<&str> {
        self.vin
            .iter()
            .filter_map(|input| input.prevout.as_ref())
            .filter_map(|prevout| prevout.scriptpubkey_address.as_deref())
            .collect()
    }
}

/// `GET /extended/v1/address/{address}/stx`
#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StxBalanceResponse {
    #[serde_as(as = "DisplayFromStr")]
    pub balance: u128,
    #[serde_as(as = "DisplayFromStr")]
    pub locked: u128,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FungibleBalance {
    #[serde_as(as = "DisplayFromStr")]
    pub balance: u128,
}

/// `GET /extended/v1/address/{address}/balances`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BalancesResponse {
    #[serde(default)]
    pub fungible_tokens: BTreeMap<String, FungibleBalance>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReadOnlyRequest {
    pub sender: String,
    pub arguments: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReadOnlyResponse {
    pub okay: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub cause: Option<String>,
}

/// `GET /v1/addresses/stacks/{address}`
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NamesResponse {
    #[serde(default)]
    pub names: Vec<String>,
}
