//! Stacks addresses (c32check) and contract identifiers

use std::{fmt, str::FromStr};

use bitcoin::hashes::{Hash as _, sha256d};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

use crate::types::Network;

const C32_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseError {
    #[error("address must start with 'S': `{0}`")]
    MissingPrefix(String),
    #[error("invalid c32 character `{0}`")]
    InvalidChar(char),
    #[error("address version {0} is out of range")]
    InvalidVersion(u8),
    #[error("address payload must be 24 bytes, got {0}")]
    InvalidLength(usize),
    #[error("checksum mismatch")]
    BadChecksum,
    #[error("contract identifier must be `ADDRESS.name`: `{0}`")]
    InvalidContractId(String),
    #[error("contract name `{0}` must be 1-128 characters")]
    InvalidContractName(String),
}

fn c32_value(c: char) -> Result<u8, ParseError> {
    let normalized = match c.to_ascii_uppercase() {
        'O' => '0',
        'I' | 'L' => '1',
        other => other,
    };
    C32_ALPHABET
        .iter()
        .position(|&b| b as char == normalized)
        .map(|idx| idx as u8)
        .ok_or(ParseError::InvalidChar(c))
}

fn c32_encode(input: &[u8]) -> String {
    let mut out = Vec::with_capacity(input.len() * 8 / 5 + 1);
    let mut carry: u8 = 0;
    let mut carry_bits: u8 = 0;
    for &byte in input.iter().rev() {
        let low_bits_to_take = 5 - carry_bits;
        let low_bits = byte & ((1 << low_bits_to_take) - 1);
        out.push(C32_ALPHABET[((low_bits << carry_bits) + carry) as usize]);
        carry_bits = (8 + carry_bits) - 5;
        carry = byte >> (8 - carry_bits);
        if carry_bits >= 5 {
            out.push(C32_ALPHABET[(carry & 0x1f) as usize]);
            carry_bits -= 5;
            carry >>= 5;
        }
    }
    if carry_bits > 0 {
        out.push(C32_ALPHABET[carry as usize]);
    }
    while out.last() == Some(&C32_ALPHABET[0]) {
        out.pop();
    }
    for _ in input.iter().take_while(|&&b| b == 0) {
        out.push(C32_ALPHABET[0]);
    }
    out.iter().rev().map(|&b| b as char).collect()
}

fn c32_decode(input: &str) -> Result<Vec<u8>, ParseError> {
    let values = input.chars().map(c32_value).collect::<Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(values.len() * 5 / 8 + 1);
    let mut carry: u16 = 0;
    let mut carry_bits: u16 = 0;
    for &value in values.iter().rev() {
        carry += (value as u16) << carry_bits;
        carry_bits += 5;
        if carry_bits >= 8 {
            out.push((carry & 0xff) as u8);
            carry_bits -= 8;
            carry >>= 8;
        }
    }
    if carry_bits > 0 {
        out.push(carry as u8);
    }
    while out.last() == Some(&0) {
        out.pop();
    }
    for _ in values.iter().take_while(|&&v| v == 0) {
        out.push(0);
    }
    out.reverse();
    Ok(out)
}

fn checksum(version: u8, hash160: &[u8; 20]) -> [u8; 4] {
    let mut payload = Vec::with_capacity(21);
    payload.push(version);
    payload.extend_from_slice(hash160);
    let digest = sha256d::Hash::hash(&payload).to_byte_array();
    [digest[0], digest[1], digest[2], digest[3]]
}

/// A standard Stacks principal.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    DeserializeFromStr,
    SerializeDisplay,
)]
pub struct StacksAddress {
    version: u8,
    hash160: [u8; 20],
}

impl StacksAddress {
    pub const MAINNET_SINGLESIG: u8 = 22;
    pub const MAINNET_MULTISIG: u8 = 20;
    pub const TESTNET_SINGLESIG: u8 = 26;
    pub const TESTNET_MULTISIG: u8 = 21;

    pub fn new(version: u8, hash160: [u8; 20]) -> Result<Self, ParseError> {
        if version >= 32 {
            return Err(ParseError::InvalidVersion(version));
        }
        Ok(Self { version, hash160 })
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn hash160(&self) -> &[u8; 20] {
        &self.hash160
    }

    pub fn network(&self) -> Network {
        match self.version {
            Self::MAINNET_SINGLESIG | Self::MAINNET_MULTISIG => {
                Network::Mainnet
            }
            _ => Network::Testnet,
        }
    }
}

impl fmt::Display for StacksAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut payload = Vec::with_capacity(24);
        payload.extend_from_slice(&self.hash160);
        payload.extend_from_slice(&checksum(self.version, &self.hash160));
        write!(
            f,
            "S{}{}",
            C32_ALPHABET[self.version as usize] as char,
            c32_encode(&payload)
        )
    }
}

impl FromStr for StacksAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        if !matches!(chars.next(), Some('S' | 's')) {
            return Err(ParseError::MissingPrefix(s.to_owned()));
        }
        let version = chars
            .next()
            .ok_or_else(|| ParseError::MissingPrefix(s.to_owned()))
            .and_then(c32_value)?;
        let payload = c32_decode(chars.as_str())?;
        if payload.len() != 24 {
            return Err(ParseError::InvalidLength(payload.len()));
        }
        let mut hash160 = [0u8; 20];
        hash160.copy_from_slice(&payload[..20]);
        if payload[20..] != checksum(version, &hash160) {
            return Err(ParseError::BadChecksum);
        }
        Self::new(version, hash160)
    }
}

/// `ADDRESS.contract-name`
#[derive(
    Clone,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    DeserializeFromStr,
    SerializeDisplay,
)]
pub struct ContractId {
    pub address: StacksAddress,
    pub name: String,
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.address, self.name)
    }
}

impl FromStr for ContractId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, name) = s
            .split_once('.')
            .ok_or_else(|| ParseError::InvalidContractId(s.to_owned()))?;
        if name.is_empty() || name.len() > 128 {
            return Err(ParseError::InvalidContractName(name.to_owned()));
        }
        Ok(Self {
            address: address.parse()?,
            name: name.to_owned(),
        })
    }
}
