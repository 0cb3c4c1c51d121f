//! Clarity values and their consensus serialization.
//!
//! Read-only contract calls take hex-encoded serialized values as arguments
//! and return one as result. Everything past the wire boundary works with
//! typed schemas built from [`ClarityValue`] through the accessors here.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::types::address::{ParseError as AddressError, StacksAddress};

mod prefix {
    pub const INT: u8 = 0x00;
    pub const UINT: u8 = 0x01;
    pub const BUFFER: u8 = 0x02;
    pub const TRUE: u8 = 0x03;
    pub const FALSE: u8 = 0x04;
    pub const PRINCIPAL_STANDARD: u8 = 0x05;
    pub const PRINCIPAL_CONTRACT: u8 = 0x06;
    pub const RESPONSE_OK: u8 = 0x07;
    pub const RESPONSE_ERR: u8 = 0x08;
    pub const OPTIONAL_NONE: u8 = 0x09;
    pub const OPTIONAL_SOME: u8 = 0x0a;
    pub const LIST: u8 = 0x0b;
    pub const TUPLE: u8 = 0x0c;
    pub const STRING_ASCII: u8 = 0x0d;
    pub const STRING_UTF8: u8 = 0x0e;
}

/// Values nest at most this deep on decode.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid hex")]
    Hex(#[from] hex::FromHexError),
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEnd(usize),
    #[error("unknown type prefix {0:#04x}")]
    UnknownPrefix(u8),
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
    #[error("value nesting exceeds {MAX_DEPTH}")]
    TooDeep,
    #[error("invalid utf-8 in string value")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("invalid principal")]
    Principal(#[from] AddressError),
}

/// Returned by the typed accessors when a decoded value does not have the
/// expected shape.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("expected {expected}, found {found}")]
    UnexpectedType {
        expected: &'static str,
        found: &'static str,
    },
    #[error("missing tuple field `{0}`")]
    MissingField(String),
    #[error("contract returned an error response: {0:?}")]
    ErrResponse(Box<ClarityValue>),
    #[error("integer does not fit in u64: {0}")]
    Overflow(u128),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Principal {
    Standard(StacksAddress),
    Contract(StacksAddress, String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClarityValue {
    Int(i128),
    UInt(u128),
    Buffer(Vec<u8>),
    Bool(bool),
    Principal(Principal),
    ResponseOk(Box<ClarityValue>),
    ResponseErr(Box<ClarityValue>),
    OptionalNone,
    OptionalSome(Box<ClarityValue>),
    List(Vec<ClarityValue>),
    Tuple(BTreeMap<String, ClarityValue>),
    StringAscii(String),
    StringUtf8(String),
}

impl ClarityValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Buffer(_) => "buffer",
            Self::Bool(_) => "bool",
            Self::Principal(_) => "principal",
            Self::ResponseOk(_) => "ok response",
            Self::ResponseErr(_) => "err response",
            Self::OptionalNone => "none",
            Self::OptionalSome(_) => "some",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::StringAscii(_) => "string-ascii",
            Self::StringUtf8(_) => "string-utf8",
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serialize_into(&mut out);
        out
    }

    fn serialize_into(&self, out: &mut Vec<u8>) {
        fn push_len(out: &mut Vec<u8>, len: usize) {
            out.extend_from_slice(&(len as u32).to_be_bytes());
        }
        fn push_address(out: &mut Vec<u8>, address: &StacksAddress) {
            out.push(address.version());
            out.extend_from_slice(address.hash160());
        }
        match self {
            Self::Int(v) => {
                out.push(prefix::INT);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Self::UInt(v) => {
                out.push(prefix::UINT);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Self::Buffer(bytes) => {
                out.push(prefix::BUFFER);
                push_len(out, bytes.len());
                out.extend_from_slice(bytes);
            }
            Self::Bool(true) => out.push(prefix::TRUE),
            Self::Bool(false) => out.push(prefix::FALSE),
            Self::Principal(Principal::Standard(address)) => {
                out.push(prefix::PRINCIPAL_STANDARD);
                push_address(out, address);
            }
            Self::Principal(Principal::Contract(address, name)) => {
                out.push(prefix::PRINCIPAL_CONTRACT);
                push_address(out, address);
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
            }
            Self::ResponseOk(inner) => {
                out.push(prefix::RESPONSE_OK);
                inner.serialize_into(out);
            }
            Self::ResponseErr(inner) => {
                out.push(prefix::RESPONSE_ERR);
                inner.serialize_into(out);
            }
            Self::OptionalNone => out.push(prefix::OPTIONAL_NONE),
            Self::OptionalSome(inner) => {
                out.push(prefix::OPTIONAL_SOME);
                inner.serialize_into(out);
            }
            Self::List(items) => {
                out.push(prefix::LIST);
                push_len(out, items.len());
                for item in items {
                    item.serialize_into(out);
                }
            }
            // BTreeMap iteration keeps field names sorted, as consensus
            // serialization requires.
            Self::Tuple(fields) => {
                out.push(prefix::TUPLE);
                push_len(out, fields.len());
                for (name, value) in fields {
                    out.push(name.len() as u8);
                    out.extend_from_slice(name.as_bytes());
                    value.serialize_into(out);
                }
            }
            Self::StringAscii(s) => {
                out.push(prefix::STRING_ASCII);
                push_len(out, s.len());
                out.extend_from_slice(s.as_bytes());
            }
            Self::StringUtf8(s) => {
                out.push(prefix::STRING_UTF8);
                push_len(out, s.len());
                out.extend_from_slice(s.as_bytes());
            }
        }
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.serialize()))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader { bytes, pos: 0 };
        let value = reader.value(0)?;
        let remaining = bytes.len() - reader.pos;
        if remaining != 0 {
            return Err(DecodeError::TrailingBytes(remaining));
        }
        Ok(value)
    }

    pub fn from_hex(s: &str) -> Result<Self, DecodeError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        Self::deserialize(&hex::decode(s)?)
    }

    fn unexpected(&self, expected: &'static str) -> SchemaError {
        SchemaError::UnexpectedType {
            expected,
            found: self.type_name(),
        }
    }

    /// Strip an `ok` wrapper. An `err` response is an error; any other value
    /// is returned as is.
    pub fn into_ok(self) -> Result<Self, SchemaError> {
        match self {
            Self::ResponseOk(inner) => Ok(*inner),
            Self::ResponseErr(inner) => Err(SchemaError::ErrResponse(inner)),
            other => Ok(other),
        }
    }

    /// Strip `ok`/`some` wrappers. `none` maps to `None`.
    pub fn into_present(self) -> Result<Option<Self>, SchemaError> {
        match self.into_ok()? {
            Self::OptionalNone => Ok(None),
            Self::OptionalSome(inner) => Ok(Some(*inner)),
            other => Ok(Some(other)),
        }
    }

    pub fn into_tuple(
        self,
    ) -> Result<BTreeMap<String, ClarityValue>, SchemaError> {
        match self {
            Self::Tuple(fields) => Ok(fields),
            other => Err(other.unexpected("tuple")),
        }
    }

    pub fn into_list(self) -> Result<Vec<ClarityValue>, SchemaError> {
        match self {
            Self::List(items) => Ok(items),
            other => Err(other.unexpected("list")),
        }
    }

    pub fn as_u128(&self) -> Result<u128, SchemaError> {
        match self {
            Self::UInt(v) => Ok(*v),
            Self::Int(v) if *v >= 0 => Ok(*v as u128),
            other => Err(other.unexpected("uint")),
        }
    }

    pub fn as_u64(&self) -> Result<u64, SchemaError> {
        let v = self.as_u128()?;
        u64::try_from(v).map_err(|_| SchemaError::Overflow(v))
    }

    pub fn as_str(&self) -> Result<&str, SchemaError> {
        match self {
            Self::StringAscii(s) | Self::StringUtf8(s) => Ok(s),
            other => Err(other.unexpected("string")),
        }
    }

    /// Option identifiers may be declared as strings or as integers.
    pub fn to_label(&self) -> Result<String, SchemaError> {
        match self {
            Self::StringAscii(s) | Self::StringUtf8(s) => Ok(s.clone()),
            Self::UInt(v) => Ok(v.to_string()),
            Self::Int(v) => Ok(v.to_string()),
            Self::Buffer(bytes) => Ok(hex::encode(bytes)),
            other => Err(other.unexpected("string")),
        }
    }

    pub fn as_principal(&self) -> Result<&Principal, SchemaError> {
        match self {
            Self::Principal(principal) => Ok(principal),
            other => Err(other.unexpected("principal")),
        }
    }
}

impl From<StacksAddress> for ClarityValue {
    fn from(address: StacksAddress) -> Self {
        Self::Principal(Principal::Standard(address))
    }
}

impl From<u128> for ClarityValue {
    fn from(v: u128) -> Self {
        Self::UInt(v)
    }
}

/// Helpers for reading fields out of a decoded tuple.
pub trait TupleExt {
    fn required(&self, name: &str) -> Result<&ClarityValue, SchemaError>;

    fn take_required(
        &mut self,
        name: &str,
    ) -> Result<ClarityValue, SchemaError>;

    /// Missing fields and `none` read as `default`.
    fn u64_or(&self, name: &str, default: u64) -> Result<u64, SchemaError>;
}

impl TupleExt for BTreeMap<String, ClarityValue> {
    fn required(&self, name: &str) -> Result<&ClarityValue, SchemaError> {
        self.get(name)
            .ok_or_else(|| SchemaError::MissingField(name.to_owned()))
    }

    fn take_required(
        &mut self,
        name: &str,
    ) -> Result<ClarityValue, SchemaError> {
        self.remove(name)
            .ok_or_else(|| SchemaError::MissingField(name.to_owned()))
    }

    fn u64_or(&self, name: &str, default: u64) -> Result<u64, SchemaError> {
        match self.get(name) {
            None | Some(ClarityValue::OptionalNone) => Ok(default),
            Some(ClarityValue::OptionalSome(inner)) => inner.as_u64(),
            Some(value) => value.as_u64(),
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(DecodeError::UnexpectedEnd(self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn u128_bytes(&mut self) -> Result<[u8; 16], DecodeError> {
        let mut buf = [0u8; 16];
        buf.copy_from_slice(self.take(16)?);
        Ok(buf)
    }

    fn address(&mut self) -> Result<StacksAddress, DecodeError> {
        let version = self.u8()?;
        let mut hash160 = [0u8; 20];
        hash160.copy_from_slice(self.take(20)?);
        Ok(StacksAddress::new(version, hash160)?)
    }

    fn string(&mut self, len: usize) -> Result<String, DecodeError> {
        Ok(String::from_utf8(self.take(len)?.to_vec())?)
    }

    fn value(&mut self, depth: usize) -> Result<ClarityValue, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep);
        }
        let value = match self.u8()? {
            prefix::INT => ClarityValue::Int(i128::from_be_bytes(
                self.u128_bytes()?,
            )),
            prefix::UINT => ClarityValue::UInt(u128::from_be_bytes(
                self.u128_bytes()?,
            )),
            prefix::BUFFER => {
                let len = self.u32()? as usize;
                ClarityValue::Buffer(self.take(len)?.to_vec())
            }
            prefix::TRUE => ClarityValue::Bool(true),
            prefix::FALSE => ClarityValue::Bool(false),
            prefix::PRINCIPAL_STANDARD => {
                ClarityValue::Principal(Principal::Standard(self.address()?))
            }
            prefix::PRINCIPAL_CONTRACT => {
                let address = self.address()?;
                let len = self.u8()? as usize;
                let name = self.string(len)?;
                ClarityValue::Principal(Principal::Contract(address, name))
            }
            prefix::RESPONSE_OK => {
                ClarityValue::ResponseOk(Box::new(self.value(depth + 1)?))
            }
            prefix::RESPONSE_ERR => {
                ClarityValue::ResponseErr(Box::new(self.value(depth + 1)?))
            }
            prefix::OPTIONAL_NONE => ClarityValue::OptionalNone,
            prefix::OPTIONAL_SOME => {
                ClarityValue::OptionalSome(Box::new(self.value(depth + 1)?))
            }
            prefix::LIST => {
                let len = self.u32()? as usize;
                // Every item takes at least one byte.
                if len > self.bytes.len() - self.pos {
                    return Err(DecodeError::UnexpectedEnd(self.pos));
                }
                let items = (0..len)
                    .map(|_| self.value(depth + 1))
                    .collect::<Result<_, _>>()?;
                ClarityValue::List(items)
            }
            prefix::TUPLE => {
                let len = self.u32()? as usize;
                if len > self.bytes.len() - self.pos {
                    return Err(DecodeError::UnexpectedEnd(self.pos));
                }
                let mut fields = BTreeMap::new();
                for _ in 0..len {
                    let name_len = self.u8()? as usize;
                    let name = self.string(name_len)?;
                    let value = self.value(depth + 1)?;
                    fields.insert(name, value);
                }
                ClarityValue::Tuple(fields)
            }
            prefix::STRING_ASCII => {
                let len = self.u32()? as usize;
                ClarityValue::StringAscii(self.string(len)?)
            }
            prefix::STRING_UTF8 => {
                let len = self.u32()? as usize;
                ClarityValue::StringUtf8(self.string(len)?)
            }
            unknown => return Err(DecodeError::UnknownPrefix(unknown)),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot_address() -> StacksAddress {
        "SP000000000000000000002Q6VF78".parse().unwrap()
    }

    #[test]
    fn test_uint_known_encoding() {
        assert_eq!(
            ClarityValue::UInt(1).to_hex(),
            "0x0100000000000000000000000000000001"
        );
        assert_eq!(
            ClarityValue::from_hex("0x0100000000000000000000000000000001")
                .unwrap(),
            ClarityValue::UInt(1)
        );
    }

    #[test]
    fn test_standard_principal_encoding() {
        let encoded = ClarityValue::from(boot_address()).serialize();
        assert_eq!(encoded.len(), 22);
        assert_eq!(encoded[0], prefix::PRINCIPAL_STANDARD);
        assert_eq!(encoded[1], StacksAddress::MAINNET_SINGLESIG);
        assert!(encoded[2..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_nested_result_decodes() {
        let option = ClarityValue::Tuple(BTreeMap::from([
            ("id".to_owned(), ClarityValue::StringAscii("yes".to_owned())),
            ("votes".to_owned(), ClarityValue::UInt(42)),
        ]));
        let value = ClarityValue::ResponseOk(Box::new(ClarityValue::Tuple(
            BTreeMap::from([
                ("total".to_owned(), ClarityValue::UInt(3)),
                ("options".to_owned(), ClarityValue::List(vec![option])),
                (
                    "owner".to_owned(),
                    ClarityValue::Principal(Principal::Contract(
                        boot_address(),
                        "ballot".to_owned(),
                    )),
                ),
            ]),
        )));
        let decoded = ClarityValue::from_hex(&value.to_hex()).unwrap();
        assert_eq!(decoded, value);

        let fields = decoded.into_ok().unwrap().into_tuple().unwrap();
        assert_eq!(fields.u64_or("total", 0).unwrap(), 3);
        assert_eq!(fields.u64_or("absent", 7).unwrap(), 7);
        let options = fields.required("options").unwrap().clone();
        assert_eq!(options.into_list().unwrap().len(), 1);
    }

    #[test]
    fn test_tuple_fields_serialize_sorted() {
        let value = ClarityValue::Tuple(BTreeMap::from([
            ("b".to_owned(), ClarityValue::Bool(true)),
            ("a".to_owned(), ClarityValue::Bool(false)),
        ]));
        assert_eq!(
            value.serialize(),
            vec![
                prefix::TUPLE,
                0,
                0,
                0,
                2,
                1,
                b'a',
                prefix::FALSE,
                1,
                b'b',
                prefix::TRUE
            ]
        );
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        assert!(matches!(
            ClarityValue::deserialize(&[0x01, 0x00]),
            Err(DecodeError::UnexpectedEnd(_))
        ));
        assert!(matches!(
            ClarityValue::deserialize(&[0x42]),
            Err(DecodeError::UnknownPrefix(0x42))
        ));
        assert!(matches!(
            ClarityValue::deserialize(&[prefix::TRUE, prefix::TRUE]),
            Err(DecodeError::TrailingBytes(1))
        ));
        assert!(matches!(
            ClarityValue::deserialize(&[prefix::LIST, 0xff, 0xff, 0xff, 0xff]),
            Err(DecodeError::UnexpectedEnd(_))
        ));
        assert!(ClarityValue::from_hex("0xzz").is_err());
    }

    #[test]
    fn test_into_present() {
        assert!(ClarityValue::OptionalNone.into_present().unwrap().is_none());
        let some = ClarityValue::OptionalSome(Box::new(ClarityValue::UInt(5)));
        assert_eq!(
            some.into_present().unwrap(),
            Some(ClarityValue::UInt(5))
        );
        let err = ClarityValue::ResponseErr(Box::new(ClarityValue::UInt(1)));
        assert!(matches!(
            err.into_present(),
            Err(SchemaError::ErrResponse(_))
        ));
    }
}
