//! Bencode values as the engine control channel uses them.
//!
//! The engine speaks dictionaries of byte strings, integers, lists, and
//! nested dictionaries. Replies decode into the [`Bencode`] tree and are
//! picked apart with the typed accessors; anything unexpected surfaces as
//! an error at the consumption point instead of leaking an untyped value
//! across module boundaries.

use std::collections::BTreeMap;

/// Maximum nesting depth accepted by the decoder.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bencode {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Bencode>),
    /// Keys are raw byte strings. `BTreeMap` keeps them sorted, which is
    /// exactly the order the encoding requires.
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),
    #[error("unexpected byte 0x{byte:02x} at offset {at}")]
    UnexpectedByte { byte: u8, at: usize },
    #[error("invalid integer literal at offset {0}")]
    InvalidInteger(usize),
    #[error("string length at offset {0} overflows the input")]
    LengthOverflow(usize),
    #[error("dictionary key at offset {0} is not a byte string")]
    NonStringKey(usize),
    #[error("structure nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
    #[error("{0} trailing bytes after the value")]
    TrailingBytes(usize),
}

impl Bencode {
    /// Byte-string value from UTF-8 text.
    pub fn str(s: impl Into<String>) -> Self {
        Bencode::Bytes(s.into().into_bytes())
    }

    /// Dictionary from `(key, value)` pairs.
    pub fn dict<'a>(entries: impl IntoIterator<Item = (&'a str, Bencode)>) -> Self {
        Bencode::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v))
                .collect(),
        )
    }

    /// List of byte strings from UTF-8 text items.
    pub fn str_list<'a>(items: impl IntoIterator<Item = &'a str>) -> Self {
        Bencode::List(items.into_iter().map(Bencode::str).collect())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Bencode::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Bencode::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Bencode::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Bencode]> {
        match self {
            Bencode::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Bencode>> {
        match self {
            Bencode::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Dictionary lookup by UTF-8 key. `None` for non-dictionaries.
    pub fn get(&self, key: &str) -> Option<&Bencode> {
        self.as_dict()?.get(key.as_bytes())
    }

    /// Serialize to the canonical wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Bencode::Int(n) => {
                out.push(b'i');
                out.extend_from_slice(n.to_string().as_bytes());
                out.push(b'e');
            }
            Bencode::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Bencode::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Bencode::Dict(map) => {
                out.push(b'd');
                for (key, value) in map {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Decode a complete value; trailing bytes are an error.
    pub fn decode(input: &[u8]) -> Result<Bencode, BencodeError> {
        let mut pos = 0;
        let value = parse_value(input, &mut pos, 0)?;
        if pos != input.len() {
            return Err(BencodeError::TrailingBytes(input.len() - pos));
        }
        Ok(value)
    }

    /// Lossy conversion for the read-only HTTP surface. Byte strings become
    /// UTF-8 strings (invalid sequences replaced), dictionary keys likewise.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Bencode::Int(n) => serde_json::Value::from(*n),
            Bencode::Bytes(b) => serde_json::Value::from(String::from_utf8_lossy(b).into_owned()),
            Bencode::List(items) => {
                serde_json::Value::Array(items.iter().map(Bencode::to_json).collect())
            }
            Bencode::Dict(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Bencode {
    fn from(s: &str) -> Self {
        Bencode::str(s)
    }
}

impl From<String> for Bencode {
    fn from(s: String) -> Self {
        Bencode::Bytes(s.into_bytes())
    }
}

impl From<i64> for Bencode {
    fn from(n: i64) -> Self {
        Bencode::Int(n)
    }
}

fn parse_value(input: &[u8], pos: &mut usize, depth: usize) -> Result<Bencode, BencodeError> {
    if depth > MAX_DEPTH {
        return Err(BencodeError::TooDeep);
    }
    match input.get(*pos) {
        None => Err(BencodeError::UnexpectedEof(*pos)),
        Some(b'i') => parse_int(input, pos),
        Some(b'0'..=b'9') => parse_bytes(input, pos),
        Some(b'l') => {
            *pos += 1;
            let mut items = Vec::new();
            loop {
                match input.get(*pos) {
                    None => return Err(BencodeError::UnexpectedEof(*pos)),
                    Some(b'e') => {
                        *pos += 1;
                        return Ok(Bencode::List(items));
                    }
                    Some(_) => items.push(parse_value(input, pos, depth + 1)?),
                }
            }
        }
        Some(b'd') => {
            *pos += 1;
            let mut map = BTreeMap::new();
            loop {
                match input.get(*pos) {
                    None => return Err(BencodeError::UnexpectedEof(*pos)),
                    Some(b'e') => {
                        *pos += 1;
                        return Ok(Bencode::Dict(map));
                    }
                    Some(b'0'..=b'9') => {
                        let key = match parse_bytes(input, pos)? {
                            Bencode::Bytes(b) => b,
                            _ => unreachable!("parse_bytes only returns Bytes"),
                        };
                        let value = parse_value(input, pos, depth + 1)?;
                        // The engine is not strict about key order; last
                        // occurrence wins on duplicates.
                        map.insert(key, value);
                    }
                    Some(_) => return Err(BencodeError::NonStringKey(*pos)),
                }
            }
        }
        Some(&byte) => Err(BencodeError::UnexpectedByte { byte, at: *pos }),
    }
}

fn parse_int(input: &[u8], pos: &mut usize) -> Result<Bencode, BencodeError> {
    let start = *pos;
    *pos += 1; // consume 'i'
    let digits_start = *pos;
    if input.get(*pos) == Some(&b'-') {
        *pos += 1;
    }
    while matches!(input.get(*pos), Some(b'0'..=b'9')) {
        *pos += 1;
    }
    let literal = &input[digits_start..*pos];
    match input.get(*pos) {
        None => return Err(BencodeError::UnexpectedEof(*pos)),
        Some(b'e') => *pos += 1,
        Some(_) => return Err(BencodeError::InvalidInteger(start)),
    }
    let text = std::str::from_utf8(literal).expect("digits are ASCII");
    // Reject "", "-", "-0", and redundant leading zeros.
    if text.is_empty()
        || text == "-"
        || text == "-0"
        || (text.len() > 1 && text.starts_with('0'))
        || (text.len() > 2 && text.starts_with("-0"))
    {
        return Err(BencodeError::InvalidInteger(start));
    }
    let n: i64 = text.parse().map_err(|_| BencodeError::InvalidInteger(start))?;
    Ok(Bencode::Int(n))
}

fn parse_bytes(input: &[u8], pos: &mut usize) -> Result<Bencode, BencodeError> {
    let start = *pos;
    let mut len: usize = 0;
    while let Some(&b @ b'0'..=b'9') = input.get(*pos) {
        len = len
            .checked_mul(10)
            .and_then(|l| l.checked_add((b - b'0') as usize))
            .ok_or(BencodeError::LengthOverflow(start))?;
        *pos += 1;
    }
    match input.get(*pos) {
        None => return Err(BencodeError::UnexpectedEof(*pos)),
        Some(b':') => *pos += 1,
        Some(&byte) => return Err(BencodeError::UnexpectedByte { byte, at: *pos }),
    }
    if len > input.len() - *pos {
        return Err(BencodeError::LengthOverflow(start));
    }
    let bytes = input[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(Bencode::Bytes(bytes))
}
