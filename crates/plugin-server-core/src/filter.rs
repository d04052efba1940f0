//! Property filter: the mergeable summary persisted per `(team_id, prop_type)`.
//!
//! A filter records which property names have been observed for a team and
//! which JSON value kinds each one has carried. Filters form an idempotent
//! commutative monoid under [`PropertyFilter::merge`]:
//!
//! - identity: the empty filter
//! - key-wise union, with value kinds OR-ed together
//! - once a union holds more than [`MAX_FILTER_ENTRIES`] keys the filter
//!   collapses to the absorbing *saturated* state
//!
//! Because the saturation check only depends on the size of the full union,
//! merging observations in any order or grouping, any number of times,
//! yields the same state. This is what lets independent workers update the
//! same row without coordination beyond compare-and-swap.
//!
//! # Binary Format
//!
//! ```text
//! [u8 version = 1][u8 flags (bit 0 = saturated)][u32 LE entry count]
//! per entry, in key order:
//!   [u8 value kinds][u8 has_group]
//!   [u32 LE len][group type bytes]   (only if has_group = 1)
//!   [u32 LE len][property name bytes]
//! ```
//!
//! Entries are written in sorted order so equal filters encode to equal bytes.

use crate::error::FilterCodecError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::BitOr;

/// Filters holding more distinct keys than this are saturated.
///
/// Teams above this are outliers (hash-like property names); recording more
/// names for them only bloats the row.
pub const MAX_FILTER_ENTRIES: usize = 10_000;

const FORMAT_VERSION: u8 = 1;
const FLAG_SATURATED: u8 = 0b0000_0001;

/// Set of JSON value kinds observed for a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ValueKinds(u8);

impl ValueKinds {
    pub const NONE: Self = Self(0);
    pub const STRING: Self = Self(1);
    pub const NUMERIC: Self = Self(1 << 1);
    pub const BOOLEAN: Self = Self(1 << 2);
    pub const NULL: Self = Self(1 << 3);
    pub const OBJECT: Self = Self(1 << 4);
    pub const ARRAY: Self = Self(1 << 5);

    const ALL_BITS: u8 = 0b0011_1111;

    /// Kind of a single JSON value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => Self::STRING,
            Value::Number(_) => Self::NUMERIC,
            Value::Bool(_) => Self::BOOLEAN,
            Value::Null => Self::NULL,
            Value::Object(_) => Self::OBJECT,
            Value::Array(_) => Self::ARRAY,
        }
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Build from raw bits, ignoring unknown ones.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL_BITS)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ValueKinds {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Key of a filter entry. Group properties are namespaced by group type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FilterKey {
    pub group_type: Option<String>,
    pub name: String,
}

impl FilterKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            group_type: None,
            name: name.into(),
        }
    }

    pub fn grouped(group_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group_type: Some(group_type.into()),
            name: name.into(),
        }
    }
}

/// Mergeable summary of observed property names and value kinds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PropertyFilter {
    entries: BTreeMap<FilterKey, ValueKinds>,
    saturated: bool,
}

impl PropertyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The absorbing element of [`merge`](Self::merge).
    pub fn saturated() -> Self {
        Self {
            entries: BTreeMap::new(),
            saturated: true,
        }
    }

    /// Record one observation in place.
    pub fn observe(&mut self, key: FilterKey, kinds: ValueKinds) {
        if self.saturated {
            return;
        }
        let slot = self.entries.entry(key).or_default();
        *slot = *slot | kinds;
        self.enforce_cap();
    }

    /// Merge `other` into `self` in place.
    pub fn merge_from(&mut self, other: &PropertyFilter) {
        if self.saturated {
            return;
        }
        if other.saturated {
            *self = Self::saturated();
            return;
        }
        for (key, kinds) in &other.entries {
            let slot = self.entries.entry(key.clone()).or_default();
            *slot = *slot | *kinds;
        }
        self.enforce_cap();
    }

    /// Merge two filters into a new one.
    pub fn merge(&self, other: &PropertyFilter) -> PropertyFilter {
        let mut merged = self.clone();
        merged.merge_from(other);
        merged
    }

    fn enforce_cap(&mut self) {
        if self.entries.len() > MAX_FILTER_ENTRIES {
            *self = Self::saturated();
        }
    }

    pub fn is_saturated(&self) -> bool {
        self.saturated
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && !self.saturated
    }

    pub fn contains(&self, key: &FilterKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Value kinds observed for `key`, if it was observed at all.
    pub fn kinds(&self, key: &FilterKey) -> Option<ValueKinds> {
        self.entries.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FilterKey, ValueKinds)> {
        self.entries.iter().map(|(k, v)| (k, *v))
    }

    /// Encode to the persisted binary format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(6 + self.entries.len() * 16);
        buf.push(FORMAT_VERSION);
        buf.push(if self.saturated { FLAG_SATURATED } else { 0 });
        buf.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());

        for (key, kinds) in &self.entries {
            buf.push(kinds.bits());
            match &key.group_type {
                Some(group_type) => {
                    buf.push(1);
                    write_str(&mut buf, group_type);
                }
                None => buf.push(0),
            }
            write_str(&mut buf, &key.name);
        }

        buf
    }

    /// Decode from the persisted binary format.
    pub fn decode(bytes: &[u8]) -> Result<Self, FilterCodecError> {
        let mut reader = Reader { bytes, pos: 0 };

        let version = reader.u8()?;
        if version != FORMAT_VERSION {
            return Err(FilterCodecError::UnsupportedVersion(version));
        }
        let flags = reader.u8()?;
        let count = reader.u32()? as usize;

        let mut filter = Self::new();
        for _ in 0..count {
            let kinds = ValueKinds::from_bits(reader.u8()?);
            let group_type = match reader.u8()? {
                0 => None,
                _ => Some(reader.string()?),
            };
            let name = reader.string()?;
            filter.entries.insert(FilterKey { group_type, name }, kinds);
        }

        if reader.pos != bytes.len() {
            return Err(FilterCodecError::TrailingBytes(bytes.len() - reader.pos));
        }

        if flags & FLAG_SATURATED != 0 {
            return Ok(Self::saturated());
        }
        filter.enforce_cap();
        Ok(filter)
    }
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], FilterCodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(FilterCodecError::Truncated(self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, FilterCodecError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, FilterCodecError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn string(&mut self) -> Result<String, FilterCodecError> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| FilterCodecError::InvalidUtf8)
    }
}
