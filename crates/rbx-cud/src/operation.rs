//! Wire model of cud operations and packages.
//!
//! Field names follow the compact encoding used on the wire:
//!
//! ```text
//! package   { ci: <cud id>, t: <timestamp>, o: [operation] }
//! operation { t: 0|1|2, s: [selector], v?, c?, d?, i?: <query>, p?: 0|1 }
//! ```

use crate::error::{CudError, Result};
use crate::query::DbQuery;
use rbx_core::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of a single mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CudType {
    Insert = 0,
    Update = 1,
    Delete = 2,
}

impl TryFrom<u8> for CudType {
    type Error = CudError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(CudType::Insert),
            1 => Ok(CudType::Update),
            2 => Ok(CudType::Delete),
            other => Err(CudError::UnknownType(other)),
        }
    }
}

impl From<CudType> for u8 {
    fn from(cud_type: CudType) -> u8 {
        cud_type as u8
    }
}

/// Monotonically increasing id of a cud package within one databox.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CudId(pub u64);

impl CudId {
    /// The id directly after this one.
    pub fn next(self) -> CudId {
        CudId(self.0 + 1)
    }
}

impl fmt::Display for CudId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One step of a selector: a concrete key or a query over the entries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectorItem {
    Key(String),
    Query(DbQuery),
}

impl From<&str> for SelectorItem {
    fn from(key: &str) -> Self {
        SelectorItem::Key(key.to_owned())
    }
}

impl From<String> for SelectorItem {
    fn from(key: String) -> Self {
        SelectorItem::Key(key)
    }
}

impl From<DbQuery> for SelectorItem {
    fn from(query: DbQuery) -> Self {
        SelectorItem::Query(query)
    }
}

/// A single insert, update or delete.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CudOperation {
    #[serde(rename = "t")]
    pub cud_type: CudType,
    #[serde(rename = "s", default)]
    pub selector: Vec<SelectorItem>,
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<Value>,
    /// Guard: some entry of the target component must match.
    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
    pub if_contains: Option<DbQuery>,
    /// Widen an insert to an update (or an update to an insert) when the
    /// target key already exists (or is missing).
    #[serde(rename = "p", default, skip_serializing_if = "is_false", with = "flag")]
    pub potential: bool,
    /// Overrides the package timestamp for this operation.
    #[serde(rename = "ts", default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// `0 | 1` on the wire, also accepting plain booleans.
mod flag {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Bool(b) => b,
            Value::Number(n) => n.as_u64().map_or(false, |n| n != 0),
            _ => false,
        })
    }
}

impl CudOperation {
    fn new(cud_type: CudType, selector: Vec<SelectorItem>, value: Option<Value>) -> Self {
        Self {
            cud_type,
            selector,
            value,
            code: None,
            extra_data: None,
            if_contains: None,
            potential: false,
            timestamp: None,
        }
    }

    pub fn insert<S: Into<SelectorItem>>(selector: impl IntoIterator<Item = S>, value: Value) -> Self {
        Self::new(
            CudType::Insert,
            selector.into_iter().map(Into::into).collect(),
            Some(value),
        )
    }

    pub fn update<S: Into<SelectorItem>>(selector: impl IntoIterator<Item = S>, value: Value) -> Self {
        Self::new(
            CudType::Update,
            selector.into_iter().map(Into::into).collect(),
            Some(value),
        )
    }

    pub fn delete<S: Into<SelectorItem>>(selector: impl IntoIterator<Item = S>) -> Self {
        Self::new(
            CudType::Delete,
            selector.into_iter().map(Into::into).collect(),
            None,
        )
    }

    pub fn with_if_contains(mut self, query: DbQuery) -> Self {
        self.if_contains = Some(query);
        self
    }

    pub fn potential(mut self) -> Self {
        self.potential = true;
        self
    }

    pub fn with_code(mut self, code: Value) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_extra_data(mut self, data: Value) -> Self {
        self.extra_data = Some(data);
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Check the structural rules serde cannot express.
    pub fn validate(&self) -> Result<()> {
        match self.cud_type {
            CudType::Insert | CudType::Update if self.value.is_none() => {
                Err(CudError::MissingValue(self.cud_type))
            }
            _ => Ok(()),
        }
    }
}

/// An ordered batch of operations with a package id and timestamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CudPackage {
    #[serde(rename = "ci")]
    pub id: CudId,
    #[serde(rename = "t")]
    pub timestamp: Timestamp,
    #[serde(rename = "o", default)]
    pub operations: Vec<CudOperation>,
}

impl CudPackage {
    pub fn new(id: CudId, timestamp: Timestamp, operations: Vec<CudOperation>) -> Self {
        Self {
            id,
            timestamp,
            operations,
        }
    }

    /// Decode and validate a package received from the wire.
    pub fn from_value(raw: Value) -> Result<Self> {
        let package: CudPackage = serde_json::from_value(raw)?;
        package.validate()?;
        Ok(package)
    }

    pub fn validate(&self) -> Result<()> {
        self.operations.iter().try_for_each(CudOperation::validate)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}
