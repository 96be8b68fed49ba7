//! Canonical change records
//!
//! Everything downstream of the normalizer works on these types: a
//! [`ChangeRecord`] is one row mutation, a [`Batch`] is every record produced
//! by one physical binlog event, and [`BinlogPosition`] is the resume marker
//! all records of a batch share.

use crate::error::{Result, SyncError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single column value after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Integer view of the value. Text holding a decimal integer also counts,
    /// since DECIMAL columns are normalized to text.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            Scalar::UInt(v) => i64::try_from(*v).ok(),
            Scalar::Bool(b) => Some(i64::from(*b)),
            Scalar::Text(s) => s.parse().ok(),
            Scalar::Null | Scalar::Float(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Scalar::UInt(v) => Some(*v),
            other => other.as_i64().and_then(|v| u64::try_from(v).ok()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    /// MySQL booleans are `TINYINT(1)`, so any non-zero integer is true.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            Scalar::Int(v) => Some(*v != 0),
            Scalar::UInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Scalar::Null => serde_json::Value::Null,
            Scalar::Bool(b) => serde_json::Value::Bool(*b),
            Scalar::Int(v) => serde_json::Value::from(*v),
            Scalar::UInt(v) => serde_json::Value::from(*v),
            Scalar::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Scalar::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Text(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

/// Ordered field → value mapping of one row image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(IndexMap<String, Scalar>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, handy for fixtures.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Scalar) {
        self.0.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<&Scalar> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Scalar)> {
        self.0.iter()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Required integer field (primary and foreign keys).
    pub fn require_i64(&self, field: &str) -> Result<i64> {
        self.get(field)
            .and_then(Scalar::as_i64)
            .ok_or_else(|| SyncError::shape(format!("row has no integer field '{}'", field)))
    }

    /// Optional integer field; `None` for both absent and NULL.
    pub fn opt_i64(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Scalar::as_i64)
    }

    pub fn opt_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Scalar::as_str)
    }
}

impl FromIterator<(String, Scalar)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Scalar)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Row mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Insert => write!(f, "insert"),
            Action::Update => write!(f, "update"),
            Action::Delete => write!(f, "delete"),
        }
    }
}

/// Binlog coordinates. Ordered by file name, then offset, which matches
/// MySQL's zero-padded `binlog.000042` naming.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BinlogPosition {
    pub file: String,
    pub offset: u64,
}

impl BinlogPosition {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Self {
            file: file.into(),
            offset,
        }
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

/// One row mutation from an allow-listed table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub table: String,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Row>,
    pub position: BinlogPosition,
}

impl ChangeRecord {
    pub fn insert(table: impl Into<String>, after: Row, position: BinlogPosition) -> Self {
        Self {
            table: table.into(),
            action: Action::Insert,
            before: None,
            after: Some(after),
            position,
        }
    }

    pub fn update(
        table: impl Into<String>,
        before: Row,
        after: Row,
        position: BinlogPosition,
    ) -> Self {
        Self {
            table: table.into(),
            action: Action::Update,
            before: Some(before),
            after: Some(after),
            position,
        }
    }

    pub fn delete(table: impl Into<String>, before: Row, position: BinlogPosition) -> Self {
        Self {
            table: table.into(),
            action: Action::Delete,
            before: Some(before),
            after: None,
            position,
        }
    }

    /// Inserts carry only `after`, deletes only `before`, updates both.
    pub fn validate_shape(&self) -> Result<()> {
        let ok = match self.action {
            Action::Insert => self.before.is_none() && self.after.is_some(),
            Action::Update => self.before.is_some() && self.after.is_some(),
            Action::Delete => self.before.is_some() && self.after.is_none(),
        };
        if ok {
            Ok(())
        } else {
            Err(SyncError::shape(format!(
                "{} on '{}' with before={} after={}",
                self.action,
                self.table,
                self.before.is_some(),
                self.after.is_some()
            )))
        }
    }

    /// The image that identifies the row: `after` when present, else `before`.
    pub fn current(&self) -> Option<&Row> {
        self.after.as_ref().or(self.before.as_ref())
    }

    pub fn require_before(&self) -> Result<&Row> {
        self.before
            .as_ref()
            .ok_or_else(|| SyncError::shape(format!("{} on '{}' without before image", self.action, self.table)))
    }

    pub fn require_after(&self) -> Result<&Row> {
        self.after
            .as_ref()
            .ok_or_else(|| SyncError::shape(format!("{} on '{}' without after image", self.action, self.table)))
    }
}

/// All records decoded from one physical rows event.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub records: Vec<ChangeRecord>,
    /// End of the physical event; the only valid checkpoint for this batch.
    pub position: BinlogPosition,
}

impl Batch {
    pub fn new(records: Vec<ChangeRecord>, position: BinlogPosition) -> Self {
        Self { records, position }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
