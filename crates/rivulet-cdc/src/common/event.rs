//! Change event representation
//!
//! A [`ChangeEvent`] is one row-level change observed since the last cursor.
//! Column values keep the order in which the source reported them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::common::{CdcError, Cursor, Result};

/// Schema used when a table name carries no schema qualifier.
pub const DEFAULT_SCHEMA: &str = "dbo";

/// Identity of a monitored table.
///
/// Its display form (`schema.table`) is the checkpoint key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    pub schema: String,
    pub name: String,
}

impl TableId {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `schema.table` or a bare `table` (schema defaults to `dbo`)
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (schema, name) = match s.split_once('.') {
            Some((schema, name)) => (schema.trim(), name.trim()),
            None => (DEFAULT_SCHEMA, s),
        };

        if schema.is_empty() || name.is_empty() || name.contains('.') {
            return Err(CdcError::config(format!("Invalid table name '{}'", s)));
        }

        Ok(Self::new(schema, name))
    }

    /// Fully qualified name (`schema.table`)
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

impl FromStr for TableId {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Row-level operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
    /// Operation code the source reported but this crate does not recognize
    Unknown(i32),
}

impl ChangeOp {
    /// Short label used in logs and publisher payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
            ChangeOp::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOp::Unknown(code) => write!(f, "unknown({})", code),
            other => f.write_str(other.as_str()),
        }
    }
}

/// One row-level change captured from a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Source table
    pub table: TableId,
    /// Operation kind
    pub op: ChangeOp,
    /// Column name to value, in source column order
    pub columns: Map<String, Value>,
    /// Row image before an update, when the source reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Map<String, Value>>,
    /// Source-assigned sequence position
    pub position: Cursor,
    /// When this process read the change
    pub captured_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(table: TableId, op: ChangeOp, columns: Map<String, Value>, position: Cursor) -> Self {
        Self {
            table,
            op,
            columns,
            before: None,
            position,
            captured_at: Utc::now(),
        }
    }

    /// Attach the pre-update row image.
    pub fn with_before(mut self, before: Map<String, Value>) -> Self {
        self.before = Some(before);
        self
    }

    /// Column value by name
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// Serialize the event body for publishers
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Serialize the event body for publishers, indented
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Result of one fetch against a change source.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    /// Changes strictly after the requested cursor, in source order
    pub events: Vec<ChangeEvent>,
    /// Position of the last event, or the requested cursor when empty
    pub cursor: Cursor,
}

impl ChangeBatch {
    /// Batch with no changes; the cursor stays where it was
    pub fn empty(since: Cursor) -> Self {
        Self {
            events: Vec::new(),
            cursor: since,
        }
    }

    /// Build a batch from ordered events, deriving the cursor from the last one
    pub fn from_events(events: Vec<ChangeEvent>, since: Cursor) -> Self {
        let cursor = events
            .last()
            .map(|e| e.position.clone())
            .unwrap_or(since);
        Self { events, cursor }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}
