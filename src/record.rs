//! Captured record and checkpoint entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field holding the resolved absolute URL of the item. Dedup key.
pub const TARGET_URL_FIELD: &str = "url";

/// One captured item: an ordered mapping from field name to value.
///
/// The field set is open; it is whatever the seed row carried plus whatever
/// the extraction template declares. Every persisted record carries the
/// target URL under [`TARGET_URL_FIELD`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from pre-known fields (e.g. carried in from the seed list).
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Set a string field, replacing any previous value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.fields
            .insert(name.to_string(), Value::String(value.into()));
    }

    /// Get a field as a string slice, if present and a string.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// The target identifier: the resolved absolute URL of the item.
    pub fn target_url(&self) -> Option<&str> {
        self.get(TARGET_URL_FIELD).filter(|u| !u.is_empty())
    }
}

/// A record plus its capture ordinal; one JSON object per checkpoint line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub ordinal: u64,
    pub captured_at: DateTime<Utc>,
    pub record: Record,
}

impl CheckpointEntry {
    pub fn new(ordinal: u64, record: Record) -> Self {
        Self {
            ordinal,
            captured_at: Utc::now(),
            record,
        }
    }
}
