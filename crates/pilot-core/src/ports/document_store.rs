//! DocumentStore port - the revisioned store every process shares.
//!
//! The store is the single source of truth for tasks and jobs. The only
//! concurrency primitive it offers is a per-document compare-and-swap: a save
//! carrying a stale revision fails with `PilotError::Conflict`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PilotError, Result};

/// Opaque revision token assigned by the store on every successful save.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading generation counter (`3-abc` -> 3), if the store uses one.
    pub fn generation(&self) -> Option<u64> {
        self.0.split('-').next()?.parse().ok()
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A raw store document: id, revision and an open set of fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,

    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            body: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.body.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Integer field, `0` when absent (timestamps default to "not set").
    pub fn int(&self, key: &str) -> i64 {
        self.body.get(key).and_then(Value::as_i64).unwrap_or(0)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    pub fn doc_type(&self) -> Option<&str> {
        self.str("type")
    }

    /// Convert a typed entity into a store document.
    pub fn from_entity<T: Serialize>(entity: &T) -> Result<Self> {
        Ok(serde_json::from_value(serde_json::to_value(entity)?)?)
    }

    /// Convert this document into a typed entity.
    pub fn into_entity<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        let id = self.id.clone();
        let value = serde_json::to_value(self)?;
        serde_json::from_value(value).map_err(|e| PilotError::InvalidState {
            id,
            reason: format!("malformed document: {e}"),
        })
    }
}

/// Query options for a view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewOptions {
    pub limit: Option<usize>,
    pub skip: Option<usize>,
    pub include_docs: bool,
}

impl ViewOptions {
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn include_docs(mut self) -> Self {
        self.include_docs = true;
        self
    }
}

/// One row of a view: sorted by `key`, projecting `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    pub id: String,
    pub key: Value,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Document>,
}

impl ViewRow {
    /// Integer field of the row value, `0` when absent.
    pub fn value_int(&self, key: &str) -> i64 {
        self.value.get(key).and_then(Value::as_i64).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewResult {
    /// Rows matching the view before `limit`/`skip` were applied.
    pub total_rows: usize,
    pub rows: Vec<ViewRow>,
}

/// Revisioned key-document store.
///
/// Implementations must linearize saves per document: a save either observes
/// the latest revision or fails with `Conflict`. Saving a document without a
/// revision creates it, and conflicts if the id already exists.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Human-readable location, for logs.
    fn name(&self) -> &str;

    async fn get(&self, id: &str) -> Result<Document>;

    /// Persist `doc`; returns it carrying the new revision.
    async fn save(&self, doc: Document) -> Result<Document>;

    async fn delete(&self, doc: &Document) -> Result<()>;

    async fn view(&self, name: &str, options: ViewOptions) -> Result<ViewResult>;

    /// Raw bytes of an inline attachment.
    async fn get_attachment(&self, id: &str, name: &str) -> Result<Vec<u8>>;
}
