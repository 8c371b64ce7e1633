//! Domain identifiers (strongly-typed IDs).
//!
//! Document ids are plain strings in the store: task producers, submission
//! backends and operators may all pick them. Generated ids are
//! `<prefix><ULID>`, so a view keyed by id returns documents in creation order.
//!
//! `Id<T>` carries a phantom marker so a `JobId` can never be passed where a
//! `TaskId` is expected, while serializing as the bare string.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait providing the prefix used for generated ids.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct Id<T: IdMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Wrap an externally assigned id.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    /// Build a prefixed id from a ULID.
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self::new(format!("{}{}", T::prefix(), ulid))
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// The id without its generated prefix (if it has one).
    pub fn unprefixed(&self) -> &str {
        self.value
            .strip_prefix(T::prefix())
            .unwrap_or(&self.value)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<T: IdMarker> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> From<String> for Id<T> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> AsRef<str> for Id<T> {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

// ========================================
// Markers
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskDoc {}

impl IdMarker for TaskDoc {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobDoc {}

impl IdMarker for JobDoc {
    fn prefix() -> &'static str {
        "job-"
    }
}

/// Identifier of a Task document.
pub type TaskId = Id<TaskDoc>;

/// Identifier of a Job document (one worker process).
pub type JobId = Id<JobDoc>;
