//! Task entity
//!
//! A task is a unit of work written by a producer and claimed by one worker
//! at a time. Every mutation here is speculative: it changes the in-process
//! projection only, and becomes real once a `DocumentStore::save` carrying
//! the same revision succeeds.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::ids::{JobId, TaskId};
use crate::domain::state::TaskState;
use crate::error::{PilotError, Result};
use crate::ports::{Document, Revision};

pub const TASK_TYPE: &str = "task";

/// One entry of the append-only error list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub time: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

/// Attachment stored inside the task document.
///
/// Freshly added attachments carry `data`; attachments read back from a store
/// are usually stubs and must be fetched with `DocumentStore::get_attachment`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineAttachment {
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stub: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl InlineAttachment {
    pub fn from_bytes(content_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            content_type: content_type.into(),
            data: Some(BASE64.encode(bytes)),
            stub: false,
            length: Some(bytes.len() as u64),
            digest: None,
        }
    }

    /// Decoded payload, if the attachment is not a stub.
    pub fn bytes(&self) -> Option<Result<Vec<u8>>> {
        self.data.as_ref().map(|data| {
            BASE64
                .decode(data)
                .map_err(|e| PilotError::Store(format!("invalid attachment encoding: {e}")))
        })
    }
}

fn default_type() -> String {
    TASK_TYPE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "_id")]
    pub id: TaskId,

    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,

    #[serde(rename = "type", default = "default_type")]
    pub doc_type: String,

    #[serde(default)]
    pub lock: i64,

    #[serde(default)]
    pub done: i64,

    #[serde(default)]
    pub input: Value,

    #[serde(default)]
    pub output: Value,

    #[serde(default)]
    pub errors: Vec<TaskError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,

    #[serde(rename = "_attachments", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attachments: BTreeMap<String, InlineAttachment>,

    /// Attachments held in the WebDAV store: filename -> URL.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub uploads: BTreeMap<String, String>,

    /// Producer-supplied fields (`command`, `arguments`, ...), kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            rev: None,
            doc_type: default_type(),
            lock: 0,
            done: 0,
            input: Value::Object(Map::new()),
            output: Value::Object(Map::new()),
            errors: Vec::new(),
            job: None,
            priority: None,
            attachments: BTreeMap::new(),
            uploads: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    /// Build a task from producer fields. Store-managed fields in `fields`
    /// (`lock`, `done`, `errors`, ...) are taken as given.
    pub fn from_fields(id: TaskId, mut fields: Map<String, Value>) -> Result<Self> {
        fields.remove("_id");
        fields.remove("_rev");
        let mut doc = Document::from_entity(&Task::new(id))?;
        doc.body.extend(fields);
        doc.into_entity()
    }

    pub fn from_document(doc: Document) -> Result<Self> {
        let task: Task = doc.into_entity()?;
        task.state()?;
        Ok(task)
    }

    pub fn to_document(&self) -> Result<Document> {
        Document::from_entity(self)
    }

    /// Validated state computed from `lock` / `done`.
    pub fn state(&self) -> Result<TaskState> {
        TaskState::from_timestamps(self.lock, self.done).map_err(|reason| {
            PilotError::InvalidState {
                id: self.id.to_string(),
                reason,
            }
        })
    }

    pub fn is_done(&self) -> bool {
        self.done > 0
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Claim for `job`. The error list is left as is.
    pub fn lock(&mut self, job: Option<&JobId>, now: i64) -> Result<()> {
        if !self.state()?.is_claimable() {
            return Err(self.invalid("lock", "task is not pending"));
        }
        self.lock = now;
        self.job = job.cloned();
        Ok(())
    }

    /// Release the claim; `done` and `errors` are untouched.
    pub fn unlock(&mut self) {
        self.lock = 0;
    }

    /// Record a failure. Never marks the task done.
    pub fn error(&mut self, message: impl Into<String>, exception: Option<String>, now: i64) {
        self.errors.push(TaskError {
            time: now,
            message: message.into(),
            exception,
        });
    }

    pub fn done(&mut self, now: i64) -> Result<()> {
        if self.is_done() {
            return Err(self.invalid("finish", "task is already done"));
        }
        // Unclaimed tasks may be finished directly; keep lock <= done.
        if self.lock == 0 || self.lock > now {
            self.lock = now;
        }
        self.done = now;
        Ok(())
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    /// Names of all attachments, inline and uploaded.
    pub fn files(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .attachments
            .keys()
            .chain(self.uploads.keys())
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    fn invalid(&self, transition: &'static str, reason: &str) -> PilotError {
        PilotError::InvalidTransition {
            id: self.id.to_string(),
            transition,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> Task {
        Task::new(TaskId::new("task-1"))
    }

    #[test]
    fn new_task_is_pending() {
        let t = task();
        assert_eq!(t.state().unwrap(), TaskState::Pending);
        assert!(!t.has_errors());
    }

    #[test]
    fn lock_sets_timestamp_and_job() {
        let mut t = task();
        let job = JobId::new("job-a");
        t.lock(Some(&job), 100).unwrap();

        assert_eq!(t.lock, 100);
        assert_eq!(t.job, Some(job));
        assert_eq!(t.state().unwrap(), TaskState::InProgress);
    }

    #[test]
    fn lock_rejects_claimed_task() {
        let mut t = task();
        t.lock(None, 100).unwrap();
        let err = t.lock(None, 200).unwrap_err();
        assert!(matches!(err, PilotError::InvalidTransition { .. }));
    }

    #[test]
    fn lock_keeps_previous_errors() {
        let mut t = task();
        t.error("first try", None, 50);
        t.lock(None, 100).unwrap();
        assert_eq!(t.errors.len(), 1);
    }

    #[test]
    fn done_and_errors_are_independent() {
        let mut t = task();
        t.lock(None, 100).unwrap();
        t.error("boom", Some("Traceback".into()), 110);

        assert!(t.has_errors());
        assert!(!t.is_done());
        assert_eq!(t.state().unwrap(), TaskState::InProgress);

        t.done(120).unwrap();
        assert!(t.is_done());
        assert!(t.has_errors());
    }

    #[test]
    fn done_is_terminal() {
        let mut t = task();
        t.done(100).unwrap();
        assert_eq!(t.lock, 100);
        assert!(t.done(200).is_err());
        assert!(t.lock(None, 300).is_err());
    }

    #[test]
    fn unlock_keeps_done_and_errors() {
        let mut t = task();
        t.lock(None, 100).unwrap();
        t.error("died", None, 150);
        t.unlock();

        assert_eq!(t.lock, 0);
        assert_eq!(t.errors.len(), 1);
        assert_eq!(t.state().unwrap(), TaskState::Pending);
    }

    #[test]
    fn producer_fields_survive_a_document_roundtrip() {
        let fields = json!({
            "command": "/bin/echo",
            "arguments": ["a", "b"],
            "input": {"x": 1},
            "priority": 3,
        });
        let t = Task::from_fields(TaskId::new("task-9"), fields.as_object().unwrap().clone())
            .unwrap();
        assert_eq!(t.str_field("command"), Some("/bin/echo"));
        assert_eq!(t.priority, Some(3));
        assert_eq!(t.input["x"], 1);

        let doc = t.to_document().unwrap();
        assert_eq!(doc.doc_type(), Some("task"));
        assert_eq!(doc.get("arguments"), Some(&json!(["a", "b"])));
        let back = Task::from_document(doc).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn corrupted_timestamps_are_rejected_on_load() {
        let doc = Document::new("task-x")
            .with_field("type", json!("task"))
            .with_field("lock", json!(500))
            .with_field("done", json!(100));
        let err = Task::from_document(doc).unwrap_err();
        assert!(matches!(err, PilotError::InvalidState { .. }));
    }

    #[test]
    fn inline_attachment_roundtrips_bytes() {
        let att = InlineAttachment::from_bytes("text/plain", b"hello");
        assert_eq!(att.length, Some(5));
        assert_eq!(att.bytes().unwrap().unwrap(), b"hello");

        let stub = InlineAttachment {
            data: None,
            stub: true,
            ..att
        };
        assert!(stub.bytes().is_none());
    }
}
