//! Job entity
//!
//! A job is the record of one worker process. Its state is derived from five
//! timestamps; transitions mutate the in-process projection and are made
//! durable by `app::jobs::JobRepository`, which retries them on conflict.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::ids::JobId;
use crate::domain::state::{JobState, JobTimes};
use crate::error::{PilotError, Result};
use crate::ports::{Document, Revision};

pub const JOB_TYPE: &str = "job";

fn default_type() -> String {
    JOB_TYPE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "_id")]
    pub id: JobId,

    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,

    #[serde(rename = "type", default = "default_type")]
    pub doc_type: String,

    #[serde(default)]
    pub queue: i64,
    #[serde(default)]
    pub start: i64,
    #[serde(default)]
    pub done: i64,
    #[serde(default)]
    pub archive: i64,
    #[serde(default)]
    pub cancel: i64,

    /// Id assigned by the resource manager.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,

    /// Configured host the job was submitted to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Machine the worker actually started on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            rev: None,
            doc_type: default_type(),
            queue: 0,
            start: 0,
            done: 0,
            archive: 0,
            cancel: 0,
            batch_id: None,
            host: None,
            method: None,
            hostname: None,
            extra: Map::new(),
        }
    }

    pub fn from_document(doc: Document) -> Result<Self> {
        let job: Job = doc.into_entity()?;
        job.state()?;
        Ok(job)
    }

    pub fn to_document(&self) -> Result<Document> {
        Document::from_entity(self)
    }

    pub fn times(&self) -> JobTimes {
        JobTimes {
            queue: self.queue,
            start: self.start,
            done: self.done,
            archive: self.archive,
            cancel: self.cancel,
        }
    }

    pub fn state(&self) -> Result<JobState> {
        JobState::from_times(self.times()).map_err(|reason| PilotError::InvalidState {
            id: self.id.to_string(),
            reason,
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel > 0
    }

    /// Record a submission. Archives right away if the worker already
    /// finished (it can outrun the submitter's bookkeeping).
    pub fn mark_queued(&mut self, method: &str, host: &str, now: i64) -> Result<()> {
        self.ensure_not_archived("queue")?;
        self.queue = now;
        self.method = Some(method.to_string());
        self.host = Some(host.to_string());
        if self.done > 0 {
            self.archive = now.max(self.done);
        }
        Ok(())
    }

    pub fn mark_started(&mut self, now: i64, properties: &Map<String, Value>) -> Result<()> {
        self.ensure_not_archived("start")?;
        if self.done > 0 {
            return Err(self.invalid("start", "job already finished"));
        }
        self.start = now;
        for (key, value) in properties {
            match key.as_str() {
                "hostname" => self.hostname = value.as_str().map(str::to_string),
                "batch_id" => self.batch_id = value.as_str().map(str::to_string),
                _ => {
                    self.extra.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    /// Mark finished. Archives right away when the job was submitted through
    /// the queue, since its `queue` timestamp is then already known.
    pub fn mark_finished(&mut self, now: i64) -> Result<()> {
        self.ensure_not_archived("finish")?;
        if self.done == 0 {
            // keep done >= start when clocks disagree between machines
            self.done = now.max(self.start);
        }
        if self.queue > 0 {
            self.archive = self.done;
        }
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: i64) -> Result<()> {
        self.ensure_not_archived("cancel")?;
        if self.cancel == 0 {
            self.cancel = now;
        }
        Ok(())
    }

    pub fn mark_archived(&mut self, now: i64) -> Result<()> {
        self.ensure_not_archived("archive")?;
        if self.done == 0 {
            return Err(self.invalid("archive", "job has not finished"));
        }
        self.archive = now.max(self.done);
        Ok(())
    }

    fn ensure_not_archived(&self, transition: &'static str) -> Result<()> {
        if self.archive > 0 {
            return Err(self.invalid(transition, "job is archived"));
        }
        Ok(())
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

    fn job() -> Job {
        Job::new(JobId::new("j1"))
    }

    #[test]
    fn finish_without_queue_is_not_archived() {
        let mut j = job();
        j.mark_finished(100).unwrap();

        assert_eq!(j.done, 100);
        assert_eq!(j.archive, 0);
        assert_eq!(j.queue, 0);
        assert_eq!(j.state().unwrap(), JobState::Finished);
    }

    #[test]
    fn queue_after_finish_archives() {
        let mut j = job();
        j.mark_finished(100).unwrap();
        j.mark_queued("ssh", "lisa", 120).unwrap();

        assert_eq!(j.state().unwrap(), JobState::Archived);
        assert_eq!(j.method.as_deref(), Some("ssh"));
        assert_eq!(j.host.as_deref(), Some("lisa"));
    }

    #[test]
    fn finish_after_queue_archives() {
        let mut j = job();
        j.mark_queued("local", "localhost", 10).unwrap();
        j.mark_started(20, &Map::new()).unwrap();
        j.mark_finished(30).unwrap();

        assert_eq!(j.done, 30);
        assert_eq!(j.archive, 30);
        assert_eq!(j.state().unwrap(), JobState::Archived);
    }

    #[test]
    fn start_records_properties() {
        let mut j = job();
        let props = json!({"hostname": "node-17", "cores": 16});
        j.mark_started(20, props.as_object().unwrap()).unwrap();

        assert_eq!(j.hostname.as_deref(), Some("node-17"));
        assert_eq!(j.extra.get("cores"), Some(&json!(16)));
        assert_eq!(j.state().unwrap(), JobState::Running);
    }

    #[test]
    fn archive_requires_finish() {
        let mut j = job();
        let err = j.mark_archived(10).unwrap_err();
        assert!(matches!(err, PilotError::InvalidTransition { transition: "archive", .. }));
    }

    #[test]
    fn archived_job_rejects_further_transitions() {
        let mut j = job();
        j.mark_finished(10).unwrap();
        j.mark_archived(20).unwrap();

        assert!(j.mark_queued("ssh", "lisa", 30).is_err());
        assert!(j.mark_finished(30).is_err());
        assert!(j.mark_cancelled(30).is_err());
    }

    #[test]
    fn cancel_is_a_side_flag() {
        let mut j = job();
        j.mark_started(10, &Map::new()).unwrap();
        j.mark_cancelled(15).unwrap();
        j.mark_cancelled(25).unwrap();

        assert_eq!(j.cancel, 15);
        assert!(j.is_cancelled());
        assert_eq!(j.state().unwrap(), JobState::Running);
    }

    #[test]
    fn finish_never_precedes_start() {
        let mut j = job();
        j.mark_started(100, &Map::new()).unwrap();
        j.mark_finished(90).unwrap();
        assert_eq!(j.done, 100);
    }

    #[test]
    fn document_roundtrip_keeps_unknown_fields() {
        let doc = Document::new("j2")
            .with_field("type", json!("job"))
            .with_field("queue", json!(5))
            .with_field("batch_id", json!("123.pbs"))
            .with_field("note", json!("manual"));
        let j = Job::from_document(doc).unwrap();

        assert_eq!(j.state().unwrap(), JobState::Queued);
        assert_eq!(j.batch_id.as_deref(), Some("123.pbs"));

        let back = j.to_document().unwrap();
        assert_eq!(back.str("note"), Some("manual"));
        assert_eq!(back.int("start"), 0);
    }
}
