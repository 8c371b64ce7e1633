//! Task management: CRUD, bulk deletion, counts, attachments.
//!
//! Claiming is not done here but by the iterators, which own the claim
//! protocol; this module only moves whole tasks in and out of the store.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::app::context::Context;
use crate::domain::ids::TaskId;
use crate::domain::task::{InlineAttachment, Task};
use crate::error::{PilotError, Result};
use crate::impls::views::{JOB_OVERVIEW, TASK_OVERVIEW};
use crate::ports::{ViewOptions, ViewResult};

pub struct TaskRepository<'a> {
    ctx: &'a Context,
}

impl<'a> TaskRepository<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Create a task from producer fields; `_id` is generated unless given.
    pub async fn add(&self, mut fields: Map<String, Value>) -> Result<Task> {
        let id = match fields.remove("_id") {
            Some(Value::String(id)) => TaskId::new(id),
            Some(other) => {
                return Err(PilotError::InvalidState {
                    id: other.to_string(),
                    reason: "task id must be a string".into(),
                });
            }
            None => self.ctx.ids.generate_task_id(),
        };
        let task = Task::from_fields(id, fields)?;
        let saved = self.save(&task).await?;
        tracing::debug!(task_id = %saved.id, "task added");
        Ok(saved)
    }

    pub async fn get(&self, id: &TaskId) -> Result<Task> {
        Task::from_document(self.ctx.task_db.get(id.as_str()).await?)
    }

    /// Save `task`; the returned copy carries the new revision.
    pub async fn save(&self, task: &Task) -> Result<Task> {
        let saved = self.ctx.task_db.save(task.to_document()?).await?;
        Task::from_document(saved)
    }

    /// Delete a task, then its WebDAV files. The files are only touched once
    /// the document is gone; a file that cannot be removed is logged and left.
    pub async fn delete(&self, task: &Task) -> Result<()> {
        self.ctx.task_db.delete(&task.to_document()?).await?;
        if let Some(webdav) = &self.ctx.webdav {
            for url in task.uploads.values() {
                if let Err(e) = webdav.delete(url).await {
                    tracing::warn!(task_id = %task.id, url, error = %e, "orphaned attachment");
                }
            }
        }
        Ok(())
    }

    pub async fn list(&self, view: &str, options: ViewOptions) -> Result<ViewResult> {
        self.ctx.task_db.view(view, options).await
    }

    /// Delete every task in `view`. Returns `(deleted, total)`; tasks changed
    /// concurrently are left alone.
    pub async fn delete_from_view(&self, view: &str) -> Result<(usize, usize)> {
        let result = self.list(view, ViewOptions::default().include_docs()).await?;
        let total = result.rows.len();
        let mut deleted = 0;

        for row in result.rows {
            let Some(doc) = row.doc else { continue };
            let task = match Task::from_document(doc) {
                Ok(task) => task,
                Err(e) => {
                    tracing::warn!(task_id = %row.id, error = %e, "skipping undeletable task");
                    continue;
                }
            };
            match self.delete(&task).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    tracing::debug!(task_id = %task.id, "task changed during delete, skipped");
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(view, deleted, total, "deleted tasks");
        Ok((deleted, total))
    }

    /// Row count of every task and job view shown by `pilot summary`.
    pub async fn overview_total(&self) -> Result<BTreeMap<String, usize>> {
        let mut counts = BTreeMap::new();
        for view in TASK_OVERVIEW {
            let result = self.ctx.task_db.view(view, ViewOptions::default().limit(0)).await?;
            counts.insert(view.to_string(), result.total_rows);
        }
        for view in JOB_OVERVIEW {
            let result = self.ctx.job_db.view(view, ViewOptions::default().limit(0)).await?;
            counts.insert(view.to_string(), result.total_rows);
        }
        Ok(counts)
    }

    /// Attach a file to `task` (not yet saved). Goes to WebDAV when
    /// configured, inline otherwise; replaces an earlier file of that name.
    pub async fn upload_attachment(
        &self,
        task: &mut Task,
        filename: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<()> {
        match &self.ctx.webdav {
            Some(webdav) => {
                let url = webdav.put(&task.id, filename, content_type, data).await?;
                task.attachments.remove(filename);
                task.uploads.insert(filename.to_string(), url);
            }
            None => {
                task.uploads.remove(filename);
                task.attachments.insert(
                    filename.to_string(),
                    InlineAttachment::from_bytes(content_type, &data),
                );
            }
        }
        Ok(())
    }

    pub async fn download_attachment(&self, task: &Task, filename: &str) -> Result<Vec<u8>> {
        if let Some(url) = task.uploads.get(filename) {
            let webdav = self.ctx.webdav.as_ref().ok_or_else(|| {
                PilotError::Config(format!("{filename} of {} is on WebDAV, which is not configured", task.id))
            })?;
            return webdav.get(url).await;
        }
        let attachment = task
            .attachments
            .get(filename)
            .ok_or_else(|| PilotError::NotFound(format!("{}/{filename}", task.id)))?;
        match attachment.bytes() {
            Some(bytes) => bytes,
            None => self.ctx.task_db.get_attachment(task.id.as_str(), filename).await,
        }
    }

    /// Remove a file from `task` (not yet saved).
    pub async fn delete_attachment(&self, task: &mut Task, filename: &str) -> Result<()> {
        if let Some(url) = task.uploads.remove(filename) {
            if let Some(webdav) = &self.ctx.webdav {
                webdav.delete(&url).await?;
            }
            return Ok(());
        }
        task.attachments
            .remove(filename)
            .map(|_| ())
            .ok_or_else(|| PilotError::NotFound(format!("{}/{filename}", task.id)))
    }
}
