//! `qsub` on this machine.

use std::collections::HashSet;

use async_trait::async_trait;

use super::{job_env, parse_batch_ids, run_command, run_command_in};
use crate::domain::ids::JobId;
use crate::error::Result;
use crate::ports::JobLauncher;

pub struct LocalSubmitter {
    name: String,
    path: Option<String>,
    script: String,
    qsub: String,
    qselect: String,
}

impl LocalSubmitter {
    pub fn new(name: &str, path: Option<String>, script: &str) -> Self {
        Self {
            name: name.to_string(),
            path,
            script: script.to_string(),
            qsub: "qsub".to_string(),
            qselect: "qselect".to_string(),
        }
    }

    /// Use other resource manager executables (wrappers, tests).
    pub fn with_programs(mut self, qsub: impl Into<String>, qselect: impl Into<String>) -> Self {
        self.qsub = qsub.into();
        self.qselect = qselect.into();
        self
    }

    fn submit_args(&self, job_id: &JobId) -> Vec<String> {
        vec!["-v".to_string(), job_env(job_id), self.script.clone()]
    }

    fn list_args() -> Vec<String> {
        match std::env::var("USER") {
            Ok(user) => vec!["-u".to_string(), user],
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl JobLauncher for LocalSubmitter {
    fn method(&self) -> &str {
        "local"
    }

    fn host(&self) -> &str {
        &self.name
    }

    async fn launch(&self, job_id: &JobId) -> Result<String> {
        let output = run_command_in(
            &self.name,
            &self.qsub,
            &self.submit_args(job_id),
            self.path.as_deref(),
        )
        .await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn queued_batch_ids(&self) -> Result<Option<HashSet<String>>> {
        let output = run_command(&self.name, &self.qselect, &Self::list_args()).await?;
        Ok(Some(parse_batch_ids(&output.stdout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PilotError, SubmitErrorKind};

    #[tokio::test]
    async fn launch_returns_trimmed_stdout() {
        // echo stands in for qsub and prints its arguments back
        let s = LocalSubmitter::new("here", None, "run.sh").with_programs("echo", "true");
        let batch_id = s.launch(&JobId::new("job-7")).await.unwrap();
        assert_eq!(batch_id, "-v PILOT_JOBID=job-7 run.sh");
    }

    #[tokio::test]
    async fn empty_queue_listing() {
        let s = LocalSubmitter::new("here", None, "run.sh").with_programs("echo", "true");
        let queued = s.queued_batch_ids().await.unwrap().unwrap();
        assert!(queued.is_empty());
    }

    #[tokio::test]
    async fn failing_qsub_is_rejected() {
        let s = LocalSubmitter::new("here", None, "run.sh").with_programs("false", "true");
        let err = s.launch(&JobId::new("job-7")).await.unwrap_err();
        assert!(matches!(err, PilotError::Submission { kind: SubmitErrorKind::Rejected, .. }));
    }
}
