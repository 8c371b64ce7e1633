//! `qsub` on a remote login node over ssh.

use std::collections::HashSet;

use async_trait::async_trait;

use super::{job_env, parse_batch_ids, run_command, shell_quote};
use crate::domain::ids::JobId;
use crate::error::Result;
use crate::ports::JobLauncher;

pub struct SshSubmitter {
    name: String,
    target: String,
    path: Option<String>,
    script: String,
}

impl SshSubmitter {
    pub fn new(name: &str, target: &str, path: Option<String>, script: &str) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            path,
            script: script.to_string(),
        }
    }

    fn remote(&self, command: String) -> Vec<String> {
        let command = match &self.path {
            Some(path) => format!("cd {} && {command}", shell_quote(path)),
            None => command,
        };
        vec![self.target.clone(), command]
    }

    fn submit_args(&self, job_id: &JobId) -> Vec<String> {
        self.remote(format!(
            "qsub -v {} {}",
            shell_quote(&job_env(job_id)),
            shell_quote(&self.script)
        ))
    }

    fn list_args(&self) -> Vec<String> {
        // $USER is expanded by the remote shell
        vec![self.target.clone(), "qselect -u \"$USER\"".to_string()]
    }
}

#[async_trait]
impl JobLauncher for SshSubmitter {
    fn method(&self) -> &str {
        "ssh"
    }

    fn host(&self) -> &str {
        &self.name
    }

    async fn launch(&self, job_id: &JobId) -> Result<String> {
        let output = run_command(&self.name, "ssh", &self.submit_args(job_id)).await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn queued_batch_ids(&self) -> Result<Option<HashSet<String>>> {
        let output = run_command(&self.name, "ssh", &self.list_args()).await?;
        Ok(Some(parse_batch_ids(&output.stdout)))
    }
}
