//! Submission through the `xenon` command line client.
//!
//! Xenon hides the scheduler behind an adaptor (`slurm`, `torque`, ...), so
//! one configuration shape covers clusters ssh/qsub cannot reach.

use std::collections::HashSet;

use async_trait::async_trait;

use super::{job_env, parse_batch_ids, run_command};
use crate::domain::ids::JobId;
use crate::error::Result;
use crate::ports::JobLauncher;

pub struct XenonSubmitter {
    name: String,
    adaptor: String,
    location: String,
    script: String,
    path: Option<String>,
}

impl XenonSubmitter {
    pub fn new(name: &str, adaptor: &str, location: &str, script: &str, path: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            adaptor: adaptor.to_string(),
            location: location.to_string(),
            script: script.to_string(),
            path,
        }
    }

    fn scheduler_args(&self, subcommand: &str) -> Vec<String> {
        vec![
            "scheduler".to_string(),
            self.adaptor.clone(),
            "--location".to_string(),
            self.location.clone(),
            subcommand.to_string(),
        ]
    }

    fn submit_args(&self, job_id: &JobId) -> Vec<String> {
        let mut args = self.scheduler_args("submit");
        args.extend(["--env".to_string(), job_env(job_id)]);
        if let Some(path) = &self.path {
            args.extend(["--working-directory".to_string(), path.clone()]);
        }
        args.push(self.script.clone());
        args
    }
}

#[async_trait]
impl JobLauncher for XenonSubmitter {
    fn method(&self) -> &str {
        "xenon"
    }

    fn host(&self) -> &str {
        &self.name
    }

    async fn launch(&self, job_id: &JobId) -> Result<String> {
        let output = run_command(&self.name, "xenon", &self.submit_args(job_id)).await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn queued_batch_ids(&self) -> Result<Option<HashSet<String>>> {
        let output = run_command(&self.name, "xenon", &self.scheduler_args("list")).await?;
        Ok(Some(parse_batch_ids(&output.stdout)))
    }
}
