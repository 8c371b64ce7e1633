//! Submission - 新しいワーカージョブの起動
//!
//! A `Submitter` is chosen per configured host from its `method`; all of them
//! implement `JobLauncher`. The functions here do the job-database
//! bookkeeping around a launch: a job record is only written after the
//! resource manager accepted the job, so a failed launch leaves no trace.

pub mod local;
pub mod osmium;
pub mod ssh;
pub mod xenon;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::app::context::{Context, JOB_ID_ENV};
use crate::config::{Config, HostConfig};
use crate::domain::ids::JobId;
use crate::domain::job::Job;
use crate::error::{PilotError, Result, SubmitErrorKind};
use crate::ports::{JobLauncher, ViewOptions};

pub use self::local::LocalSubmitter;
pub use self::osmium::OsmiumSubmitter;
pub use self::ssh::SshSubmitter;
pub use self::xenon::XenonSubmitter;

/// Launchers keyed by configured host name.
pub type Launchers = BTreeMap<String, Arc<dyn JobLauncher>>;

pub enum Submitter {
    Ssh(SshSubmitter),
    Local(LocalSubmitter),
    Osmium(OsmiumSubmitter),
    Xenon(XenonSubmitter),
}

impl Submitter {
    pub fn from_config(name: &str, host: &HostConfig) -> Result<Self> {
        Ok(match host {
            HostConfig::Ssh { host, path, script } => {
                Submitter::Ssh(SshSubmitter::new(name, host, path.clone(), script))
            }
            HostConfig::Local { path, script } => {
                Submitter::Local(LocalSubmitter::new(name, path.clone(), script))
            }
            HostConfig::Osmium { url, script, token } => {
                Submitter::Osmium(OsmiumSubmitter::new(name, url, script, token.clone())?)
            }
            HostConfig::Xenon {
                adaptor,
                location,
                script,
                path,
            } => Submitter::Xenon(XenonSubmitter::new(name, adaptor, location, script, path.clone())),
        })
    }

    fn launcher(&self) -> &dyn JobLauncher {
        match self {
            Submitter::Ssh(s) => s,
            Submitter::Local(s) => s,
            Submitter::Osmium(s) => s,
            Submitter::Xenon(s) => s,
        }
    }
}

#[async_trait]
impl JobLauncher for Submitter {
    fn method(&self) -> &str {
        self.launcher().method()
    }

    fn host(&self) -> &str {
        self.launcher().host()
    }

    async fn launch(&self, job_id: &JobId) -> Result<String> {
        self.launcher().launch(job_id).await
    }

    async fn queued_batch_ids(&self) -> Result<Option<HashSet<String>>> {
        self.launcher().queued_batch_ids().await
    }
}

/// One launcher per configured host.
pub fn launchers(config: &Config) -> Result<Launchers> {
    let mut launchers = Launchers::new();
    for (name, host) in &config.hosts {
        let submitter: Arc<dyn JobLauncher> = Arc::new(Submitter::from_config(name, host)?);
        launchers.insert(name.clone(), submitter);
    }
    Ok(launchers)
}

/// The part of a batch id resource managers agree on (`123.server.domain` -> `123`).
pub fn batch_key(batch_id: &str) -> &str {
    batch_id.split('.').next().unwrap_or(batch_id).trim()
}

/// Launch one job on `launcher` and record it as queued.
pub async fn submit(ctx: &Context, launcher: &dyn JobLauncher) -> Result<Job> {
    let job_id = ctx.ids.generate_job_id();
    let batch_id = launcher.launch(&job_id).await?;
    tracing::info!(job_id = %job_id, batch_id = %batch_id, host = launcher.host(), "job launched");

    let mut job = Job::new(job_id);
    job.batch_id = Some(batch_id);
    ctx.jobs().queue(job, launcher.method(), launcher.host()).await
}

/// Queued and running jobs that were not cancelled.
pub async fn active_jobs(ctx: &Context) -> Result<usize> {
    let result = ctx
        .job_db
        .view("active_jobs", ViewOptions::default().limit(0))
        .await?;
    Ok(result.total_rows)
}

pub async fn pending_tasks(ctx: &Context) -> Result<usize> {
    let result = ctx
        .task_db
        .view("pending", ViewOptions::default().limit(0))
        .await?;
    Ok(result.total_rows)
}

/// Submit a job unless enough are active or there is nothing to do.
pub async fn submit_if_needed(
    ctx: &Context,
    launcher: &dyn JobLauncher,
    max_jobs: usize,
) -> Result<Option<Job>> {
    let active = active_jobs(ctx).await?;
    if active >= max_jobs {
        tracing::debug!(active, max_jobs, "enough jobs active");
        return Ok(None);
    }
    if pending_tasks(ctx).await? == 0 {
        tracing::debug!("no pending tasks");
        return Ok(None);
    }
    submit(ctx, launcher).await.map(Some)
}

/// Keep submitting until enough jobs are active, but never more jobs than
/// there are pending tasks.
pub async fn submit_while_needed(
    ctx: &Context,
    launcher: &dyn JobLauncher,
    max_jobs: usize,
) -> Result<Vec<Job>> {
    let pending = pending_tasks(ctx).await?;
    let mut launched = Vec::new();
    while launched.len() < pending {
        match submit_if_needed(ctx, launcher, max_jobs).await? {
            Some(job) => launched.push(job),
            None => break,
        }
    }
    Ok(launched)
}

/// How many jobs `submit_while_needed` would launch.
pub async fn jobs_needed(ctx: &Context, max_jobs: usize) -> Result<usize> {
    let active = active_jobs(ctx).await?;
    let pending = pending_tasks(ctx).await?;
    Ok(max_jobs.saturating_sub(active).min(pending))
}

/// Output of a finished launcher command.
pub(crate) struct CommandOutput {
    pub stdout: String,
}

/// Run a launcher command, mapping failures onto `SubmitErrorKind`.
pub(crate) async fn run_command(host: &str, program: &str, args: &[String]) -> Result<CommandOutput> {
    run_command_in(host, program, args, None).await
}

pub(crate) async fn run_command_in(
    host: &str,
    program: &str,
    args: &[String],
    cwd: Option<&str>,
) -> Result<CommandOutput> {
    tracing::debug!(host, program, ?args, ?cwd, "running launcher command");
    let mut command = tokio::process::Command::new(program);
    command.args(args).kill_on_drop(true);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    let output = command
        .output()
        .await
        .map_err(|e| PilotError::Submission {
            host: host.to_string(),
            kind: SubmitErrorKind::Unreachable,
            message: format!("cannot run {program}: {e}"),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if output.status.success() {
        return Ok(CommandOutput { stdout });
    }
    Err(PilotError::Submission {
        host: host.to_string(),
        kind: classify_failure(program, output.status.code(), &stderr),
        message: format!("{program} exited with {}: {}", output.status, stderr.trim()),
    })
}

pub(crate) fn classify_failure(program: &str, code: Option<i32>, stderr: &str) -> SubmitErrorKind {
    let lower = stderr.to_lowercase();
    if lower.contains("permission denied") || lower.contains("authentication") {
        SubmitErrorKind::Authentication
    } else if program == "ssh" && code == Some(255) {
        // ssh reserves 255 for its own connection failures
        SubmitErrorKind::Unreachable
    } else {
        SubmitErrorKind::Rejected
    }
}

/// `PILOT_JOBID=<id>`
pub(crate) fn job_env(job_id: &JobId) -> String {
    format!("{JOB_ID_ENV}={job_id}")
}

/// Non-empty lines, keyed with `batch_key`.
pub(crate) fn parse_batch_ids(output: &str) -> HashSet<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| batch_key(line).to_string())
        .collect()
}

/// Single-quote `s` for a remote shell.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
