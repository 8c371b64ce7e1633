//! ExecuteWorker - タスクの `command` を外部プロセスとして実行
//!
//! Per task, three fresh directories `<id>_<lock>` are created under the
//! configured tmp/input/output dirs. The command gets `arguments` followed by
//! those three paths; `input.json` holds the task's `input`. Whatever ends up
//! in the output directory (including captured `stdout` and `stderr`) becomes
//! an attachment of the task.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::app::context::Context;
use crate::app::worker_loop::TaskProcessor;
use crate::config::ExecutionConfig;
use crate::domain::task::Task;
use crate::error::{PilotError, Result};

pub const INPUT_FILE: &str = "input.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDirs {
    pub tmp: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
}

pub struct ExecuteWorker {
    config: ExecutionConfig,
}

impl ExecuteWorker {
    pub fn new(config: ExecutionConfig) -> Self {
        Self { config }
    }

    async fn create_dirs(&self, task: &Task) -> Result<TaskDirs> {
        let name = format!("{}_{}", task.id, task.lock);
        let mut created = Vec::with_capacity(3);
        for parent in [&self.config.tmp_dir, &self.config.input_dir, &self.config.output_dir] {
            let parent = expand_home(parent);
            tokio::fs::create_dir_all(&parent).await?;
            let dir = parent.join(&name);
            tokio::fs::create_dir(&dir).await?;
            created.push(dir);
        }
        let [tmp, input, output]: [PathBuf; 3] = created
            .try_into()
            .map_err(|_| PilotError::TaskFailed("could not create task directories".into()))?;
        Ok(TaskDirs { tmp, input, output })
    }

    async fn run_command(&self, task: &Task, dirs: &TaskDirs) -> Result<std::process::ExitStatus> {
        let command = task
            .str_field("command")
            .ok_or_else(|| PilotError::TaskFailed(format!("task {} has no command", task.id)))?;
        let arguments = arguments(task)?;

        let stdout = std::fs::File::create(dirs.output.join("stdout"))?;
        let stderr = std::fs::File::create(dirs.output.join("stderr"))?;

        tracing::debug!(task_id = %task.id, command, ?arguments, "running command");
        let status = tokio::process::Command::new(expand_home(Path::new(command)))
            .args(&arguments)
            .arg(&dirs.tmp)
            .arg(&dirs.input)
            .arg(&dirs.output)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .status()
            .await?;
        Ok(status)
    }

    /// Attach every regular file in `dir`, in name order.
    async fn attach_outputs(&self, ctx: &Context, task: &mut Task, dir: &Path) -> Result<()> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        files.sort();

        for filename in files {
            let data = tokio::fs::read(dir.join(&filename)).await?;
            ctx.tasks()
                .upload_attachment(task, &filename, content_type(&filename), data)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskProcessor for ExecuteWorker {
    async fn process(&self, ctx: &Context, task: &mut Task) -> Result<()> {
        let dirs = self.create_dirs(task).await?;
        let input_file = dirs.input.join(INPUT_FILE);
        tokio::fs::write(&input_file, serde_json::to_vec_pretty(&task.input)?).await?;

        task.extra.insert(
            "execute_properties".into(),
            json!({
                "dirs": {
                    "tmp": dirs.tmp,
                    "input": dirs.input,
                    "output": dirs.output,
                },
                "input_file": input_file,
            }),
        );

        match self.run_command(task, &dirs).await {
            Ok(status) if status.success() => {}
            Ok(status) => {
                tracing::warn!(task_id = %task.id, %status, "command failed");
                task.error("Command failed", Some(status.to_string()), ctx.now());
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "command could not run");
                task.error("Command raised exception", Some(e.to_string()), ctx.now());
            }
        }

        task.output = Value::Object(Map::new());
        self.attach_outputs(ctx, task, &dirs.output).await?;
        task.done(ctx.now())
    }
}

fn arguments(task: &Task) -> Result<Vec<String>> {
    match task.extra.get("arguments") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect()),
        Some(other) => Err(PilotError::TaskFailed(format!(
            "arguments of {} must be a list, got {other}",
            task.id
        ))),
    }
}

/// `~/x` -> `$HOME/x`.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

fn content_type(filename: &str) -> &'static str {
    match Path::new(filename).extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        Some("txt" | "log" | "csv") => "text/plain",
        None if filename == "stdout" || filename == "stderr" => "text/plain",
        _ => "application/octet-stream",
    }
}
