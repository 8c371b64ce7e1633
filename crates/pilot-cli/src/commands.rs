//! Subcommand handlers. Library errors pass through `anyhow` here.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, bail};
use chrono::{DateTime, Local};
use serde_json::{Map, Value, json};

use pilot_core::app::{
    Context, ExecuteWorker, JobActor, JobCancelled, RunBudget, Scrubber, StopCondition,
    task_iterator,
};
use pilot_core::config::Config;
use pilot_core::domain::task::TASK_TYPE;
use pilot_core::domain::{JobId, Task};
use pilot_core::impls::CouchStore;
use pilot_core::impls::views::{self, JOB_DESIGN, TASK_DESIGN};
use pilot_core::observability::Overview;
use pilot_core::ports::{Document, ViewOptions};
use pilot_core::submit;
use pilot_core::PilotError;

use crate::shutdown;

pub struct RunOptions {
    pub job_id: Option<String>,
    pub max_time: u64,
    pub margin: Option<f64>,
    pub local: bool,
    pub endless: bool,
    pub prioritize: bool,
}

fn seconds_to_str(timestamp: i64, unset: &str) -> String {
    if timestamp <= 0 {
        return unset.to_string();
    }
    DateTime::from_timestamp(timestamp, 0)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

pub async fn init(
    mut config: Config,
    user: Option<String>,
    password: Option<String>,
    views_only: bool,
) -> anyhow::Result<()> {
    if let Some(user) = user {
        for db in std::iter::once(&mut config.task_db).chain(config.job_db.as_mut()) {
            db.username = Some(user.clone());
            db.password = password.clone();
        }
    }

    let mut targets = vec![(config.task_db.clone(), vec![TASK_DESIGN])];
    match &config.job_db {
        Some(job_db) => targets.push((job_db.clone(), vec![JOB_DESIGN])),
        None => targets[0].1.push(JOB_DESIGN),
    }

    for (db, designs) in targets {
        if db.is_memory() {
            println!("{} is in memory, nothing to initialize", db.database);
            continue;
        }
        let store = CouchStore::new(&db)?;
        if !views_only {
            store
                .create_database()
                .await
                .with_context(|| format!("cannot create database {}", db.database))?;
        }
        for design in designs {
            store.install_views(design).await?;
        }
        println!("Initialized {}/{}", db.url.trim_end_matches('/'), db.database);
    }
    Ok(())
}

pub async fn create(
    config: Config,
    command: String,
    arguments: Vec<String>,
    number: usize,
    parallelism: String,
    input: Option<PathBuf>,
) -> anyhow::Result<()> {
    let ctx = Context::from_config(config)?;

    let mut fields = Map::new();
    fields.insert("command".into(), json!(command));
    fields.insert("arguments".into(), json!(arguments));
    let parallelism = match parallelism.parse::<u64>() {
        Ok(n) => json!(n),
        Err(_) => json!(parallelism),
    };
    fields.insert("parallelism".into(), parallelism);
    if let Some(path) = input {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read input {}", path.display()))?;
        let input: Value = serde_json::from_str(&content)
            .with_context(|| format!("{} is not valid JSON", path.display()))?;
        fields.insert("input".into(), input);
    }

    for i in 0..number {
        match ctx.tasks().add(fields.clone()).await {
            Ok(task) => println!("added task {}", task.id),
            Err(e) => eprintln!("ERROR: task {i} failed to be added: {e}"),
        }
    }
    Ok(())
}

/// A task from the task database, if `id` names one.
async fn find_task(ctx: &Context, id: &str) -> anyhow::Result<Option<Task>> {
    match ctx.task_db.get(id).await {
        Ok(doc) if doc.doc_type() == Some(TASK_TYPE) => Ok(Some(Task::from_document(doc)?)),
        Ok(_) | Err(PilotError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn get(config: Config, id: &str, download: Option<PathBuf>) -> anyhow::Result<()> {
    let ctx = Context::from_config(config)?;

    let doc = if let Some(task) = find_task(&ctx, id).await? {
        let mut value = serde_json::to_value(&task)?;
        value["lock_str"] = json!(seconds_to_str(task.lock, "not started"));
        value["done_str"] = json!(seconds_to_str(task.done, "not done"));

        if let Some(dir) = &download {
            std::fs::create_dir_all(dir)?;
            let files = task.files();
            println!("Downloading {} files to {}", files.len(), dir.display());
            for filename in files {
                let data = ctx.tasks().download_attachment(&task, filename).await?;
                std::fs::write(dir.join(filename), data)?;
            }
        }
        value
    } else {
        let job = match ctx.jobs().get(&JobId::new(id)).await {
            Ok(job) => job,
            Err(PilotError::NotFound(_)) => bail!("Document {id} not found"),
            Err(e) => return Err(e.into()),
        };
        let mut value = serde_json::to_value(&job)?;
        value["queue_str"] = json!(seconds_to_str(job.queue, "not queued"));
        value["start_str"] = json!(seconds_to_str(job.start, "not started"));
        value["done_str"] = json!(seconds_to_str(job.done, "not done"));
        value
    };

    match download {
        Some(dir) => std::fs::write(dir.join("_document.json"), serde_json::to_vec_pretty(&doc)?)?,
        None => println!("{}", serde_json::to_string_pretty(&doc)?),
    }
    Ok(())
}

fn is_job_view(view: &str) -> anyhow::Result<bool> {
    match views::lookup(view) {
        Some(def) => Ok(def.design == JOB_DESIGN),
        None => bail!("unknown view '{view}'"),
    }
}

pub async fn list(config: Config, view: &str, limit: usize, offset: usize) -> anyhow::Result<()> {
    let ctx = Context::from_config(config)?;
    let job_view = is_job_view(view)?;

    let mut options = ViewOptions::default();
    if limit > 0 {
        options = options.limit(limit);
    }
    if offset > 0 {
        options = options.skip(offset);
    }

    if job_view {
        let result = ctx.job_db.view(view, options).await?;
        println!("{:<45} {:<22} {:<22} {:<22}", "ID", "queued", "started", "stopped");
        println!("{}", "-".repeat(45 + 1 + 22 + 1 + 22 + 1 + 22));
        for row in result.rows {
            println!(
                "{:<45} {:<22} {:<22} {:<22}",
                truncate(&row.id, 45),
                seconds_to_str(row.value_int("queue"), "not queued"),
                seconds_to_str(row.value_int("start"), "not started"),
                seconds_to_str(row.value_int("done"), "not done"),
            );
        }
    } else if view == "error" {
        let result = ctx.task_db.view(view, options.include_docs()).await?;
        for row in result.rows {
            let Some(doc) = row.doc else { continue };
            let task = Task::from_document(doc)?;
            println!("{}:", task.id);
            for error in &task.errors {
                println!("  - time: {}", seconds_to_str(error.time, "unknown"));
                println!("    message: {}", error.message);
                if let Some(exception) = &error.exception {
                    println!("    exception:\n    ==========");
                    for line in exception.lines() {
                        println!("    {line}");
                    }
                    println!("    ==========");
                }
            }
        }
    } else {
        let result = ctx.task_db.view(view, options).await?;
        println!("{:<40} {:<22} {:<22}", "ID", "started", "stopped");
        println!("{}", "-".repeat(40 + 1 + 22 + 1 + 22));
        for row in result.rows {
            println!(
                "{:<40} {:<22} {:<22}",
                truncate(&row.id, 40),
                seconds_to_str(row.value_int("lock"), "not started"),
                seconds_to_str(row.value_int("done"), "not done"),
            );
        }
    }
    Ok(())
}

fn truncate(s: &str, width: usize) -> &str {
    match s.char_indices().nth(width) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

pub async fn delete(config: Config, id: Option<String>, view: Option<String>) -> anyhow::Result<()> {
    let ctx = Context::from_config(config)?;

    if let Some(id) = id {
        if let Some(task) = find_task(&ctx, &id).await? {
            ctx.tasks().delete(&task).await?;
        } else {
            let doc: Document = match ctx.job_db.get(&id).await {
                Ok(doc) => doc,
                Err(PilotError::NotFound(_)) => bail!("Cannot find document ID {id}"),
                Err(e) => return Err(e.into()),
            };
            ctx.job_db.delete(&doc).await?;
        }
        println!("Deleted {id}");
    }

    if let Some(view) = view {
        let (deleted, total) = if is_job_view(&view)? {
            ctx.jobs().delete_from_view(&view).await?
        } else {
            ctx.tasks().delete_from_view(&view).await?
        };
        println!("Deleted {deleted} out of {total} documents from view {view}");
    }
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/proc/sys/kernel/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn run(config: Config, options: RunOptions) -> anyhow::Result<()> {
    let ctx = Context::from_config(config)?;
    let job_id = match (options.job_id, options.local) {
        (Some(id), _) => JobId::new(id),
        (None, true) => JobId::new(format!("local-{}", ctx.ids.generate_job_id().unprefixed())),
        (None, false) => bail!("no job id: pass one, set PILOT_JOBID or use --local"),
    };
    let ctx = ctx.with_job_id(job_id.clone());

    let stop: Arc<dyn StopCondition> = Arc::new(JobCancelled::new(ctx.clone(), job_id.clone()));
    let iterator = task_iterator(&ctx, options.prioritize, options.endless, stop);
    let max_time = (options.max_time > 0).then(|| Duration::from_secs(options.max_time));
    let margin = options.margin.unwrap_or(ctx.config.worker.margin);
    let worker = Arc::new(ExecuteWorker::new(ctx.config.execution.clone()));

    let mut properties = Map::new();
    properties.insert("hostname".into(), json!(hostname()));
    let actor = JobActor::new(ctx.clone(), iterator, worker)
        .with_budget(RunBudget::new(max_time, margin))
        .with_properties(properties);

    println!("Connected to the database. Now starting work as {job_id}...");
    tokio::select! {
        result = actor.run() => {
            let report = result?;
            println!(
                "No more tasks to process, done ({} processed, {} failed).",
                report.processed, report.failed
            );
            Ok(())
        }
        signal = shutdown::wait_for_signal() => {
            let signal = signal?;
            eprintln!("Caught {signal}; finishing job.");
            if let Err(e) = ctx.jobs().finish(&job_id).await {
                eprintln!("Failed during clean-up: {e}");
            }
            std::process::exit(1);
        }
    }
}

pub async fn cancel(config: Config, job_id: &str) -> anyhow::Result<()> {
    let ctx = Context::from_config(config)?;
    ctx.jobs().cancel(&JobId::new(job_id)).await?;
    println!("Job {job_id} will stop after its current task");
    Ok(())
}

pub async fn scrub(config: Config, view: &str, age: u64) -> anyhow::Result<()> {
    let ctx = Context::from_config(config)?;
    let launchers = submit::launchers(&ctx.config)?;
    let report = Scrubber::new(&ctx, &launchers)
        .scrub(view, Duration::from_secs(age))
        .await?;
    if report.scrubbed > 0 {
        println!(
            "Scrubbed {} out of {} documents from '{view}'",
            report.scrubbed, report.considered
        );
    } else {
        println!("No scrubbing required");
    }
    Ok(())
}

async fn print_summary(ctx: &Context) -> anyhow::Result<()> {
    let overview = Overview::collect(ctx).await?;
    println!("Summary");
    println!("{}", "=".repeat(28));
    print!("{overview}");
    println!("{}", "=".repeat(28));
    Ok(())
}

pub async fn check(config: Config, host: Option<&str>, dry_run: bool, max: usize) -> anyhow::Result<()> {
    let ctx = Context::from_config(config)?;
    let launchers = submit::launchers(&ctx.config)?;
    if dry_run {
        println!("Dry run: will not modify any state");
    }
    print!("BEFORE: ");
    print_summary(&ctx).await?;

    let report = Scrubber::new(&ctx, &launchers)
        .dry_run(dry_run)
        .check(host, max)
        .await?;

    for job_id in &report.stopped_jobs {
        println!("Archiving stopped job {job_id}");
    }
    for task_id in &report.failed_tasks {
        println!("Marked task {task_id} of a stopped job as error");
    }
    match host {
        None => println!("No host provided, not starting additional jobs"),
        Some(_) if dry_run && report.would_submit > 0 => {
            println!("Would start {} jobs", report.would_submit)
        }
        Some(_) if report.submitted.is_empty() && report.would_submit == 0 => {
            println!("Enough jobs running. Will not start any new jobs")
        }
        Some(_) => {
            for job in &report.submitted {
                println!(
                    "Job {} (ID: {}) started",
                    job.batch_id.as_deref().unwrap_or("?"),
                    job.id
                );
            }
        }
    }

    print!("AFTER: ");
    print_summary(&ctx).await
}

pub async fn submit(config: Config, host: &str, max: usize, force: bool) -> anyhow::Result<()> {
    let ctx = Context::from_config(config)?;
    let launchers = submit::launchers(&ctx.config)?;
    let launcher = launchers
        .get(host)
        .with_context(|| format!("host '{host}' is not configured"))?;

    let job = if force {
        Some(submit::submit(&ctx, launcher.as_ref()).await?)
    } else {
        submit::submit_if_needed(&ctx, launcher.as_ref(), max).await?
    };
    match job {
        Some(job) => println!(
            "Job {} (ID: {}) started",
            job.batch_id.as_deref().unwrap_or("?"),
            job.id
        ),
        None => println!(
            "No tasks to process or already {max} jobs running (increase maximum number of jobs with -m)"
        ),
    }
    Ok(())
}
