use std::path::{Path, PathBuf};

use clap::{Args as ClapArgs, Parser};
use tracing_subscriber::EnvFilter;

use pilot_core::config::{Config, DEFAULT_PATH};

mod commands;
mod shutdown;

#[derive(Parser, Debug)]
#[command(name = "pilot")]
#[command(version)]
#[command(about = "Manage tasks and the pilot jobs that process them")]
#[command(propagate_version = true)]
struct Args {
    /// Configuration file
    #[arg(long, short = 'c', env = "PILOT_CONFIG", default_value = DEFAULT_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Create the databases and install their views
    Init {
        /// Database admin user
        #[arg(long, short = 'u')]
        user: Option<String>,

        /// Database admin password
        #[arg(long, short = 'p', env = "PILOT_DB_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Only (re)install the views
        #[arg(long, short = 'v')]
        views_only: bool,
    },

    /// Create tasks running a single command
    Create {
        /// Command to run
        command: String,

        /// Arguments passed before the tmp/input/output directories
        arguments: Vec<String>,

        /// Number of tasks to create
        #[arg(long, short = 'n', default_value_t = 1)]
        number: usize,

        /// Threads the task needs ('*' for all)
        #[arg(long, short = 'p', default_value = "1")]
        parallelism: String,

        /// JSON file used as the task input
        #[arg(long, short = 'i')]
        input: Option<PathBuf>,
    },

    /// Print a task or job
    Get {
        /// Document id
        id: String,

        /// Download the task and its attachments to this directory
        #[arg(long, short = 'd')]
        download: Option<PathBuf>,
    },

    /// List the documents of a view
    List {
        /// View name
        view: String,

        /// Maximum number of rows (0 for all)
        #[arg(long, short = 'l', default_value_t = 0)]
        limit: usize,

        /// Rows to skip
        #[arg(long, short = 'o', default_value_t = 0)]
        offset: usize,
    },

    /// Delete one document or every document of a view
    Delete {
        /// Document id
        #[arg(required_unless_present = "view", conflicts_with = "view")]
        id: Option<String>,

        /// View to delete documents from
        #[arg(long, short = 'v')]
        view: Option<String>,
    },

    /// Process tasks as a pilot job
    Run(RunArgs),

    /// Ask a running job to stop after its current task
    Cancel {
        /// Job id
        job_id: String,
    },

    /// Make tasks or jobs held by crashed workers available again
    Scrub {
        /// View to scrub
        #[arg(default_value = "in_progress")]
        view: String,

        #[command(flatten)]
        age: TimeArgs,
    },

    /// Reconcile jobs with their queues and start jobs if needed
    Check {
        /// Host to submit additional jobs to
        host: Option<String>,

        /// Only report, modify nothing
        #[arg(long, short = 'n')]
        dry_run: bool,

        /// Maximum number of active jobs
        #[arg(long, short = 'm', default_value_t = 2)]
        max: usize,
    },

    /// Start a job on a configured host
    Submit {
        /// Host to run the pilot job on
        host: String,

        /// Only submit while fewer jobs are active
        #[arg(long, short = 'm', default_value_t = 2)]
        max: usize,

        /// Submit regardless of active jobs and pending tasks
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Task and job counts per view
    Summary,
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    /// Job id to run as
    #[arg(env = "PILOT_JOBID")]
    job_id: Option<String>,

    #[command(flatten)]
    time: RunTimeArgs,

    /// Margin factor on the average task time when deciding to stop
    #[arg(long, short = 'm')]
    margin: Option<f64>,

    /// Run without a job id from the resource manager
    #[arg(long, short = 'l')]
    local: bool,

    /// Keep waiting for new tasks until cancelled
    #[arg(long, short = 'e')]
    endless: bool,

    /// Take tasks with a priority first
    #[arg(long, short = 'P')]
    prioritize: bool,
}

/// Maximum run time; one day unless given.
#[derive(ClapArgs, Debug)]
struct RunTimeArgs {
    #[arg(long, short = 'D', default_value_t = 1)]
    days: u64,
    #[arg(long, short = 'H', default_value_t = 0)]
    hours: u64,
    #[arg(long, short = 'M', default_value_t = 0)]
    minutes: u64,
    #[arg(long, short = 'S', default_value_t = 0)]
    seconds: u64,
}

/// Minimum age of what gets scrubbed.
#[derive(ClapArgs, Debug)]
struct TimeArgs {
    #[arg(long, short = 'D', default_value_t = 0)]
    days: u64,
    #[arg(long, short = 'H', default_value_t = 0)]
    hours: u64,
    #[arg(long, short = 'M', default_value_t = 0)]
    minutes: u64,
    #[arg(long, short = 'S', default_value_t = 0)]
    seconds: u64,
}

/// Saturates instead of overflowing on absurd inputs.
fn to_seconds(days: u64, hours: u64, minutes: u64, seconds: u64) -> u64 {
    let hours = hours.saturating_add(days.saturating_mul(24));
    let minutes = minutes.saturating_add(hours.saturating_mul(60));
    seconds.saturating_add(minutes.saturating_mul(60))
}

impl RunTimeArgs {
    fn seconds(&self) -> u64 {
        to_seconds(self.days, self.hours, self.minutes, self.seconds)
    }
}

impl TimeArgs {
    fn seconds(&self) -> u64 {
        to_seconds(self.days, self.hours, self.minutes, self.seconds)
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        return Ok(Config::load_from(path)?);
    }
    if path.as_os_str() == DEFAULT_PATH {
        tracing::info!(path = %path.display(), "no configuration file, using defaults");
        return Ok(Config::default());
    }
    anyhow::bail!("configuration file {} does not exist", path.display())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args.config)?;

    match args.command {
        Commands::Init {
            user,
            password,
            views_only,
        } => commands::init(config, user, password, views_only).await,
        Commands::Create {
            command,
            arguments,
            number,
            parallelism,
            input,
        } => commands::create(config, command, arguments, number, parallelism, input).await,
        Commands::Get { id, download } => commands::get(config, &id, download).await,
        Commands::List { view, limit, offset } => commands::list(config, &view, limit, offset).await,
        Commands::Delete { id, view } => commands::delete(config, id, view).await,
        Commands::Run(run) => {
            let max_time = run.time.seconds();
            commands::run(
                config,
                commands::RunOptions {
                    job_id: run.job_id,
                    max_time,
                    margin: run.margin,
                    local: run.local,
                    endless: run.endless,
                    prioritize: run.prioritize,
                },
            )
            .await
        }
        Commands::Cancel { job_id } => commands::cancel(config, &job_id).await,
        Commands::Scrub { view, age } => commands::scrub(config, &view, age.seconds()).await,
        Commands::Check { host, dry_run, max } => {
            commands::check(config, host.as_deref(), dry_run, max).await
        }
        Commands::Submit { host, max, force } => commands::submit(config, &host, max, force).await,
        Commands::Summary => commands::summary(config).await,
    }
}
