//! Command-line interface definitions using clap.

use crate::job::RunOptions;
use crate::paths;
use crate::pool::{USE_ALL_CPUS, WorkerConfig};
use crate::record::SimOptions;
use crate::version;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Multi-process worker-pool coordinator for batch record processing.
#[derive(Parser, Debug)]
#[command(name = "evq")]
#[command(author, about, long_about = None)]
#[command(version = version::clap_version(), long_version = version::long_version())]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a batch job across a pool of worker processes.
    Run(RunArgs),

    /// Internal worker mode, spawned by the parent process.
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of worker processes (-1 = one per processing unit).
    #[arg(short, long, default_value_t = USE_ALL_CPUS, allow_hyphen_values = true)]
    pub workers: i64,

    /// Top directory for per-worker directories and logs.
    #[arg(long, env = "EVQ_TOP_DIR", default_value_os_t = paths::default_top_dir())]
    pub top_dir: PathBuf,

    /// Number of record indices to seed into the event queue.
    #[arg(short = 'n', long, default_value_t = 100)]
    pub records: u64,

    /// Job id naming the shared-memory segments.
    #[arg(long, default_value_t = default_job_id())]
    pub job_id: String,

    /// Worker poll interval while the queue is temporarily empty (ms).
    #[arg(long, default_value_t = 2)]
    pub poll_interval_ms: u64,

    /// Force-release a stuck finalizing worker after this many seconds
    /// (0 disables the deadline).
    #[arg(long, default_value_t = 30)]
    pub finalize_timeout_secs: u64,

    /// Register each worker as a shared record-source client.
    #[arg(long)]
    pub shared_source: bool,

    /// Simulated per-record processing time (ms).
    #[arg(long, default_value_t = 0)]
    pub work_ms: u64,

    /// Make the simulated processor fail on this record index.
    #[arg(long)]
    pub fail_record: Option<u64>,

    /// Disable the progress bar.
    #[arg(long)]
    pub no_progress: bool,
}

impl RunArgs {
    pub fn to_run_options(&self) -> RunOptions {
        RunOptions {
            workers: self.workers,
            top_dir: paths::expand_tilde(&self.top_dir),
            records: self.records,
            job_id: self.job_id.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            finalize_timeout: match self.finalize_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            shared_source: self.shared_source,
            work_ms: self.work_ms,
            fail_record: self.fail_record,
            show_progress: !self.no_progress,
        }
    }
}

/// Arguments for the hidden worker mode.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Job id naming the shared-memory segments.
    #[arg(long)]
    pub job_id: String,

    /// Top directory for per-worker directories and logs.
    #[arg(long)]
    pub top_dir: PathBuf,

    /// Worker count; sizes the rank queue.
    #[arg(long)]
    pub pool_size: usize,

    /// Capacity the event-index queue was created with.
    #[arg(long)]
    pub event_capacity: usize,

    /// Poll interval while the queue is temporarily empty (ms).
    #[arg(long, default_value_t = 2)]
    pub poll_interval_ms: u64,

    /// Register as a shared record-source client.
    #[arg(long)]
    pub shared_source: bool,

    /// Simulated per-record processing time (ms).
    #[arg(long, default_value_t = 0)]
    pub work_ms: u64,

    /// Make the simulated processor fail on this record index.
    #[arg(long)]
    pub fail_record: Option<u64>,
}

impl WorkerArgs {
    pub fn to_worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            job_id: self.job_id.clone(),
            top_dir: self.top_dir.clone(),
            pool_size: self.pool_size,
            event_capacity: self.event_capacity,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            shared_source: self.shared_source,
            sim: SimOptions {
                work: Duration::from_millis(self.work_ms),
                fail_record: self.fail_record,
            },
        }
    }
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "evq",
            &mut std::io::stdout(),
        );
    }
}

/// Default job id: derived from the driver's pid so concurrent jobs on one
/// host get distinct segment names.
fn default_job_id() -> String {
    format!("job-{}", std::process::id())
}
