//! Job driver for `evq run`.
//!
//! Seeds the event-index queue, publishes the record count, creates the
//! worker pool, and drives it to completion: execute on all workers, then
//! finalize one worker at a time in completion order.

use crate::error::{EvqError, Result};
use crate::paths;
use crate::pool::{Coordinator, PoolConfig, WorkerStatus};
use crate::shm::{self, JobBoard, SharedQueue};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use nix::sys::signal::{SigHandler, Signal, signal};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Set by the SIGINT handler; the run loop switches the coordinator to the
/// best-effort drain when it sees this.
static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_: i32) {
    STOP_REQUESTED.store(true, Ordering::Relaxed);
}

/// Options for one job run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Worker count; -1 means one per processing unit.
    pub workers: i64,
    /// Top directory for per-worker directories and logs.
    pub top_dir: PathBuf,
    /// Number of record indices to seed (`0..records`).
    pub records: u64,
    /// Job id naming the shared-memory segments.
    pub job_id: String,
    /// Worker poll interval while the queue is temporarily empty.
    pub poll_interval: Duration,
    /// Force-release a finalizing worker after this long; `None` disables.
    pub finalize_timeout: Option<Duration>,
    /// Register each worker as a shared record-source client.
    pub shared_source: bool,
    /// Simulated per-record processing time (ms).
    pub work_ms: u64,
    /// Record index the simulated processor fails on, if any.
    pub fail_record: Option<u64>,
    /// Show a progress bar while the job runs.
    pub show_progress: bool,
}

/// Outcome of one job run.
#[derive(Debug)]
pub struct JobSummary {
    pub job_id: String,
    pub workers: usize,
    pub records: u64,
    pub total_processed: u64,
    pub statuses: Vec<WorkerStatus>,
    pub failed_workers: usize,
    pub decode_failures: usize,
    pub log_paths: Vec<PathBuf>,
    pub top_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

/// Run a batch job to completion.
pub fn run_job(options: &RunOptions) -> Result<JobSummary> {
    let run_start = Instant::now();
    paths::ensure_dir(&options.top_dir)?;

    // The queue is sized to hold the whole batch; workers only ever drain it.
    let capacity = options.records.max(1) as usize;
    let events = SharedQueue::<u64>::create(&shm::events_segment(&options.job_id)?, capacity)?;
    let board = JobBoard::create(&shm::board_segment(&options.job_id)?)?;

    for index in 0..options.records {
        if !events.try_push(index) {
            return Err(EvqError::Queue(format!(
                "event queue rejected record index {}",
                index
            )));
        }
    }
    board.publish_total(options.records);
    info!(records = options.records, job_id = %options.job_id, "Seeded event queue");

    let mut coordinator = Coordinator::create_pool(PoolConfig {
        worker_count: options.workers,
        top_dir: options.top_dir.clone(),
        job_id: options.job_id.clone(),
        event_capacity: capacity,
        poll_interval: options.poll_interval,
        finalize_timeout: options.finalize_timeout,
        shared_source: options.shared_source,
        work_ms: options.work_ms,
        fail_record: options.fail_record,
    })?;
    let started_at = coordinator.started_at();

    coordinator.start_execution()?;

    let progress_bar = if options.show_progress {
        let pb = ProgressBar::new(options.records);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .expect("static progress template")
                .progress_chars("█▓▒░  "),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        Some(pb)
    } else {
        None
    };

    // Safety: installing a handler that only stores to an atomic is
    // async-signal-safe.
    unsafe {
        let _ = signal(Signal::SIGINT, SigHandler::Handler(handle_sigint));
    }

    let mut decode_failures = 0usize;
    loop {
        if STOP_REQUESTED.load(Ordering::Relaxed) {
            warn!("Stop requested; draining available results without sequencing");
            coordinator.request_stop();
            if coordinator.wait_once().is_err() {
                decode_failures += 1;
            }
            break;
        }
        match coordinator.wait_once() {
            Ok(more) => {
                if let Some(pb) = &progress_bar {
                    pb.set_position(coordinator.total_processed());
                }
                if !more {
                    break;
                }
            }
            Err(e) => {
                // A decode failure is fatal for that result only; results
                // from other workers are still collected.
                warn!(error = %e, "wait_once reported failure");
                decode_failures += 1;
                if !coordinator.completions_pending() {
                    break;
                }
            }
        }
    }

    if let Some(pb) = &progress_bar {
        pb.set_position(coordinator.total_processed());
        pb.finish_with_message("all workers finished");
    }

    coordinator.shutdown();

    let statuses = coordinator.report_statuses();
    let failed_workers = statuses
        .iter()
        .filter(|s| s.state == crate::pool::WorkerState::Failed)
        .count();

    Ok(JobSummary {
        job_id: options.job_id.clone(),
        workers: coordinator.worker_count(),
        records: options.records,
        total_processed: coordinator.total_processed(),
        statuses,
        failed_workers,
        decode_failures,
        log_paths: coordinator.worker_log_paths(),
        top_dir: options.top_dir.clone(),
        started_at,
        elapsed: run_start.elapsed(),
    })
}

// run_job spawns real worker subprocesses, so its scenarios live in the CLI
// integration tests.
