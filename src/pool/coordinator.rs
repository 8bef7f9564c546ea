//! Worker lifecycle coordinator.
//!
//! Drives the pool through bootstrap, execute and finalize while holding the
//! ordering invariants: every rank is issued exactly once, every record index
//! is consumed at most once, and finalize runs for one worker at a time in
//! execute-completion order. Runs single-threaded in the parent; the only
//! concurrency here is the collector channel it drains.

use super::group::{Collected, CollectedEvent, ProcessGroup, WorkerId};
use super::protocol::{PhaseOutcome, PhaseRequest, PhaseResponse, WorkResult};
use super::sequencer::{ExpiredHead, FinalizationSequencer};
use super::signals::TerminationReason;
use super::spawn::WorkerLaunch;
use crate::error::{EvqError, Result};
use crate::paths;
use crate::shm::{self, SharedQueue};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sentinel worker count: use all available processing units.
pub const USE_ALL_CPUS: i64 = -1;

/// How often the wait loop wakes up to check the stop flag and the
/// finalize deadline.
const WAIT_TICK: Duration = Duration::from_millis(100);

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of workers; [`USE_ALL_CPUS`] means one per processing unit.
    pub worker_count: i64,
    /// Top directory holding the per-worker directories.
    pub top_dir: PathBuf,
    /// Job id naming the shared-memory segments.
    pub job_id: String,
    /// Capacity the event-index queue was created with.
    pub event_capacity: usize,
    /// Worker execute-loop poll interval.
    pub poll_interval: Duration,
    /// Deadline for a scheduled finalize call; `None` disables expiry.
    pub finalize_timeout: Option<Duration>,
    /// Register workers as shared record-source clients.
    pub shared_source: bool,
    /// Simulated per-record processing time (demo processor).
    pub work_ms: u64,
    /// Record index the demo processor fails on, if any.
    pub fail_record: Option<u64>,
}

/// Per-worker lifecycle state, parent's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Bootstrapping,
    Ready,
    Running,
    AwaitingFinalization,
    Finalizing,
    Done,
    Failed,
}

impl WorkerState {
    /// Terminal states produce no further completions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Bootstrapping => "bootstrapping",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::AwaitingFinalization => "awaiting-finalization",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One row of the per-worker status report.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub worker: WorkerId,
    pub pid: i32,
    pub rank: Option<u32>,
    pub state: WorkerState,
    pub processed: u64,
    pub exit: TerminationReason,
}

/// Resolve the configured worker count, honoring the all-CPUs sentinel.
pub fn resolve_worker_count(configured: i64) -> Result<usize> {
    match configured {
        USE_ALL_CPUS => Ok(std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)),
        n if n > 0 => Ok(n as usize),
        n => Err(EvqError::Config(format!(
            "worker count must be positive or {} for all CPUs, got {}",
            USE_ALL_CPUS, n
        ))),
    }
}

/// The worker lifecycle coordinator.
pub struct Coordinator {
    group: ProcessGroup,
    sequencer: FinalizationSequencer,
    states: Vec<WorkerState>,
    processed: HashMap<WorkerId, u64>,
    ranks: HashMap<WorkerId, u32>,
    stop: Arc<AtomicBool>,
    top_dir: PathBuf,
    started_at: DateTime<Utc>,
    // Held so the parent keeps both segments mapped for the job's lifetime;
    // the rank queue is owned here and unlinked on drop.
    _events: SharedQueue<u64>,
    _rank_queue: SharedQueue<u32>,
}

impl Coordinator {
    /// Create the pool: attach the event queue, issue ranks, spawn workers,
    /// and schedule bootstrap on all of them.
    pub fn create_pool(config: PoolConfig) -> Result<Self> {
        if config.top_dir.as_os_str().is_empty() {
            return Err(EvqError::Config("top directory must not be empty".into()));
        }
        let count = resolve_worker_count(config.worker_count)?;
        if config.event_capacity == 0 {
            return Err(EvqError::Config("event queue capacity must be positive".into()));
        }

        let events =
            SharedQueue::<u64>::attach(&shm::events_segment(&config.job_id)?, config.event_capacity)?;

        // Capacity equals the worker count, so the blocking sends can only
        // stall if something else wrote into the segment.
        let rank_queue = SharedQueue::<u32>::create(&shm::ranks_segment(&config.job_id)?, count)?;
        for rank in 0..count as u32 {
            rank_queue.push(rank, Duration::from_secs(5))?;
        }

        let launch = WorkerLaunch {
            job_id: config.job_id.clone(),
            top_dir: config.top_dir.clone(),
            pool_size: count,
            event_capacity: config.event_capacity,
            poll_interval_ms: config.poll_interval.as_millis() as u64,
            shared_source: config.shared_source,
            work_ms: config.work_ms,
            fail_record: config.fail_record,
        };
        let mut group = ProcessGroup::spawn(count, &launch)?;
        group.schedule(None, &PhaseRequest::Bootstrap)?;

        info!(workers = count, job_id = %config.job_id, "Worker pool created");

        Ok(Self {
            group,
            sequencer: FinalizationSequencer::new(config.finalize_timeout),
            states: vec![WorkerState::Bootstrapping; count],
            processed: HashMap::new(),
            ranks: HashMap::new(),
            stop: Arc::new(AtomicBool::new(false)),
            top_dir: config.top_dir,
            started_at: Utc::now(),
            _events: events,
            _rank_queue: rank_queue,
        })
    }

    /// Number of workers in the pool.
    pub fn worker_count(&self) -> usize {
        self.group.worker_count()
    }

    /// When the pool was created.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Schedule the execute call on every worker (non-blocking dispatch).
    pub fn start_execution(&mut self) -> Result<()> {
        self.group.schedule(None, &PhaseRequest::Execute)?;
        for state in &mut self.states {
            if !state.is_terminal() {
                *state = WorkerState::Running;
            }
        }
        info!("Execution scheduled on all workers");
        Ok(())
    }

    /// Ask the wait loop to stop waiting and drain best-effort.
    ///
    /// [`Self::wait_once`] observes the request at its next tick and
    /// switches to the unsequenced drain.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Whether any worker may still produce a completion.
    pub fn completions_pending(&self) -> bool {
        self.states.iter().any(|s| !s.is_terminal())
    }

    /// Block until at least one scheduled call completes, decode it, and
    /// report whether more completions may follow.
    ///
    /// When a stop has been requested, switches to draining every available
    /// result without finalization sequencing (the job is already aborting,
    /// so ordering is intentionally skipped). A decode failure is returned
    /// to the caller but never stops the drain.
    pub fn wait_once(&mut self) -> Result<bool> {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                let drained = self.drain_available();
                return drained.map(|_| self.completions_pending());
            }

            if let Some(expired) = self.sequencer.expire_head() {
                self.handle_expired_head(expired);
            }

            match self.group.wait_any(WAIT_TICK) {
                Some(collected) => {
                    let result = self.handle_collected(collected, true);
                    return result.map(|_| self.completions_pending());
                }
                None => {
                    if !self.completions_pending() {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Decode every result that is already available, without sequencing.
    fn drain_available(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(collected) = self.group.try_next() {
            if let Err(e) = self.handle_collected(collected, false) {
                warn!(error = %e, "Result decode failed during drain");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn handle_collected(&mut self, collected: Collected, sequenced: bool) -> Result<()> {
        let worker = collected.worker;
        match collected.event {
            CollectedEvent::Disconnected => {
                self.handle_disconnect(worker);
                Ok(())
            }
            CollectedEvent::Response(PhaseResponse::Ready) => {
                debug!(worker, "Ignoring duplicate ready message");
                Ok(())
            }
            CollectedEvent::Response(PhaseResponse::Error { message }) => {
                warn!(worker, %message, "Worker reported a phase error");
                self.mark_failed(worker, sequenced)
            }
            CollectedEvent::Response(PhaseResponse::Completed { result }) => {
                self.decode_result(worker, &result, sequenced)
            }
        }
    }

    /// Decode one WorkResult blob and apply its state transitions.
    ///
    /// Malformed blobs are ignored as a no-op. `sequenced` selects whether
    /// execute/finalize completions drive the finalization sequencer.
    fn decode_result(&mut self, worker: WorkerId, blob: &[u8], sequenced: bool) -> Result<()> {
        let Some(result) = WorkResult::decode(blob) else {
            debug!(worker, len = blob.len(), "Ignoring malformed result blob");
            return Ok(());
        };

        if !result.is_success() {
            warn!(
                worker,
                code = result.error_code,
                outcome = ?result.outcome,
                "Phase call returned failure"
            );
            // A failed execute still reports how far it got; the in-flight
            // record is lost with no retry.
            if let PhaseOutcome::Execute { processed } = result.outcome {
                self.processed.insert(worker, processed as u64);
            }
            return self.mark_failed(worker, sequenced);
        }

        match result.outcome {
            PhaseOutcome::Bootstrap { rank } => {
                debug!(worker, rank, "Worker bootstrapped");
                self.ranks.insert(worker, rank);
                self.set_state(worker, WorkerState::Ready);
                Ok(())
            }
            PhaseOutcome::Execute { processed } => {
                info!(worker, processed, "Execute completed");
                self.processed.insert(worker, processed as u64);
                self.set_state(worker, WorkerState::AwaitingFinalization);
                if sequenced {
                    if let Some(head) = self.sequencer.arrived(worker) {
                        self.schedule_finalize(head)?;
                    }
                }
                Ok(())
            }
            PhaseOutcome::Finalize => {
                if sequenced {
                    // An out-of-order completion leaves the queue and the
                    // states untouched; the matching completion is still
                    // processed normally when it arrives.
                    let next = self.sequencer.completed(worker)?;
                    info!(worker, "Finalize completed");
                    self.set_state(worker, WorkerState::Done);
                    if let Some(next) = next {
                        self.schedule_finalize(next)?;
                    }
                } else {
                    info!(worker, "Finalize completed (unsequenced drain)");
                    self.set_state(worker, WorkerState::Done);
                }
                Ok(())
            }
        }
    }

    fn schedule_finalize(&mut self, worker: WorkerId) -> Result<()> {
        self.group
            .schedule(Some(worker), &PhaseRequest::Finalize)
            .map_err(|e| EvqError::Scheduling(format!("finalize on worker {}: {}", worker, e)))?;
        self.set_state(worker, WorkerState::Finalizing);
        info!(worker, "Finalize scheduled");
        Ok(())
    }

    fn handle_disconnect(&mut self, worker: WorkerId) {
        if self
            .states
            .get(worker as usize)
            .is_some_and(|s| s.is_terminal())
        {
            // Normal pipe close after a finished worker exits.
            return;
        }
        warn!(worker, "Worker exited unexpectedly");
        self.set_state(worker, WorkerState::Failed);
        if let Some(next) = self.sequencer.remove(worker) {
            if let Err(e) = self.schedule_finalize(next) {
                warn!(worker = next, error = %e, "Could not release next finalize");
            }
        }
    }

    fn handle_expired_head(&mut self, expired: ExpiredHead) {
        warn!(
            worker = expired.expired,
            "Finalize deadline passed; force-releasing the finalization slot"
        );
        self.set_state(expired.expired, WorkerState::Failed);
        if let Some(next) = expired.next {
            if let Err(e) = self.schedule_finalize(next) {
                warn!(worker = next, error = %e, "Could not release next finalize");
            }
        }
    }

    fn mark_failed(&mut self, worker: WorkerId, sequenced: bool) -> Result<()> {
        self.set_state(worker, WorkerState::Failed);
        if sequenced {
            if let Some(next) = self.sequencer.remove(worker) {
                self.schedule_finalize(next)?;
            }
        }
        Ok(())
    }

    fn set_state(&mut self, worker: WorkerId, state: WorkerState) {
        if let Some(slot) = self.states.get_mut(worker as usize) {
            *slot = state;
        }
    }

    /// Per-worker status report: process id, exit status, processed count.
    pub fn report_statuses(&mut self) -> Vec<WorkerStatus> {
        (0..self.group.worker_count() as WorkerId)
            .map(|worker| WorkerStatus {
                worker,
                pid: self.group.pid(worker).unwrap_or(-1),
                rank: self.ranks.get(&worker).copied(),
                state: self.states[worker as usize],
                processed: self.processed.get(&worker).copied().unwrap_or(0),
                exit: self.group.exit_reason(worker),
            })
            .collect()
    }

    /// Total records processed across all workers.
    pub fn total_processed(&self) -> u64 {
        self.processed.values().sum()
    }

    /// Expected worker log paths, by the fixed naming convention.
    pub fn worker_log_paths(&self) -> Vec<PathBuf> {
        (0..self.group.worker_count() as u32)
            .map(|rank| paths::worker_log_path(&self.top_dir, rank))
            .collect()
    }

    /// Gracefully stop all workers.
    pub fn shutdown(&mut self) {
        self.group.shutdown();
    }
}
