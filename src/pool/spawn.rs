//! Worker subprocess spawning.
//!
//! Workers are the same binary re-executed in its hidden `worker` mode, so
//! a pool never depends on a second executable being installed. Each worker
//! gets a dedicated stdin/stdout pipe pair for the phase protocol; stderr is
//! inherited so early failures (before the worker's own log file exists) are
//! visible to the operator.

use super::ipc::{LineReader, PipeFd};
use super::proc::ChildHandle;
use crate::error::{EvqError, Result};
use nix::unistd::Pid;
use std::os::unix::io::IntoRawFd;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Configuration forwarded to a worker subprocess.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    /// Job id naming the shared-memory segments.
    pub job_id: String,
    /// Top directory holding the per-worker directories.
    pub top_dir: PathBuf,
    /// Worker count; sizes the rank queue the worker attaches to.
    pub pool_size: usize,
    /// Capacity the event-index queue was created with.
    pub event_capacity: usize,
    /// Execute-loop poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Whether the worker should register as a shared record-source client.
    pub shared_source: bool,
    /// Simulated per-record processing time in milliseconds.
    pub work_ms: u64,
    /// Record index the simulated processor fails on, if any.
    pub fail_record: Option<u64>,
}

/// Spawn a worker subprocess.
///
/// Returns the request-side handle and the response-side reader; the caller
/// hands the reader to a collector thread.
pub fn spawn_worker(launch: &WorkerLaunch) -> Result<(ChildHandle, LineReader)> {
    let exe_path = std::env::current_exe()
        .map_err(|e| EvqError::Worker(format!("failed to get current executable: {}", e)))?;

    let mut cmd = Command::new(&exe_path);
    cmd.arg("worker");
    cmd.arg("--job-id").arg(&launch.job_id);
    cmd.arg("--top-dir").arg(&launch.top_dir);
    cmd.arg("--pool-size").arg(launch.pool_size.to_string());
    cmd.arg("--event-capacity")
        .arg(launch.event_capacity.to_string());
    cmd.arg("--poll-interval-ms")
        .arg(launch.poll_interval_ms.to_string());
    if launch.shared_source {
        cmd.arg("--shared-source");
    }
    if launch.work_ms > 0 {
        cmd.arg("--work-ms").arg(launch.work_ms.to_string());
    }
    if let Some(index) = launch.fail_record {
        cmd.arg("--fail-record").arg(index.to_string());
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());

    let mut child = cmd
        .spawn()
        .map_err(|e| EvqError::Worker(format!("failed to spawn worker: {}", e)))?;

    let pid = Pid::from_raw(child.id() as i32);
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| EvqError::Worker("child stdin not captured".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EvqError::Worker("child stdout not captured".into()))?;

    // Safety: into_raw_fd transfers ownership of valid descriptors.
    let stdin_fd = unsafe { PipeFd::from_raw(stdin.into_raw_fd()) };
    let stdout_fd = unsafe { PipeFd::from_raw(stdout.into_raw_fd()) };

    Ok((ChildHandle::new(pid, stdin_fd), LineReader::new(stdout_fd)))
}

/// Spawn a collector thread.
///
/// Collector threads run the response-reading loop for one worker and only
/// ferry parsed messages into a channel, so the default stack is fine.
pub fn spawn_collector_thread<F>(name: &str, f: F) -> std::thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("failed to spawn collector thread")
}
