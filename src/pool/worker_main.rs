//! Worker subprocess entry point.
//!
//! Runs when `evq worker` is invoked (hidden subcommand, spawned by the
//! parent). The worker reads phase requests from stdin and writes responses
//! to stdout; stdout is reserved for the protocol, so all logging goes to
//! stderr and to the per-rank log file once the rank is known.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{PhaseRequest, PhaseResponse, WorkResult};
use crate::error::{EvqError, Result};
use crate::logging::{self, LogConfig};
use crate::paths;
use crate::record::{self, Collaborators, SimOptions};
use crate::shm::{self, JobBoard, SharedQueue};
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long a worker waits for its rank to appear in the assignment queue.
const RANK_CLAIM_TIMEOUT: Duration = Duration::from_secs(5);

/// Worker-side configuration, parsed from the hidden CLI.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub job_id: String,
    pub top_dir: PathBuf,
    pub pool_size: usize,
    pub event_capacity: usize,
    pub poll_interval: Duration,
    pub shared_source: bool,
    pub sim: SimOptions,
}

/// State a worker holds after a successful bootstrap.
struct WorkerContext {
    rank: u32,
    events: SharedQueue<u64>,
    board: JobBoard,
    collaborators: Collaborators,
}

/// Claim a rank, set up the worker directory and log, attach shared state.
fn bootstrap(config: &WorkerConfig) -> Result<WorkerContext> {
    let rank_queue =
        SharedQueue::<u32>::attach(&shm::ranks_segment(&config.job_id)?, config.pool_size)?;

    // The parent pushed all ranks before spawning, so the claim should be
    // immediate; the retry covers attach racing the last push.
    let deadline = Instant::now() + RANK_CLAIM_TIMEOUT;
    let rank = loop {
        if let Some(rank) = rank_queue.try_pop() {
            break rank;
        }
        if Instant::now() >= deadline {
            return Err(EvqError::Worker(
                "no rank available in the assignment queue".into(),
            ));
        }
        std::thread::sleep(Duration::from_millis(1));
    };

    let worker_dir = paths::worker_dir(&config.top_dir, rank);
    paths::ensure_dir(&worker_dir)?;
    logging::init(
        LogConfig::new()
            .with_env_overrides()
            .with_file(paths::worker_log_path(&config.top_dir, rank)),
    );
    info!(rank, job_id = %config.job_id, "Worker starting");

    let events =
        SharedQueue::<u64>::attach(&shm::events_segment(&config.job_id)?, config.event_capacity)?;
    let board = JobBoard::attach(&shm::board_segment(&config.job_id)?)?;

    let mut collaborators = record::simulated(config.sim);
    if config.shared_source {
        collaborators.source.make_client(rank)?;
        debug!(rank, "Registered as shared record-source client");
    }

    Ok(WorkerContext {
        rank,
        events,
        board,
        collaborators,
    })
}

/// Drain the event-index queue until the record count is final.
///
/// Pops never block; an empty queue only ends the loop once the job board
/// says no more records are coming. Returns the processed count and the
/// phase error code (non-zero when a record failed; that index is lost).
fn execute_loop(ctx: &mut WorkerContext, poll: Duration) -> (u32, i32) {
    let mut processed = 0u32;
    loop {
        let index = match ctx.events.try_pop() {
            Some(index) => index,
            None => {
                if !ctx.board.is_final() {
                    // Temporarily empty; more records are expected.
                    std::thread::sleep(poll);
                    continue;
                }
                // Count is final; one more look closes the race with a
                // feeder that pushed just before flipping the flag.
                match ctx.events.try_pop() {
                    Some(index) => index,
                    None => break,
                }
            }
        };

        let dispatched = match ctx.collaborators.processor.seek(index) {
            Ok(()) => ctx.collaborators.processor.process_next(),
            Err(e) => Err(e),
        };
        if let Err(e) = dispatched {
            warn!(rank = ctx.rank, index, error = %e, "Record processing failed; index is lost");
            return (processed, 1);
        }
        processed += 1;
    }
    info!(rank = ctx.rank, processed, "Event queue drained");
    (processed, 0)
}

/// Stop and tear down the application lifecycle. Returns the error code.
fn run_finalize(ctx: &mut WorkerContext) -> i32 {
    if let Err(e) = ctx.collaborators.lifecycle.stop() {
        warn!(rank = ctx.rank, error = %e, "Lifecycle stop failed");
        return 1;
    }
    if let Err(e) = ctx.collaborators.lifecycle.teardown() {
        warn!(rank = ctx.rank, error = %e, "Lifecycle teardown failed");
        return 1;
    }
    info!(rank = ctx.rank, "Worker finalized");
    0
}

/// Worker main loop: read requests, run phases, write responses.
fn worker_loop(
    config: &WorkerConfig,
    reader: &mut LineReader,
    writer: &mut LineWriter,
) -> io::Result<()> {
    writer.write_line(&PhaseResponse::Ready.to_line())?;

    let mut ctx: Option<WorkerContext> = None;

    loop {
        let line = match reader.read_line()? {
            Some(line) => line.to_string(),
            None => return Ok(()), // EOF - parent closed the pipe
        };

        let request = match PhaseRequest::from_line(&line) {
            Ok(request) => request,
            Err(e) => {
                let resp = PhaseResponse::error(format!("invalid request: {}", e));
                writer.write_line(&resp.to_line())?;
                continue;
            }
        };

        let response = match request {
            PhaseRequest::Exit => return Ok(()),

            PhaseRequest::Bootstrap => match bootstrap(config) {
                Ok(new_ctx) => {
                    let rank = new_ctx.rank;
                    ctx = Some(new_ctx);
                    PhaseResponse::completed(WorkResult::bootstrap(0, rank).encode())
                }
                Err(e) => PhaseResponse::error(format!("bootstrap failed: {}", e)),
            },

            PhaseRequest::Execute => match ctx.as_mut() {
                Some(ctx) => {
                    let (processed, code) = execute_loop(ctx, config.poll_interval);
                    PhaseResponse::completed(WorkResult::execute(code, processed).encode())
                }
                None => PhaseResponse::error("execute requested before bootstrap"),
            },

            PhaseRequest::Finalize => match ctx.as_mut() {
                Some(ctx) => {
                    let code = run_finalize(ctx);
                    PhaseResponse::completed(WorkResult::finalize(code).encode())
                }
                None => PhaseResponse::error("finalize requested before bootstrap"),
            },
        };

        writer.write_line(&response.to_line())?;
    }
}

/// Run the worker subprocess main function.
///
/// Never returns; exits the process when the parent closes the pipe or
/// sends an exit request.
pub fn run_worker_main(config: WorkerConfig) -> ! {
    // Ignore SIGPIPE - pipe errors surface as io::Error instead.
    // Safety: installing SigIgn for SIGPIPE is safe at startup, before any
    // other thread exists.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    // Safety: file descriptors 0 and 1 are the pipes the parent attached.
    let stdin_fd = unsafe { PipeFd::from_raw(0) };
    let stdout_fd = unsafe { PipeFd::from_raw(1) };

    let mut reader = LineReader::new(stdin_fd);
    let mut writer = LineWriter::new(stdout_fd);

    match worker_loop(&config, &mut reader, &mut writer) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("evq worker error: {}", e);
            std::process::exit(1);
        }
    }
}
