//! Process group: owns the worker subprocesses and collects their results.
//!
//! Scheduling is a pipe write; completion collection is asynchronous. One
//! collector thread per worker reads its response pipe and ferries parsed
//! messages into a single channel, which gives the parent "block until at
//! least one scheduled call completes" without polling N pipes itself.

use super::ipc::LineReader;
use super::proc::ChildHandle;
use super::protocol::{PhaseRequest, PhaseResponse};
use super::signals::{TerminationReason, analyze_wait_status};
use super::spawn::{WorkerLaunch, spawn_collector_thread, spawn_worker};
use crate::error::{EvqError, Result};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError, channel};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Index of a worker within its pool.
pub type WorkerId = u32;

/// How long workers get to report in after spawn.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for the exit request during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// One collected message from a worker's response pipe.
#[derive(Debug)]
pub struct Collected {
    pub worker: WorkerId,
    pub event: CollectedEvent,
}

/// What the collector thread saw.
#[derive(Debug)]
pub enum CollectedEvent {
    /// A parsed protocol message.
    Response(PhaseResponse),
    /// The worker closed its pipe (exit or crash); no more messages follow.
    Disconnected,
}

struct WorkerSlot {
    handle: ChildHandle,
    collector: Option<JoinHandle<()>>,
}

/// A group of worker subprocesses with asynchronous result collection.
pub struct ProcessGroup {
    workers: Vec<WorkerSlot>,
    results: Receiver<Collected>,
}

impl ProcessGroup {
    /// Spawn `count` workers and wait for each to report ready.
    pub fn spawn(count: usize, launch: &WorkerLaunch) -> Result<Self> {
        let (tx, rx) = channel();

        let mut workers = Vec::with_capacity(count);
        for id in 0..count as WorkerId {
            let (handle, reader) = spawn_worker(launch)?;
            debug!(worker = id, pid = handle.pid().as_raw(), "Spawned worker");
            let collector = spawn_collector_thread(&format!("evq-collector-{}", id), {
                let tx = tx.clone();
                move || collector_loop(id, reader, tx)
            });
            workers.push(WorkerSlot {
                handle,
                collector: Some(collector),
            });
        }
        drop(tx);

        let group = Self {
            workers,
            results: rx,
        };
        group.await_ready(count)?;
        Ok(group)
    }

    /// Consume the startup ready message from every worker.
    fn await_ready(&self, count: usize) -> Result<()> {
        let deadline = Instant::now() + READY_TIMEOUT;
        let mut ready = vec![false; count];
        let mut remaining = count;
        while remaining > 0 {
            let timeout = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| {
                    EvqError::Worker(format!("{} workers never reported ready", remaining))
                })?;
            let collected = self.results.recv_timeout(timeout).map_err(|_| {
                EvqError::Worker(format!("{} workers never reported ready", remaining))
            })?;
            match collected.event {
                CollectedEvent::Response(PhaseResponse::Ready) => {
                    let slot = collected.worker as usize;
                    if !ready[slot] {
                        ready[slot] = true;
                        remaining -= 1;
                    }
                }
                CollectedEvent::Response(PhaseResponse::Error { message }) => {
                    return Err(EvqError::Worker(format!(
                        "worker {} failed during startup: {}",
                        collected.worker, message
                    )));
                }
                CollectedEvent::Disconnected => {
                    return Err(EvqError::Worker(format!(
                        "worker {} exited before reporting ready",
                        collected.worker
                    )));
                }
                CollectedEvent::Response(other) => {
                    return Err(EvqError::Worker(format!(
                        "worker {} sent unexpected startup message: {:?}",
                        collected.worker, other
                    )));
                }
            }
        }
        Ok(())
    }

    /// Number of workers in the group.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// OS process id of a worker.
    pub fn pid(&self, worker: WorkerId) -> Option<i32> {
        self.workers
            .get(worker as usize)
            .map(|w| w.handle.pid().as_raw())
    }

    /// Schedule a phase call on one worker, or on all of them.
    ///
    /// Broadcast attempts every worker and reports the first failure after
    /// trying the rest, so one dead worker doesn't hide the others.
    pub fn schedule(&mut self, target: Option<WorkerId>, request: &PhaseRequest) -> Result<()> {
        match target {
            Some(worker) => {
                let slot = self
                    .workers
                    .get_mut(worker as usize)
                    .ok_or_else(|| EvqError::Scheduling(format!("no worker {}", worker)))?;
                slot.handle.send(request)
            }
            None => {
                let mut first_err = None;
                for (id, slot) in self.workers.iter_mut().enumerate() {
                    if let Err(e) = slot.handle.send(request) {
                        warn!(worker = id, error = %e, "Dispatch failed");
                        first_err.get_or_insert(e);
                    }
                }
                match first_err {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }

    /// Block until a collected message is available or the timeout passes.
    ///
    /// Returns `None` on timeout and when every collector has finished and
    /// the channel is drained.
    pub fn wait_any(&self, timeout: Duration) -> Option<Collected> {
        match self.results.recv_timeout(timeout) {
            Ok(collected) => Some(collected),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Pull one already-available message without blocking.
    pub fn try_next(&self) -> Option<Collected> {
        match self.results.try_recv() {
            Ok(collected) => Some(collected),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Exit analysis for a worker (StillAlive if it has not exited).
    pub fn exit_reason(&mut self, worker: WorkerId) -> TerminationReason {
        let Some(slot) = self.workers.get_mut(worker as usize) else {
            return TerminationReason::Unknown;
        };
        match slot.handle.try_wait() {
            Ok(Some(status)) => analyze_wait_status(status),
            Ok(None) => TerminationReason::StillAlive,
            Err(_) => match slot.handle.exit_status() {
                Some(status) => analyze_wait_status(status),
                None => TerminationReason::Unknown,
            },
        }
    }

    /// Gracefully stop all workers and join the collector threads.
    pub fn shutdown(&mut self) {
        for (id, slot) in self.workers.iter_mut().enumerate() {
            if let Err(e) = slot.handle.stop(SHUTDOWN_TIMEOUT) {
                warn!(worker = id, error = %e, "Worker did not stop cleanly");
            }
        }
        for slot in &mut self.workers {
            if let Some(collector) = slot.collector.take() {
                let _ = collector.join();
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Response-reading loop run on the collector thread for one worker.
fn collector_loop(worker: WorkerId, mut reader: LineReader, tx: Sender<Collected>) {
    loop {
        let event = match reader.read_line() {
            Ok(Some(line)) => match PhaseResponse::from_line(line) {
                Ok(response) => CollectedEvent::Response(response),
                Err(e) => {
                    warn!(worker, error = %e, "Discarding unparseable worker message");
                    continue;
                }
            },
            Ok(None) => CollectedEvent::Disconnected,
            Err(e) => {
                debug!(worker, error = %e, "Worker pipe read failed");
                CollectedEvent::Disconnected
            }
        };
        let disconnect = matches!(event, CollectedEvent::Disconnected);
        if tx.send(Collected { worker, event }).is_err() {
            return; // parent went away
        }
        if disconnect {
            return;
        }
    }
}
