//! Multi-process worker pool with lifecycle coordination.
//!
//! The parent process seeds a shared-memory queue of record indices, spawns
//! worker subprocesses, and drives each through three phases: bootstrap
//! (claim a rank, attach shared state), execute (drain the record queue),
//! and finalize (orderly wind-down, strictly one worker at a time).
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │  Parent Process  │
//!                  │  (Coordinator)   │
//!                  └────────┬─────────┘
//!             requests ↓    │    ↑ results (collector threads)
//!            ┌──────────────┼──────────────┐
//!            │              │              │
//!      ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!      │ Worker 0  │  │ Worker 1  │  │ Worker N  │
//!      │ (process) │  │ (process) │  │ (process) │
//!      └─────┬─────┘  └─────┬─────┘  └─────┬─────┘
//!            └──────────────┼──────────────┘
//!                  ┌────────▼─────────┐
//!                  │  shared memory   │
//!                  │ events / ranks / │
//!                  │    job board     │
//!                  └──────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Rank assignment**: every rank in `0..N` is claimed by exactly one worker
//! - **Record delivery**: each record index reaches exactly one worker
//! - **Finalization**: at most one worker finalizes at a time, in the order
//!   the parent observed their execute-completions

mod coordinator;
mod group;
mod ipc;
mod proc;
mod protocol;
mod sequencer;
mod signals;
mod spawn;
pub mod worker_main;

pub use coordinator::{
    Coordinator, PoolConfig, USE_ALL_CPUS, WorkerState, WorkerStatus, resolve_worker_count,
};
pub use group::WorkerId;
pub use signals::TerminationReason;
pub use worker_main::{WorkerConfig, run_worker_main};
