//! External collaborator seams.
//!
//! The pool machinery never looks inside record processing; it only needs
//! the three call surfaces below. The simulated implementations back the
//! CLI and the integration tests; an embedding job driver supplies real
//! ones through [`Collaborators`].

use crate::error::{EvqError, Result};
use std::time::Duration;

/// Consumes one record at a time: position on an index, then process it.
pub trait RecordProcessor {
    fn seek(&mut self, index: u64) -> Result<()>;
    fn process_next(&mut self) -> Result<()>;
}

/// Seekable record source with an optional shared-client mode, where each
/// worker registers itself under its rank.
pub trait RecordSource {
    fn make_client(&mut self, rank: u32) -> Result<()>;
}

/// Process-wide application lifecycle, stopped and torn down once per worker
/// at finalize-phase start.
pub trait AppLifecycle {
    fn stop(&mut self) -> Result<()>;
    fn teardown(&mut self) -> Result<()>;
}

/// The full collaborator set a worker runs against.
pub struct Collaborators {
    pub processor: Box<dyn RecordProcessor>,
    pub source: Box<dyn RecordSource>,
    pub lifecycle: Box<dyn AppLifecycle>,
}

/// Knobs for the simulated collaborators.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimOptions {
    /// Per-record busy time.
    pub work: Duration,
    /// Record index the processor fails on, if any.
    pub fail_record: Option<u64>,
}

/// Simulated record processor: spins for the configured time per record and
/// fails on the configured index.
pub struct SimProcessor {
    options: SimOptions,
    current: Option<u64>,
}

impl SimProcessor {
    pub fn new(options: SimOptions) -> Self {
        Self {
            options,
            current: None,
        }
    }
}

impl RecordProcessor for SimProcessor {
    fn seek(&mut self, index: u64) -> Result<()> {
        self.current = Some(index);
        Ok(())
    }

    fn process_next(&mut self) -> Result<()> {
        let index = self
            .current
            .take()
            .ok_or_else(|| EvqError::Worker("process_next called before seek".into()))?;
        if !self.options.work.is_zero() {
            std::thread::sleep(self.options.work);
        }
        if self.options.fail_record == Some(index) {
            return Err(EvqError::Worker(format!(
                "simulated processing failure on record {}",
                index
            )));
        }
        Ok(())
    }
}

/// Simulated record source; accepts any rank.
pub struct SimSource;

impl RecordSource for SimSource {
    fn make_client(&mut self, _rank: u32) -> Result<()> {
        Ok(())
    }
}

/// Simulated application lifecycle; rejects teardown before stop so the
/// wind-down call order stays honest.
#[derive(Default)]
pub struct SimLifecycle {
    stopped: bool,
}

impl SimLifecycle {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AppLifecycle for SimLifecycle {
    fn stop(&mut self) -> Result<()> {
        self.stopped = true;
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        if !self.stopped {
            return Err(EvqError::Worker("teardown before stop".into()));
        }
        Ok(())
    }
}

/// Build the simulated collaborator set used by the CLI worker.
pub fn simulated(options: SimOptions) -> Collaborators {
    Collaborators {
        processor: Box::new(SimProcessor::new(options)),
        source: Box::new(SimSource),
        lifecycle: Box::new(SimLifecycle::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_processor_processes_records() {
        let mut p = SimProcessor::new(SimOptions::default());
        p.seek(0).unwrap();
        p.process_next().unwrap();
        p.seek(1).unwrap();
        p.process_next().unwrap();
    }

    #[test]
    fn test_sim_processor_requires_seek() {
        let mut p = SimProcessor::new(SimOptions::default());
        assert!(p.process_next().is_err());
        // And the requirement is per record.
        p.seek(0).unwrap();
        p.process_next().unwrap();
        assert!(p.process_next().is_err());
    }

    #[test]
    fn test_sim_processor_fails_on_configured_record() {
        let mut p = SimProcessor::new(SimOptions {
            work: Duration::ZERO,
            fail_record: Some(2),
        });
        for index in [0u64, 1] {
            p.seek(index).unwrap();
            p.process_next().unwrap();
        }
        p.seek(2).unwrap();
        let err = p.process_next().unwrap_err();
        assert!(err.to_string().contains("record 2"));
    }

    #[test]
    fn test_sim_lifecycle_enforces_stop_before_teardown() {
        let mut l = SimLifecycle::new();
        assert!(l.teardown().is_err());
        l.stop().unwrap();
        l.teardown().unwrap();
    }
}
