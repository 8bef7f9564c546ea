//! Exit-status analysis for worker subprocesses.
//!
//! Workers are not restarted; the termination reason feeds the per-worker
//! status report so an operator can tell a clean exit from a crash.

#![allow(dead_code)] // Some predicates are for diagnostics

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Likely out of memory (SIGKILL from OOM killer).
    OutOfMemory,
    /// Crashed on an invalid memory access.
    Crashed(Signal),
    /// Process is still running.
    StillAlive,
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::OutOfMemory => "out of memory (SIGKILL from OOM killer)".to_string(),
            Self::Crashed(sig) => format!("crashed ({:?})", sig),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),

        WaitStatus::Signaled(_, signal, _) => match signal {
            // SIGKILL without our involvement usually means the OOM killer
            Signal::SIGKILL => TerminationReason::OutOfMemory,
            Signal::SIGSEGV | Signal::SIGBUS => TerminationReason::Crashed(signal),
            _ => TerminationReason::Signaled(signal),
        },

        WaitStatus::StillAlive => TerminationReason::StillAlive,

        _ => TerminationReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_termination_reason_success() {
        assert!(TerminationReason::Exited(0).is_success());
        assert!(!TerminationReason::Exited(1).is_success());
        assert!(!TerminationReason::OutOfMemory.is_success());
        assert!(!TerminationReason::Crashed(Signal::SIGSEGV).is_success());
    }

    #[test]
    fn test_analyze_wait_status() {
        let status = WaitStatus::Exited(Pid::from_raw(1), 0);
        assert_eq!(analyze_wait_status(status), TerminationReason::Exited(0));

        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false);
        assert_eq!(analyze_wait_status(status), TerminationReason::OutOfMemory);

        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGSEGV, true);
        assert_eq!(
            analyze_wait_status(status),
            TerminationReason::Crashed(Signal::SIGSEGV)
        );

        let status = WaitStatus::StillAlive;
        assert_eq!(analyze_wait_status(status), TerminationReason::StillAlive);
    }

    #[test]
    fn test_description_mentions_signal() {
        let reason = TerminationReason::Signaled(Signal::SIGTERM);
        assert!(reason.to_string().contains("SIGTERM"));
    }
}
