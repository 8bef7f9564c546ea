//! Process handle for worker subprocesses.
//!
//! Owns the child's pid and the request pipe. The response pipe lives on
//! the collector thread (see `group`), so the handle only ever writes.

#![allow(dead_code)] // Some methods are for debugging/monitoring

use super::ipc::{LineWriter, PipeFd};
use super::protocol::PhaseRequest;
use crate::error::{EvqError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::Duration;

/// Handle to a worker subprocess.
pub struct ChildHandle {
    /// Process ID
    pid: Pid,
    /// Writer for sending phase requests to the worker
    writer: LineWriter,
    /// Whether the process has been reaped
    reaped: bool,
    /// Wait status captured when the process was reaped
    status: Option<WaitStatus>,
}

impl ChildHandle {
    /// Create a new handle from a pid and the write end of its stdin pipe.
    pub fn new(pid: Pid, stdin: PipeFd) -> Self {
        Self {
            pid,
            writer: LineWriter::new(stdin),
            reaped: false,
            status: None,
        }
    }

    /// Get the process ID.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Send a phase request to the worker.
    pub fn send(&mut self, request: &PhaseRequest) -> Result<()> {
        self.writer
            .write_line(&request.to_line())
            .map_err(|e| EvqError::Scheduling(format!("worker pid {}: {}", self.pid, e)))
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        if self.reaped {
            return false;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(status) => {
                self.reaped = true;
                self.status = Some(status);
                false
            }
            Err(_) => {
                self.reaped = true;
                false
            }
        }
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        if self.reaped {
            return Err(EvqError::Worker("process already reaped".into()));
        }
        match waitpid(self.pid, None) {
            Ok(status) => {
                self.reaped = true;
                self.status = Some(status);
                Ok(status)
            }
            Err(e) => Err(EvqError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// Try to wait for the process (non-blocking).
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        if self.reaped {
            return Err(EvqError::Worker("process already reaped".into()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.reaped = true;
                self.status = Some(status);
                Ok(Some(status))
            }
            Err(e) => Err(EvqError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// The exit status, if the process has been reaped.
    pub fn exit_status(&self) -> Option<WaitStatus> {
        self.status
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| EvqError::Worker(format!("failed to send SIGTERM: {}", e)))
    }

    /// Send SIGKILL to the process and wait for it to exit.
    pub fn kill(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| EvqError::Worker(format!("failed to send SIGKILL: {}", e)))?;
        self.wait()?;
        Ok(())
    }

    /// Gracefully stop the worker: send exit request, wait briefly, then
    /// escalate to SIGTERM and finally SIGKILL.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        if self.reaped {
            return Ok(());
        }

        let _ = self.send(&PhaseRequest::Exit);

        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if let Ok(Some(_)) = self.try_wait() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let _ = self.terminate();
        std::thread::sleep(Duration::from_millis(100));
        if let Ok(Some(_)) = self.try_wait() {
            return Ok(());
        }

        self.kill()
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.terminate();
            std::thread::sleep(Duration::from_millis(10));

            if let Ok(Some(_)) = self.try_wait() {
                return;
            }

            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            self.reaped = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::IntoRawFd;
    use std::process::{Command, Stdio};

    fn handle_for(mut child: std::process::Child) -> ChildHandle {
        let pid = Pid::from_raw(child.id() as i32);
        let stdin = child.stdin.take().expect("stdin not captured");
        let stdin_fd = unsafe { PipeFd::from_raw(stdin.into_raw_fd()) };
        ChildHandle::new(pid, stdin_fd)
    }

    #[test]
    fn test_handle_tracks_running_child() {
        let child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .expect("failed to spawn cat");

        let mut handle = handle_for(child);
        assert!(handle.is_running());

        handle.stop(Duration::from_secs(1)).expect("failed to stop");
        assert!(!handle.is_running());
    }

    #[test]
    fn test_terminate_reaps_child() {
        let child = Command::new("sleep")
            .arg("60")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .expect("failed to spawn sleep");

        let mut handle = handle_for(child);
        assert!(handle.is_running());

        handle.terminate().expect("failed to terminate");
        std::thread::sleep(Duration::from_millis(100));
        assert!(!handle.is_running());
        assert!(handle.exit_status().is_some());
    }

    #[test]
    fn test_send_to_exited_child_is_scheduling_error() {
        let child = Command::new("true")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .expect("failed to spawn true");

        let mut handle = handle_for(child);
        handle.wait().unwrap();
        // The read end is gone, so the pipe write fails with EPIPE.
        let mut err = None;
        for _ in 0..4 {
            if let Err(e) = handle.send(&PhaseRequest::Execute) {
                err = Some(e);
                break;
            }
        }
        match err {
            Some(EvqError::Scheduling(_)) => {}
            other => panic!("expected scheduling error, got {:?}", other),
        }
    }
}
