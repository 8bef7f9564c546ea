//! Integration tests for the evq CLI.
//!
//! These drive the real binary end-to-end: the run command seeds the shared
//! queues, spawns actual worker subprocesses, and winds them down in order.

use assert_cmd::Command;
use predicates::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::tempdir;

static JOB_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Get a command for the evq binary.
fn evq() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("evq").unwrap()
}

/// Unique job id per test so concurrent tests never share segments.
fn job_id(tag: &str) -> String {
    format!(
        "it-{}-{}-{}",
        std::process::id(),
        tag,
        JOB_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

// ============================================================================
// Help and Version Tests
// ============================================================================

#[test]
fn test_help_displays() {
    evq()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("worker-pool coordinator"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("completions"));
}

#[test]
fn test_help_hides_worker_mode() {
    evq()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Internal worker mode").not());
}

#[test]
fn test_version_displays() {
    evq()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_run_help_lists_options() {
    evq()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--workers"))
        .stdout(predicate::str::contains("--records"))
        .stdout(predicate::str::contains("--top-dir"))
        .stdout(predicate::str::contains("--finalize-timeout-secs"));
}

#[test]
fn test_completions_bash() {
    evq()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("_evq"));
}

// ============================================================================
// Configuration Errors
// ============================================================================

#[test]
fn test_zero_workers_is_rejected() {
    let tmp = tempdir().unwrap();
    evq()
        .args(["run", "--workers", "0", "--records", "4"])
        .args(["--top-dir", tmp.path().to_str().unwrap()])
        .args(["--job-id", &job_id("zero"), "--no-progress"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}

#[test]
fn test_negative_worker_count_is_rejected() {
    let tmp = tempdir().unwrap();
    evq()
        .args(["run", "--workers", "-5", "--records", "4"])
        .args(["--top-dir", tmp.path().to_str().unwrap()])
        .args(["--job-id", &job_id("neg"), "--no-progress"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}

#[test]
fn test_bad_job_id_is_rejected() {
    let tmp = tempdir().unwrap();
    evq()
        .args(["run", "--workers", "1", "--records", "1"])
        .args(["--top-dir", tmp.path().to_str().unwrap()])
        .args(["--job-id", "has/slash", "--no-progress"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}

// ============================================================================
// End-to-End Runs
// ============================================================================

#[test]
fn test_four_workers_process_ten_records() {
    // Scenario: 4 workers, 10 record indices pushed, final flag set after
    // the push. Every index reaches exactly one worker.
    let tmp = tempdir().unwrap();
    evq()
        .args(["run", "--workers", "4", "--records", "10"])
        .args(["--top-dir", tmp.path().to_str().unwrap()])
        .args(["--job-id", &job_id("ten"), "--no-progress"])
        .assert()
        .success()
        .stdout(predicate::str::contains("total records processed: 10"))
        .stdout(predicate::str::contains("worker 0"))
        .stdout(predicate::str::contains("worker 3"));
}

#[test]
fn test_single_worker_processes_whole_batch() {
    let tmp = tempdir().unwrap();
    evq()
        .args(["run", "--workers", "1", "--records", "50"])
        .args(["--top-dir", tmp.path().to_str().unwrap()])
        .args(["--job-id", &job_id("solo"), "--no-progress"])
        .assert()
        .success()
        .stdout(predicate::str::contains("total records processed: 50"))
        .stdout(predicate::str::contains("done, 50 records processed"));
}

#[test]
fn test_zero_records_finishes_cleanly() {
    let tmp = tempdir().unwrap();
    evq()
        .args(["run", "--workers", "2", "--records", "0"])
        .args(["--top-dir", tmp.path().to_str().unwrap()])
        .args(["--job-id", &job_id("empty"), "--no-progress"])
        .assert()
        .success()
        .stdout(predicate::str::contains("total records processed: 0"));
}

#[test]
fn test_more_workers_than_records() {
    let tmp = tempdir().unwrap();
    evq()
        .args(["run", "--workers", "4", "--records", "2"])
        .args(["--top-dir", tmp.path().to_str().unwrap()])
        .args(["--job-id", &job_id("sparse"), "--no-progress"])
        .assert()
        .success()
        .stdout(predicate::str::contains("total records processed: 2"));
}

#[test]
fn test_shared_source_mode_runs() {
    let tmp = tempdir().unwrap();
    evq()
        .args(["run", "--workers", "2", "--records", "8", "--shared-source"])
        .args(["--top-dir", tmp.path().to_str().unwrap()])
        .args(["--job-id", &job_id("shared"), "--no-progress"])
        .assert()
        .success()
        .stdout(predicate::str::contains("total records processed: 8"));
}

#[test]
fn test_simulated_work_still_processes_everything() {
    let tmp = tempdir().unwrap();
    evq()
        .args(["run", "--workers", "2", "--records", "12", "--work-ms", "5"])
        .args(["--top-dir", tmp.path().to_str().unwrap()])
        .args(["--job-id", &job_id("busy"), "--no-progress"])
        .assert()
        .success()
        .stdout(predicate::str::contains("total records processed: 12"));
}

// ============================================================================
// Worker Isolation
// ============================================================================

#[test]
fn test_worker_log_layout() {
    let tmp = tempdir().unwrap();
    evq()
        .env("EVQ_LOG", "info")
        .args(["run", "--workers", "2", "--records", "6"])
        .args(["--top-dir", tmp.path().to_str().unwrap()])
        .args(["--job-id", &job_id("logs"), "--no-progress"])
        .assert()
        .success()
        .stdout(predicate::str::contains("worker logs under"));

    for rank in 0..2 {
        let log = tmp.path().join(format!("worker-{}/worker.log", rank));
        assert!(log.is_file(), "missing worker log at {}", log.display());
        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(
            contents.contains("Worker starting"),
            "log {} has no startup line",
            log.display()
        );
    }
}

// ============================================================================
// Failure Handling
// ============================================================================

#[test]
fn test_failed_record_fails_one_worker_and_preserves_counts() {
    // Record 3 fails in whichever worker pops it; the index is lost with no
    // retry, the worker is marked failed, and everything else completes.
    let tmp = tempdir().unwrap();
    evq()
        .args(["run", "--workers", "2", "--records", "6", "--fail-record", "3"])
        .args(["--top-dir", tmp.path().to_str().unwrap()])
        .args(["--job-id", &job_id("fail"), "--no-progress"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("total records processed: 5"))
        .stdout(predicate::str::contains("failed"))
        .stderr(predicate::str::contains("failed worker"));
}

#[test]
fn test_sigint_drains_best_effort_and_reports() {
    // A stop request mid-run switches result collection to the unsequenced
    // drain; the driver still prints the summary with whatever counts it
    // has, instead of hanging or crashing.
    let tmp = tempdir().unwrap();
    let bin = assert_cmd::cargo::cargo_bin("evq");
    let mut child = std::process::Command::new(bin)
        .args(["run", "--workers", "2", "--records", "200", "--work-ms", "50"])
        .args(["--top-dir", tmp.path().to_str().unwrap()])
        .args(["--job-id", &job_id("sigint"), "--no-progress"])
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .unwrap();

    // Let the pool bootstrap and start chewing, then interrupt it.
    std::thread::sleep(std::time::Duration::from_millis(1500));
    let _ = std::process::Command::new("kill")
        .args(["-INT", &child.id().to_string()])
        .status()
        .unwrap();

    let output = child.wait_with_output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("total records processed:"),
        "stdout was:\n{}",
        stdout
    );
}

#[test]
fn test_finalization_is_scheduled_sequentially() {
    // The coordinator logs each finalize release; with 3 workers there must
    // be exactly three, and never one before the previous completion.
    let tmp = tempdir().unwrap();
    let output = evq()
        .env("EVQ_LOG", "info")
        .args(["run", "--workers", "3", "--records", "9"])
        .args(["--top-dir", tmp.path().to_str().unwrap()])
        .args(["--job-id", &job_id("seq"), "--no-progress"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    let scheduled = stderr.matches("Finalize scheduled").count();
    let completed = stderr.matches("Finalize completed").count();
    assert_eq!(scheduled, 3, "stderr was:\n{}", stderr);
    assert_eq!(completed, 3, "stderr was:\n{}", stderr);

    // Strict alternation: a finalize is only scheduled after the previous
    // one completed.
    let mut outstanding = 0i32;
    for line in stderr.lines() {
        if line.contains("Finalize scheduled") {
            outstanding += 1;
            assert!(outstanding <= 1, "two finalize calls in flight:\n{}", stderr);
        } else if line.contains("Finalize completed") {
            outstanding -= 1;
        }
    }
    assert_eq!(outstanding, 0);
}
