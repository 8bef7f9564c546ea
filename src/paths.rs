//! Path conventions for evq job directories.
//!
//! Each worker runs inside its own subdirectory of the job's top directory
//! and writes an isolated log there:
//!
//! ```text
//! <top>/worker-0/worker.log
//! <top>/worker-1/worker.log
//! ...
//! ```

use std::path::{Path, PathBuf};

/// Per-worker directory prefix under the job top directory.
pub const WORKER_DIR_PREFIX: &str = "worker-";

/// Log filename inside each worker directory.
pub const WORKER_LOG_FILENAME: &str = "worker.log";

/// Default top directory for job runs when none is given on the command line.
pub fn default_top_dir() -> PathBuf {
    std::env::temp_dir().join("evq")
}

/// Directory for a single worker, by rank.
pub fn worker_dir<P: AsRef<Path>>(top: P, rank: u32) -> PathBuf {
    top.as_ref().join(format!("{}{}", WORKER_DIR_PREFIX, rank))
}

/// Log file path for a single worker, by rank.
pub fn worker_log_path<P: AsRef<Path>>(top: P, rank: u32) -> PathBuf {
    worker_dir(top, rank).join(WORKER_LOG_FILENAME)
}

/// Expands a leading `~` in a path to the user's home directory.
///
/// This handles the common case where shell tilde expansion doesn't occur,
/// such as when using `--top-dir=~/jobs` syntax instead of `--top-dir ~/jobs`.
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

/// Ensures a directory exists, creating it and any missing parents.
pub fn ensure_dir<P: AsRef<Path>>(dir: P) -> std::io::Result<()> {
    let dir = dir.as_ref();
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_dir_naming() {
        let dir = worker_dir("/data/job7", 0);
        assert_eq!(dir, PathBuf::from("/data/job7/worker-0"));
        let dir = worker_dir("/data/job7", 12);
        assert_eq!(dir, PathBuf::from("/data/job7/worker-12"));
    }

    #[test]
    fn test_worker_log_path_naming() {
        let path = worker_log_path("/data/job7", 3);
        assert_eq!(path, PathBuf::from("/data/job7/worker-3/worker.log"));
    }

    #[test]
    fn test_worker_log_paths_are_distinct() {
        let paths: Vec<_> = (0..4).map(|r| worker_log_path("/tmp/j", r)).collect();
        let unique: std::collections::HashSet<_> = paths.iter().collect();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn test_default_top_dir_ends_with_evq() {
        let dir = default_top_dir();
        assert_eq!(dir.file_name().unwrap().to_str().unwrap(), "evq");
    }

    #[test]
    fn test_expand_tilde_with_home() {
        let path = PathBuf::from("~/jobs/run1");
        let expanded = expand_tilde(&path);
        assert!(!expanded.to_str().unwrap().starts_with("~"));
        assert!(expanded.to_str().unwrap().ends_with("jobs/run1"));
    }

    #[test]
    fn test_expand_tilde_absolute_path_unchanged() {
        let path = PathBuf::from("/tmp/foo/bar");
        assert_eq!(expand_tilde(&path), path);
    }

    #[test]
    fn test_expand_tilde_relative_path_unchanged() {
        let path = PathBuf::from("./relative/path");
        assert_eq!(expand_tilde(&path), path);
    }

    #[test]
    fn test_ensure_dir_creates_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a/b/c");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
        // Idempotent
        ensure_dir(&nested).unwrap();
    }
}
