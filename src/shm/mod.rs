//! Named shared-memory segments for cross-process coordination.
//!
//! The job driver creates the segments before any worker starts; workers
//! attach to them by name after they have been spawned. All cross-process
//! mutation inside a segment goes through atomics, so a segment can be
//! mapped read-write by any number of processes at once.

mod board;
mod queue;

pub use board::JobBoard;
pub use queue::{QueueRecord, SharedQueue};

use crate::error::{EvqError, Result};
use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// Segment name for the event-index queue of a job.
pub fn events_segment(job_id: &str) -> Result<String> {
    segment_name(job_id, "events")
}

/// Segment name for the rank-assignment queue of a job.
pub fn ranks_segment(job_id: &str) -> Result<String> {
    segment_name(job_id, "ranks")
}

/// Segment name for the job board of a job.
pub fn board_segment(job_id: &str) -> Result<String> {
    segment_name(job_id, "board")
}

/// Builds a POSIX shm name (`/evq-<job>-<kind>`) from a job id.
///
/// POSIX requires the leading slash and no other slashes; job ids are
/// restricted to a safe character set so the name is portable.
fn segment_name(job_id: &str, kind: &str) -> Result<String> {
    if job_id.is_empty() || job_id.len() > 64 {
        return Err(EvqError::Config(format!(
            "job id must be 1-64 characters, got {} characters",
            job_id.len()
        )));
    }
    if !job_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(EvqError::Config(format!(
            "job id '{}' contains characters outside [A-Za-z0-9._-]",
            job_id
        )));
    }
    Ok(format!("/evq-{}-{}", job_id, kind))
}

/// A named POSIX shared-memory region mapped into this process.
///
/// The creator owns the name and unlinks it on drop; attachers only unmap.
pub struct ShmRegion {
    name: String,
    base: NonNull<c_void>,
    len: usize,
    owner: bool,
}

// Safety: the region only hands out its base pointer; all concurrent access
// to the mapped bytes is mediated by the atomic protocols layered on top
// (see `queue` and `board`).
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create a new named segment of `len` bytes, failing if it exists.
    ///
    /// The fresh segment is zero-filled by the kernel.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| EvqError::Shm(format!("creating segment '{}': {}", name, e)))?;

        nix::unistd::ftruncate(&fd, len as i64)
            .map_err(|e| EvqError::Shm(format!("sizing segment '{}': {}", name, e)))?;

        let base = Self::map(name, len, &fd)?;
        Ok(Self {
            name: name.to_string(),
            base,
            len,
            owner: true,
        })
    }

    /// Attach to an existing named segment of `len` bytes.
    pub fn attach(name: &str, len: usize) -> Result<Self> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())
            .map_err(|e| EvqError::Shm(format!("attaching segment '{}': {}", name, e)))?;

        let base = Self::map(name, len, &fd)?;
        Ok(Self {
            name: name.to_string(),
            base,
            len,
            owner: false,
        })
    }

    fn map(name: &str, len: usize, fd: &std::os::fd::OwnedFd) -> Result<NonNull<c_void>> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| EvqError::Shm(format!("segment '{}' has zero length", name)))?;

        // Safety: fd is a freshly opened shm object sized to `len`; we map it
        // shared read-write and keep the mapping until drop.
        unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(|e| EvqError::Shm(format!("mapping segment '{}': {}", name, e)))
    }

    /// Base address of the mapping.
    pub fn base(&self) -> NonNull<c_void> {
        self.base
    }

    /// Mapped length in bytes.
    #[allow(dead_code)] // For diagnostics
    pub fn len(&self) -> usize {
        self.len
    }

    /// Segment name (with leading slash).
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // Safety: base/len come from a successful mmap and are unmapped once.
        unsafe {
            let _ = munmap(self.base, self.len);
        }
        if self.owner {
            let _ = shm_unlink(self.name.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static TEST_SEQ: AtomicUsize = AtomicUsize::new(0);

    pub(crate) fn unique_name(tag: &str) -> String {
        format!(
            "/evq-test-{}-{}-{}",
            std::process::id(),
            tag,
            TEST_SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_segment_name_format() {
        assert_eq!(events_segment("job-12").unwrap(), "/evq-job-12-events");
        assert_eq!(ranks_segment("job-12").unwrap(), "/evq-job-12-ranks");
        assert_eq!(board_segment("job-12").unwrap(), "/evq-job-12-board");
    }

    #[test]
    fn test_segment_name_rejects_bad_ids() {
        assert!(segment_name("", "events").is_err());
        assert!(segment_name("has/slash", "events").is_err());
        assert!(segment_name("has space", "events").is_err());
        assert!(segment_name(&"x".repeat(65), "events").is_err());
    }

    #[test]
    fn test_create_and_attach_roundtrip() {
        let name = unique_name("region");
        let created = ShmRegion::create(&name, 4096).unwrap();
        assert_eq!(created.len(), 4096);

        // Write through one mapping, read through another.
        // Safety: both mappings cover the same 4096-byte segment.
        unsafe {
            *(created.base().as_ptr() as *mut u64) = 0xdead_beef;
        }
        let attached = ShmRegion::attach(&name, 4096).unwrap();
        let value = unsafe { *(attached.base().as_ptr() as *const u64) };
        assert_eq!(value, 0xdead_beef);
    }

    #[test]
    fn test_create_fails_if_exists() {
        let name = unique_name("dup");
        let _held = ShmRegion::create(&name, 1024).unwrap();
        assert!(ShmRegion::create(&name, 1024).is_err());
    }

    #[test]
    fn test_attach_fails_for_missing_segment() {
        let name = unique_name("missing");
        assert!(ShmRegion::attach(&name, 1024).is_err());
    }

    #[test]
    fn test_owner_unlinks_on_drop() {
        let name = unique_name("unlink");
        {
            let _region = ShmRegion::create(&name, 1024).unwrap();
        }
        assert!(ShmRegion::attach(&name, 1024).is_err());
    }
}
