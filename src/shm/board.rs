//! Job board: the small cross-process state block for one job.
//!
//! Carries the state that changes after worker bootstrap: how many records
//! the feeder has announced, and whether that count is final. The final flag
//! is write-once and monotonic (false to true), so readers need no lock; a
//! worker that sees an empty queue and a final count can stop polling.

use super::ShmRegion;
use crate::error::{EvqError, Result};
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const BOARD_MAGIC: u32 = 0x4556_5142; // "EVQB"

#[repr(C)]
struct BoardHeader {
    magic: u32,
    _pad: u32,
    total_records: AtomicU64,
    count_final: AtomicU32,
    _pad2: u32,
}

/// Shared job state block, created by the parent and attached by workers.
pub struct JobBoard {
    region: ShmRegion,
}

impl JobBoard {
    /// Create the named board for a job.
    pub fn create(name: &str) -> Result<Self> {
        let region = ShmRegion::create(name, size_of::<BoardHeader>())?;
        let board = Self { region };
        // Safety: freshly created mapping, exclusively ours until the magic
        // below is published.
        unsafe {
            let h = board.region.base().as_ptr() as *mut BoardHeader;
            std::ptr::addr_of_mut!((*h).magic).write_volatile(BOARD_MAGIC);
        }
        Ok(board)
    }

    /// Attach to an existing named board.
    pub fn attach(name: &str) -> Result<Self> {
        let region = ShmRegion::attach(name, size_of::<BoardHeader>())?;
        let board = Self { region };
        if board.header().magic != BOARD_MAGIC {
            return Err(EvqError::Shm(format!(
                "segment '{}' does not hold a job board",
                name
            )));
        }
        Ok(board)
    }

    fn header(&self) -> &BoardHeader {
        // Safety: the segment is exactly one BoardHeader; the mapping
        // outlives `self`.
        unsafe { &*(self.region.base().as_ptr() as *const BoardHeader) }
    }

    /// Update the announced record count. Only the feeder calls this.
    pub fn set_total(&self, total: u64) {
        self.header().total_records.store(total, Ordering::Release);
    }

    /// Mark the announced count as final. Write-once, monotonic.
    pub fn mark_final(&self) {
        self.header().count_final.store(1, Ordering::Release);
    }

    /// Announce a final record count in one step.
    pub fn publish_total(&self, total: u64) {
        self.set_total(total);
        self.mark_final();
    }

    /// The most recently announced record count.
    pub fn total(&self) -> u64 {
        self.header().total_records.load(Ordering::Acquire)
    }

    /// Whether the announced count is final ("no more records").
    pub fn is_final(&self) -> bool {
        self.header().count_final.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::unique_name;
    use super::*;

    #[test]
    fn test_board_starts_not_final() {
        let name = unique_name("board");
        let board = JobBoard::create(&name).unwrap();
        assert!(!board.is_final());
        assert_eq!(board.total(), 0);
    }

    #[test]
    fn test_publish_is_visible_through_second_mapping() {
        let name = unique_name("board-visible");
        let board = JobBoard::create(&name).unwrap();
        let attached = JobBoard::attach(&name).unwrap();

        board.set_total(42);
        assert_eq!(attached.total(), 42);
        assert!(!attached.is_final());

        board.mark_final();
        assert!(attached.is_final());
    }

    #[test]
    fn test_publish_total_sets_count_and_flag() {
        let name = unique_name("board-publish");
        let board = JobBoard::create(&name).unwrap();
        board.publish_total(10);
        assert_eq!(board.total(), 10);
        assert!(board.is_final());
    }

    #[test]
    fn test_attach_rejects_non_board_segment() {
        let name = unique_name("board-bad");
        let _region = ShmRegion::create(&name, size_of::<BoardHeader>()).unwrap();
        assert!(JobBoard::attach(&name).is_err());
    }
}
