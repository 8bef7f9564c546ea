//! Finalization sequencer.
//!
//! Finalize touches a shared external resource, so no two workers may run it
//! concurrently and the order must be deterministic: workers finalize in the
//! order the parent observed their execute-completions, not the order
//! execution began. The sequencer is owned by the coordinator alone and
//! never crosses a process or thread boundary.

use super::group::WorkerId;
use crate::error::{EvqError, Result};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A head that sat in the finalizing slot past its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredHead {
    /// The worker that was force-popped.
    pub expired: WorkerId,
    /// The next head to schedule finalize on, if any.
    pub next: Option<WorkerId>,
}

/// FIFO of workers awaiting their finalize phase.
///
/// Invariant: the head is the only worker with a finalize call outstanding.
/// New arrivals append; a matching completion pops the head and releases the
/// next.
pub struct FinalizationSequencer {
    queue: VecDeque<WorkerId>,
    /// When the current head's finalize call was scheduled.
    head_scheduled_at: Option<Instant>,
    /// Deadline for a scheduled finalize; `None` disables expiry.
    timeout: Option<Duration>,
}

impl FinalizationSequencer {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            queue: VecDeque::new(),
            head_scheduled_at: None,
            timeout,
        }
    }

    /// Record an execute-completion.
    ///
    /// Returns `Some(worker)` when the arrival became the new head and its
    /// finalize call should be scheduled now.
    pub fn arrived(&mut self, worker: WorkerId) -> Option<WorkerId> {
        self.queue.push_back(worker);
        if self.queue.len() == 1 {
            self.head_scheduled_at = Some(Instant::now());
            Some(worker)
        } else {
            None
        }
    }

    /// Record a finalize-completion.
    ///
    /// A completion matching the head pops it and returns the next head to
    /// schedule, if any. Anything else is an ordering violation and leaves
    /// the queue unmodified.
    pub fn completed(&mut self, worker: WorkerId) -> Result<Option<WorkerId>> {
        match self.queue.front().copied() {
            Some(head) if head == worker => {
                self.queue.pop_front();
                Ok(self.promote_next())
            }
            Some(head) => Err(EvqError::OrderingViolation {
                got: worker,
                expected: format!("expected worker {}", head),
            }),
            None => Err(EvqError::OrderingViolation {
                got: worker,
                expected: "no finalize call outstanding".to_string(),
            }),
        }
    }

    /// Drop a worker from the queue wherever it sits (worker died).
    ///
    /// Returns the next head to schedule if the removed worker was the head.
    pub fn remove(&mut self, worker: WorkerId) -> Option<WorkerId> {
        let was_head = self.queue.front() == Some(&worker);
        self.queue.retain(|w| *w != worker);
        if was_head { self.promote_next() } else { None }
    }

    /// Force-pop the head if its finalize call has been outstanding past the
    /// deadline.
    pub fn expire_head(&mut self) -> Option<ExpiredHead> {
        let timeout = self.timeout?;
        let head = self.queue.front().copied()?;
        let scheduled_at = self.head_scheduled_at?;
        if scheduled_at.elapsed() < timeout {
            return None;
        }
        self.queue.pop_front();
        let next = self.promote_next();
        Some(ExpiredHead {
            expired: head,
            next,
        })
    }

    fn promote_next(&mut self) -> Option<WorkerId> {
        match self.queue.front().copied() {
            Some(next) => {
                self.head_scheduled_at = Some(Instant::now());
                Some(next)
            }
            None => {
                self.head_scheduled_at = None;
                None
            }
        }
    }

    /// The worker currently permitted to finalize.
    pub fn head(&self) -> Option<WorkerId> {
        self.queue.front().copied()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequencer() -> FinalizationSequencer {
        FinalizationSequencer::new(None)
    }

    #[test]
    fn test_first_arrival_becomes_head() {
        let mut seq = sequencer();
        assert_eq!(seq.arrived(0), Some(0));
        assert_eq!(seq.head(), Some(0));
        assert_eq!(seq.len(), 1);
    }

    #[test]
    fn test_later_arrivals_wait_their_turn() {
        // Execute-completions observed in order 0, 1: finalize runs for 0
        // first, and 1 is only released once 0's completion is matched.
        let mut seq = sequencer();
        assert_eq!(seq.arrived(0), Some(0));
        assert_eq!(seq.arrived(1), None);

        assert_eq!(seq.completed(0).unwrap(), Some(1));
        assert_eq!(seq.head(), Some(1));
        assert_eq!(seq.completed(1).unwrap(), None);
        assert!(seq.is_empty());
    }

    #[test]
    fn test_completion_order_follows_observation_order() {
        let mut seq = sequencer();
        // Arrival order is completion-observation order, regardless of ids.
        assert_eq!(seq.arrived(3), Some(3));
        assert_eq!(seq.arrived(1), None);
        assert_eq!(seq.arrived(2), None);

        assert_eq!(seq.completed(3).unwrap(), Some(1));
        assert_eq!(seq.completed(1).unwrap(), Some(2));
        assert_eq!(seq.completed(2).unwrap(), None);
    }

    #[test]
    fn test_out_of_order_completion_is_rejected_and_queue_unchanged() {
        let mut seq = sequencer();
        seq.arrived(0);
        seq.arrived(1);

        let err = seq.completed(1).unwrap_err();
        match err {
            EvqError::OrderingViolation { got, .. } => assert_eq!(got, 1),
            other => panic!("expected ordering violation, got {:?}", other),
        }
        // Queue untouched: the correct completion still goes through.
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.head(), Some(0));
        assert_eq!(seq.completed(0).unwrap(), Some(1));
        assert_eq!(seq.completed(1).unwrap(), None);
    }

    #[test]
    fn test_completion_with_empty_queue_is_rejected() {
        let mut seq = sequencer();
        assert!(matches!(
            seq.completed(5),
            Err(EvqError::OrderingViolation { got: 5, .. })
        ));
    }

    #[test]
    fn test_remove_head_promotes_next() {
        let mut seq = sequencer();
        seq.arrived(0);
        seq.arrived(1);
        seq.arrived(2);

        assert_eq!(seq.remove(0), Some(1));
        assert_eq!(seq.head(), Some(1));
        // Removing a non-head entry promotes nothing.
        assert_eq!(seq.remove(2), None);
        assert_eq!(seq.len(), 1);
    }

    #[test]
    fn test_remove_absent_worker_is_noop() {
        let mut seq = sequencer();
        seq.arrived(0);
        assert_eq!(seq.remove(9), None);
        assert_eq!(seq.head(), Some(0));
    }

    #[test]
    fn test_expire_head_after_timeout() {
        let mut seq = FinalizationSequencer::new(Some(Duration::from_millis(10)));
        seq.arrived(0);
        seq.arrived(1);

        assert_eq!(seq.expire_head(), None); // not yet
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(
            seq.expire_head(),
            Some(ExpiredHead {
                expired: 0,
                next: Some(1)
            })
        );
        // The new head gets a fresh deadline.
        assert_eq!(seq.expire_head(), None);
    }

    #[test]
    fn test_expiry_disabled_without_timeout() {
        let mut seq = sequencer();
        seq.arrived(0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(seq.expire_head(), None);
    }

    #[test]
    fn test_late_completion_after_expiry_is_violation() {
        let mut seq = FinalizationSequencer::new(Some(Duration::from_millis(1)));
        seq.arrived(0);
        std::thread::sleep(Duration::from_millis(5));
        assert!(seq.expire_head().is_some());

        // Worker 0's finalize completion straggles in afterwards.
        assert!(matches!(
            seq.completed(0),
            Err(EvqError::OrderingViolation { got: 0, .. })
        ));
    }
}
