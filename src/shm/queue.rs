//! Fixed-capacity interprocess FIFO over a named shared-memory segment.
//!
//! The queue is a bounded ring of fixed-size binary records with a per-slot
//! sequence counter (Vyukov-style bounded MPMC). Any number of processes may
//! push and pop concurrently through their own mappings of the segment; a
//! popped record is removed, so each record is consumed at most once.

#![allow(dead_code)] // Occupancy accessors are for monitoring

use super::ShmRegion;
use crate::error::{EvqError, Result};
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Backoff between retries when a blocking push finds the queue full.
const PUSH_RETRY_INTERVAL: Duration = Duration::from_millis(1);

const QUEUE_MAGIC: u32 = 0x4556_5131; // "EVQ1"

/// A value that can live in a [`SharedQueue`] slot.
///
/// Records are fixed-size so slot offsets can be computed without headers
/// per record, and so a record never spans a slot boundary.
pub trait QueueRecord: Copy {
    /// Encoded size in bytes.
    const WIRE_SIZE: usize;
    /// Encode into `buf` (exactly `WIRE_SIZE` bytes).
    fn store(&self, buf: &mut [u8]);
    /// Decode from `buf` (exactly `WIRE_SIZE` bytes).
    fn load(buf: &[u8]) -> Self;
}

impl QueueRecord for u32 {
    const WIRE_SIZE: usize = 4;

    fn store(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn load(buf: &[u8]) -> Self {
        u32::from_le_bytes(buf[..4].try_into().expect("slot payload too short"))
    }
}

impl QueueRecord for u64 {
    const WIRE_SIZE: usize = 8;

    fn store(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn load(buf: &[u8]) -> Self {
        u64::from_le_bytes(buf[..8].try_into().expect("slot payload too short"))
    }
}

/// Segment layout: header, then `capacity` slots.
///
/// Each slot is `{ seq: AtomicU64, payload: [u8; stride - 8] }`. A slot's
/// sequence counter encodes whose turn it is: `seq == ticket` means free for
/// the producer holding `ticket`, `seq == ticket + 1` means filled and ready
/// for the consumer holding `ticket`, `seq == ticket + capacity` means free
/// again one lap later.
#[repr(C)]
struct QueueHeader {
    magic: u32,
    capacity: u32,
    payload_size: u32,
    _pad: u32,
    tail: AtomicU64,
    head: AtomicU64,
}

/// Fixed-capacity interprocess FIFO of fixed-size records.
pub struct SharedQueue<T: QueueRecord> {
    region: ShmRegion,
    capacity: u64,
    stride: usize,
    _marker: PhantomData<T>,
}

// Safety: all mutation of shared state goes through the atomics in the
// header and slots; payload bytes are only touched by the ticket holder
// between the corresponding seq transitions.
unsafe impl<T: QueueRecord> Send for SharedQueue<T> {}
unsafe impl<T: QueueRecord> Sync for SharedQueue<T> {}

impl<T: QueueRecord> SharedQueue<T> {
    /// Slot stride: sequence counter plus payload, kept 8-byte aligned.
    fn stride() -> usize {
        size_of::<AtomicU64>() + T::WIRE_SIZE.next_multiple_of(8)
    }

    fn segment_len(capacity: usize) -> usize {
        size_of::<QueueHeader>() + capacity * Self::stride()
    }

    /// Create a new named queue with the given capacity.
    pub fn create(name: &str, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(EvqError::Queue("queue capacity must be positive".to_string()));
        }
        let region = ShmRegion::create(name, Self::segment_len(capacity))?;
        let queue = Self {
            region,
            capacity: capacity as u64,
            stride: Self::stride(),
            _marker: PhantomData,
        };

        let header = queue.header();
        header.tail.store(0, Ordering::Relaxed);
        header.head.store(0, Ordering::Relaxed);
        for i in 0..capacity as u64 {
            queue.slot_seq(i).store(i, Ordering::Relaxed);
        }
        // Publish the layout last so attachers that see the magic see a
        // fully initialized ring.
        // Safety: header points into our exclusive, freshly created mapping.
        unsafe {
            let h = queue.region.base().as_ptr() as *mut QueueHeader;
            (*h).capacity = capacity as u32;
            (*h).payload_size = T::WIRE_SIZE as u32;
            std::ptr::addr_of_mut!((*h).magic).write_volatile(QUEUE_MAGIC);
        }
        Ok(queue)
    }

    /// Attach to an existing named queue, validating its layout.
    pub fn attach(name: &str, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(EvqError::Queue("queue capacity must be positive".to_string()));
        }
        let region = ShmRegion::attach(name, Self::segment_len(capacity))?;
        let queue = Self {
            region,
            capacity: capacity as u64,
            stride: Self::stride(),
            _marker: PhantomData,
        };

        let header = queue.header();
        if header.magic != QUEUE_MAGIC
            || header.capacity != capacity as u32
            || header.payload_size != T::WIRE_SIZE as u32
        {
            return Err(EvqError::Shm(format!(
                "segment '{}' does not hold a queue with capacity {} and record size {}",
                name,
                capacity,
                T::WIRE_SIZE
            )));
        }
        Ok(queue)
    }

    fn header(&self) -> &QueueHeader {
        // Safety: the segment is at least `segment_len` bytes and starts
        // with a QueueHeader; the mapping outlives `self`.
        unsafe { &*(self.region.base().as_ptr() as *const QueueHeader) }
    }

    fn slot_base(&self, index: u64) -> *mut u8 {
        debug_assert!(index < self.capacity);
        // Safety: index < capacity, so the offset stays inside the mapping.
        unsafe {
            (self.region.base().as_ptr() as *mut u8)
                .add(size_of::<QueueHeader>() + index as usize * self.stride)
        }
    }

    fn slot_seq(&self, index: u64) -> &AtomicU64 {
        // Safety: the first 8 bytes of each slot hold its sequence counter.
        unsafe { &*(self.slot_base(index) as *const AtomicU64) }
    }

    /// Attempt to push without blocking. Returns false if the queue is full.
    pub fn try_push(&self, value: T) -> bool {
        let header = self.header();
        let mut ticket = header.tail.load(Ordering::Relaxed);
        loop {
            let slot = ticket % self.capacity;
            let seq = self.slot_seq(slot).load(Ordering::Acquire);
            if seq == ticket {
                match header.tail.compare_exchange_weak(
                    ticket,
                    ticket + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Safety: we own this slot until the seq store below.
                        let payload = unsafe {
                            std::slice::from_raw_parts_mut(
                                self.slot_base(slot).add(size_of::<AtomicU64>()),
                                T::WIRE_SIZE,
                            )
                        };
                        value.store(payload);
                        self.slot_seq(slot).store(ticket + 1, Ordering::Release);
                        return true;
                    }
                    Err(current) => ticket = current,
                }
            } else if seq < ticket {
                // Slot still holds a record from the previous lap.
                return false;
            } else {
                ticket = header.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Push, retrying until space frees up or the deadline passes.
    pub fn push(&self, value: T, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_push(value) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EvqError::Queue(format!(
                    "queue '{}' full after {:?}",
                    self.region.name(),
                    timeout
                )));
            }
            std::thread::sleep(PUSH_RETRY_INTERVAL);
        }
    }

    /// Attempt to pop without blocking. Returns None if the queue is empty.
    pub fn try_pop(&self) -> Option<T> {
        let header = self.header();
        let mut ticket = header.head.load(Ordering::Relaxed);
        loop {
            let slot = ticket % self.capacity;
            let seq = self.slot_seq(slot).load(Ordering::Acquire);
            if seq == ticket + 1 {
                match header.head.compare_exchange_weak(
                    ticket,
                    ticket + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Safety: we own this slot until the seq store below.
                        let payload = unsafe {
                            std::slice::from_raw_parts(
                                self.slot_base(slot).add(size_of::<AtomicU64>()) as *const u8,
                                T::WIRE_SIZE,
                            )
                        };
                        let value = T::load(payload);
                        self.slot_seq(slot)
                            .store(ticket + self.capacity, Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => ticket = current,
                }
            } else if seq <= ticket {
                return None;
            } else {
                ticket = header.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Approximate number of queued records (racy under concurrent access).
    pub fn len(&self) -> usize {
        let header = self.header();
        let tail = header.tail.load(Ordering::Relaxed);
        let head = header.head.load(Ordering::Relaxed);
        tail.saturating_sub(head) as usize
    }

    /// Whether the queue currently looks empty (racy, same as [`len`]).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }
}
