// # Event Buffers - Batching for the Hot Path
//
// Read and write events are not applied to the policy inline; they are
// published to per-cache buffers and batched into the policy by the drain.
// Two buffers with different loss contracts:
//
// - **ReadBuffer**: a lossy, fixed-size, multi-producer/single-consumer
//   ring. Dropping a read event only costs recency fidelity, so producers
//   never retry: a full ring or a lost slot race reports failure and moves
//   on.
// - **WriteBuffer**: a lossless bounded MPSC queue. Write events carry
//   state changes that must be applied, so a producer that cannot enqueue
//   runs maintenance itself until space frees.
//
// ## Memory Ordering
//
// Head and tail use release/acquire pairs so the single consumer observes
// fully initialized slots; everything else is relaxed.

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome of publishing to the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferResult {
    /// The event was recorded.
    Success,
    /// The ring is full; the event was dropped.
    Full,
    /// A producer race was lost; the event was dropped.
    Failed,
}

// ============================================================================
// Read Buffer - Lossy MPSC Ring
// ============================================================================

/// Lossy bounded ring for read events.
///
/// Producers claim a slot with a single compare-exchange on the tail; a
/// lost race is reported as `Failed` rather than retried, keeping the read
/// path wait-free. The sole consumer drains under the eviction mutex.
pub struct ReadBuffer<T> {
    slots: Box<[Mutex<Option<T>>]>,
    head: AtomicU64,
    tail: AtomicU64,
    mask: u64,
    capacity: u64,
}

impl<T> ReadBuffer<T> {
    /// Creates a ring with the capacity rounded up to a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| Mutex::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            mask: (capacity - 1) as u64,
            capacity: capacity as u64,
        }
    }

    /// Default capacity heuristic: a small power of two scaled by the
    /// number of logical CPUs.
    pub fn default_capacity() -> usize {
        16 * num_cpus::get().next_power_of_two()
    }

    /// Publishes a read event. Never blocks and never retries.
    pub fn offer(&self, item: T) -> OfferResult {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        if tail.wrapping_sub(head) >= self.capacity {
            return OfferResult::Full;
        }
        if self
            .tail
            .compare_exchange(tail, tail + 1, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            return OfferResult::Failed;
        }
        let slot = &self.slots[(tail & self.mask) as usize];
        *slot.lock() = Some(item);
        OfferResult::Success
    }

    /// Consumes every published event. Single-consumer; callers must hold
    /// the eviction mutex.
    pub fn drain(&self, mut consume: impl FnMut(T)) {
        let tail = self.tail.load(Ordering::Acquire);
        let mut head = self.head.load(Ordering::Relaxed);
        while head != tail {
            let slot = &self.slots[(head & self.mask) as usize];
            let item = slot.lock().take();
            head = head.wrapping_add(1);
            self.head.store(head, Ordering::Release);
            // A None slot means the producer claimed the index but has not
            // yet stored; the event is dropped, which the lossy contract
            // permits.
            if let Some(item) = item {
                consume(item);
            }
        }
    }

    /// Total events consumed.
    #[inline]
    pub fn reads(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Total events published.
    #[inline]
    pub fn writes(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    /// Published-but-unconsumed event count.
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Write Buffer - Lossless Bounded MPSC Queue
// ============================================================================

/// Lossless bounded queue for deferred write tasks.
pub struct WriteBuffer<T> {
    queue: ArrayQueue<T>,
    produced: AtomicU64,
}

impl<T> WriteBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(4)),
            produced: AtomicU64::new(0),
        }
    }

    /// Default capacity heuristic, sized generously so producers rarely
    /// have to run maintenance themselves.
    pub fn default_capacity() -> usize {
        128 * num_cpus::get().next_power_of_two()
    }

    /// Enqueues a task, handing it back if the queue is full.
    pub fn try_push(&self, task: T) -> Result<(), T> {
        match self.queue.push(task) {
            Ok(()) => {
                self.produced.fetch_add(1, Ordering::Release);
                Ok(())
            }
            Err(task) => Err(task),
        }
    }

    /// Dequeues the next task, if any.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Total tasks successfully enqueued over the buffer's lifetime.
    #[inline]
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Acquire)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_read_buffer_offer_and_drain() {
        let buffer = ReadBuffer::with_capacity(8);
        assert_eq!(buffer.offer(1u32), OfferResult::Success);
        assert_eq!(buffer.offer(2), OfferResult::Success);
        assert_eq!(buffer.len(), 2);

        let mut drained = Vec::new();
        buffer.drain(|item| drained.push(item));
        assert_eq!(drained, vec![1, 2]);
        assert_eq!(buffer.reads(), buffer.writes());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_read_buffer_reports_full() {
        let buffer = ReadBuffer::with_capacity(4);
        for i in 0..4u32 {
            assert_eq!(buffer.offer(i), OfferResult::Success);
        }
        assert_eq!(buffer.offer(99), OfferResult::Full);

        buffer.drain(|_| {});
        assert_eq!(buffer.offer(100), OfferResult::Success);
    }

    #[test]
    fn test_read_buffer_capacity_rounds_up() {
        let buffer = ReadBuffer::<u32>::with_capacity(5);
        assert_eq!(buffer.capacity, 8);
    }

    #[test]
    fn test_read_buffer_concurrent_producers() {
        let buffer = Arc::new(ReadBuffer::with_capacity(1024));
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let buffer = Arc::clone(&buffer);
            handles.push(std::thread::spawn(move || {
                let mut published = 0u64;
                for i in 0..100 {
                    if buffer.offer(t * 1000 + i) == OfferResult::Success {
                        published += 1;
                    }
                }
                published
            }));
        }
        let published: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(buffer.writes(), published);

        let mut count = 0u64;
        buffer.drain(|_| count += 1);
        assert_eq!(count, published);
    }

    #[test]
    fn test_write_buffer_is_lossless_until_full() {
        let buffer = WriteBuffer::with_capacity(4);
        for i in 0..4u32 {
            assert!(buffer.try_push(i).is_ok());
        }
        assert_eq!(buffer.try_push(99), Err(99));
        assert_eq!(buffer.produced(), 4);

        assert_eq!(buffer.pop(), Some(0));
        assert!(buffer.try_push(99).is_ok());
        assert_eq!(buffer.produced(), 5);
    }
}
