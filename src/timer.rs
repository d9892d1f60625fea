// # Timer Wheel - Hierarchical Expiration Scheduling
//
// A hashed hierarchical timer wheel for variable per-entry expiration.
// Five wheels with power-of-two spans cover deadlines from roughly one
// second to several days; anything beyond the last span lands in a single
// overflow bucket. Scheduling, descheduling, and rescheduling are O(1);
// advancing cascades entries down a level until they expire in the lowest
// wheel.
//
// Buckets are doubly-linked chains over a shared vector arena, the same
// technique the order deques use. Entries report their arena slot back
// through `WheelEntry` so the owner can deschedule without a search.
//
// The wheel is only touched while holding the eviction mutex.

use crate::deque::NIL;

/// Number of buckets per wheel level.
const BUCKETS: [usize; 5] = [64, 64, 32, 4, 1];

/// Bit shift turning nanoseconds into a level's tick count. The spans are
/// the power-of-two ceilings of 1.07s, 1.14m, 1.22h, 1.63d, and 6.5d.
const SHIFT: [u32; 5] = [30, 36, 42, 47, 49];

/// Span of one bucket per level, in nanoseconds.
const SPANS: [u64; 5] = [1 << 30, 1 << 36, 1 << 42, 1 << 47, 1 << 49];

/// An entry that remembers where the wheel stored it.
pub trait WheelEntry {
    fn timer_slot(&self) -> u32;
    fn set_timer_slot(&self, slot: u32);
}

struct WheelSlot<T> {
    item: Option<T>,
    deadline: u64,
    prev: u32,
    next: u32,
}

#[derive(Clone, Copy)]
struct Bucket {
    head: u32,
    tail: u32,
}

impl Bucket {
    const EMPTY: Bucket = Bucket {
        head: NIL,
        tail: NIL,
    };
}

/// Hierarchical timer wheel.
pub struct TimerWheel<T: WheelEntry> {
    wheels: Vec<Vec<Bucket>>,
    slots: Vec<WheelSlot<T>>,
    free: Vec<u32>,
    nanos: u64,
    len: usize,
}

impl<T: WheelEntry> TimerWheel<T> {
    pub fn new() -> Self {
        Self {
            wheels: BUCKETS
                .iter()
                .map(|&count| vec![Bucket::EMPTY; count])
                .collect(),
            slots: Vec::new(),
            free: Vec::new(),
            nanos: 0,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current time as of the last `advance`.
    #[inline]
    pub fn nanos(&self) -> u64 {
        self.nanos
    }

    /// Level and bucket index for a deadline, relative to the wheel's
    /// current time.
    fn find_bucket(&self, deadline: u64) -> (usize, usize) {
        let duration = deadline.saturating_sub(self.nanos);
        for level in 0..4 {
            if duration < SPANS[level + 1] {
                let ticks = deadline >> SHIFT[level];
                let index = (ticks as usize) & (BUCKETS[level] - 1);
                return (level, index);
            }
        }
        (4, 0)
    }

    /// Inserts an entry with an absolute deadline and records the slot on
    /// the entry.
    pub fn schedule(&mut self, item: T, deadline: u64) -> u32 {
        let (level, index) = self.find_bucket(deadline);
        let slot = match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot as usize];
                entry.item = Some(item);
                entry.deadline = deadline;
                entry.prev = NIL;
                entry.next = NIL;
                slot
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(WheelSlot {
                    item: Some(item),
                    deadline,
                    prev: NIL,
                    next: NIL,
                });
                slot
            }
        };

        let bucket = &mut self.wheels[level][index];
        if bucket.tail == NIL {
            bucket.head = slot;
        } else {
            let tail = bucket.tail;
            self.slots[tail as usize].next = slot;
            self.slots[slot as usize].prev = tail;
        }
        self.wheels[level][index].tail = slot;

        if let Some(item) = self.slots[slot as usize].item.as_ref() {
            item.set_timer_slot(slot);
        }
        self.len += 1;
        slot
    }

    /// Removes an entry by slot, clearing the slot recorded on it.
    pub fn deschedule(&mut self, slot: u32) -> Option<T> {
        let index = slot as usize;
        if index >= self.slots.len() || self.slots[index].item.is_none() {
            return None;
        }
        let deadline = self.slots[index].deadline;
        let (level, bucket_index) = self.locate_bucket(slot, deadline);
        self.unlink(level, bucket_index, slot);

        let item = self.slots[index].item.take();
        self.free.push(slot);
        self.len -= 1;
        if let Some(item) = item.as_ref() {
            item.set_timer_slot(NIL);
        }
        item
    }

    /// Moves an entry to a new deadline. The entry may land in a different
    /// slot; the new slot is recorded on it.
    pub fn reschedule(&mut self, slot: u32, deadline: u64) {
        if let Some(item) = self.deschedule(slot) {
            self.schedule(item, deadline);
        }
    }

    /// Advances the wheel to `now`, expiring every entry whose deadline
    /// has passed and cascading the rest toward the lowest level.
    pub fn advance(&mut self, now: u64, mut on_expire: impl FnMut(T)) {
        let previous = self.nanos;
        if now <= previous {
            return;
        }
        self.nanos = now;

        for level in 0..5 {
            let prev_ticks = previous >> SHIFT[level];
            let current_ticks = now >> SHIFT[level];
            let delta = current_ticks - prev_ticks;
            if delta == 0 {
                break;
            }
            let mask = BUCKETS[level] - 1;
            let steps = (delta + 1).min(BUCKETS[level] as u64);
            for i in 0..steps {
                let bucket_index = ((prev_ticks + i) as usize) & mask;
                self.drain_bucket(level, bucket_index, now, &mut on_expire);
            }
        }
    }

    /// Earliest pending deadline, if any.
    pub fn next_expiration(&self) -> Option<u64> {
        let mut earliest: Option<u64> = None;
        for level in 0..5 {
            let mask = BUCKETS[level] - 1;
            let current = (self.nanos >> SHIFT[level]) as usize;
            for i in 0..BUCKETS[level] {
                let bucket = self.wheels[level][(current + i) & mask];
                if bucket.head == NIL {
                    continue;
                }
                let mut cursor = bucket.head;
                while cursor != NIL {
                    let slot = &self.slots[cursor as usize];
                    if slot.item.is_some() {
                        earliest = Some(match earliest {
                            Some(current) => current.min(slot.deadline),
                            None => slot.deadline,
                        });
                    }
                    cursor = slot.next;
                }
                break;
            }
        }
        earliest
    }

    /// Drops every pending entry and resets the wheel clock.
    pub fn clear(&mut self) {
        for wheel in self.wheels.iter_mut() {
            for bucket in wheel.iter_mut() {
                *bucket = Bucket::EMPTY;
            }
        }
        for slot in self.slots.iter_mut() {
            if let Some(item) = slot.item.take() {
                item.set_timer_slot(NIL);
            }
        }
        self.slots.clear();
        self.free.clear();
        self.len = 0;
    }

    /// Detaches a bucket's chain and redistributes it: expired entries are
    /// reported, the rest are rescheduled relative to the new time.
    fn drain_bucket(
        &mut self,
        level: usize,
        bucket_index: usize,
        now: u64,
        on_expire: &mut impl FnMut(T),
    ) {
        let mut cursor = self.wheels[level][bucket_index].head;
        self.wheels[level][bucket_index] = Bucket::EMPTY;

        while cursor != NIL {
            let next = self.slots[cursor as usize].next;
            let deadline = self.slots[cursor as usize].deadline;
            let item = self.slots[cursor as usize].item.take();
            self.slots[cursor as usize].prev = NIL;
            self.slots[cursor as usize].next = NIL;
            self.free.push(cursor);
            self.len -= 1;

            if let Some(item) = item {
                if deadline <= now {
                    item.set_timer_slot(NIL);
                    on_expire(item);
                } else {
                    self.schedule(item, deadline);
                }
            }
            cursor = next;
        }
    }

    /// Level and bucket that currently chain the slot. The bucket is
    /// recomputed from the stored deadline; when the wheel has advanced
    /// past the entry's original position the chain is found by search.
    fn locate_bucket(&self, slot: u32, deadline: u64) -> (usize, usize) {
        let (level, index) = self.find_bucket(deadline);
        if self.chain_contains(level, index, slot) {
            return (level, index);
        }
        for level in 0..5 {
            for index in 0..BUCKETS[level] {
                if self.chain_contains(level, index, slot) {
                    return (level, index);
                }
            }
        }
        (level, index)
    }

    fn chain_contains(&self, level: usize, index: usize, slot: u32) -> bool {
        let mut cursor = self.wheels[level][index].head;
        while cursor != NIL {
            if cursor == slot {
                return true;
            }
            cursor = self.slots[cursor as usize].next;
        }
        false
    }

    fn unlink(&mut self, level: usize, bucket_index: usize, slot: u32) {
        let prev = self.slots[slot as usize].prev;
        let next = self.slots[slot as usize].next;

        if prev == NIL {
            self.wheels[level][bucket_index].head = next;
        } else {
            self.slots[prev as usize].next = next;
        }
        if next == NIL {
            self.wheels[level][bucket_index].tail = prev;
        } else {
            self.slots[next as usize].prev = prev;
        }
        self.slots[slot as usize].prev = NIL;
        self.slots[slot as usize].next = NIL;
    }
}

impl<T: WheelEntry> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct TestEntry {
        id: u32,
        slot: AtomicU32,
    }

    fn entry(id: u32) -> Arc<TestEntry> {
        Arc::new(TestEntry {
            id,
            slot: AtomicU32::new(NIL),
        })
    }

    impl WheelEntry for Arc<TestEntry> {
        fn timer_slot(&self) -> u32 {
            self.slot.load(Ordering::Acquire)
        }

        fn set_timer_slot(&self, slot: u32) {
            self.slot.store(slot, Ordering::Release);
        }
    }

    const SECOND: u64 = 1_000_000_000;

    #[test]
    fn test_schedule_and_expire() {
        let mut wheel = TimerWheel::new();
        let e = entry(1);
        wheel.schedule(Arc::clone(&e), 2 * SECOND);
        assert_eq!(wheel.len(), 1);
        assert_ne!(e.timer_slot(), NIL);

        let mut expired = Vec::new();
        wheel.advance(3 * SECOND, |item: Arc<TestEntry>| expired.push(item.id));
        assert_eq!(expired, vec![1]);
        assert_eq!(e.timer_slot(), NIL);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_future_deadline_survives_advance() {
        let mut wheel = TimerWheel::new();
        let e = entry(1);
        wheel.schedule(Arc::clone(&e), 90 * SECOND);

        let mut expired = Vec::new();
        wheel.advance(3 * SECOND, |item: Arc<TestEntry>| expired.push(item.id));
        assert!(expired.is_empty());
        assert_eq!(wheel.len(), 1);

        wheel.advance(120 * SECOND, |item: Arc<TestEntry>| expired.push(item.id));
        assert_eq!(expired, vec![1]);
    }

    #[test]
    fn test_cascade_from_higher_level() {
        let mut wheel = TimerWheel::new();
        // Lands in the minutes wheel, expires only after a cascade.
        let e = entry(7);
        wheel.schedule(Arc::clone(&e), 5 * 60 * SECOND);

        let mut expired = Vec::new();
        wheel.advance(4 * 60 * SECOND, |item: Arc<TestEntry>| {
            expired.push(item.id)
        });
        assert!(expired.is_empty());

        wheel.advance(6 * 60 * SECOND, |item: Arc<TestEntry>| {
            expired.push(item.id)
        });
        assert_eq!(expired, vec![7]);
    }

    #[test]
    fn test_deschedule() {
        let mut wheel = TimerWheel::new();
        let e = entry(1);
        let slot = wheel.schedule(Arc::clone(&e), 2 * SECOND);

        let removed = wheel.deschedule(slot);
        assert!(removed.is_some());
        assert_eq!(e.timer_slot(), NIL);

        let mut expired = Vec::new();
        wheel.advance(10 * SECOND, |item: Arc<TestEntry>| expired.push(item.id));
        assert!(expired.is_empty());
    }

    #[test]
    fn test_reschedule_moves_deadline() {
        let mut wheel = TimerWheel::new();
        let e = entry(1);
        let slot = wheel.schedule(Arc::clone(&e), 2 * SECOND);
        wheel.reschedule(slot, 60 * SECOND);

        let mut expired = Vec::new();
        wheel.advance(5 * SECOND, |item: Arc<TestEntry>| expired.push(item.id));
        assert!(expired.is_empty());
        assert_eq!(wheel.len(), 1);
    }

    #[test]
    fn test_next_expiration() {
        let mut wheel = TimerWheel::new();
        assert_eq!(wheel.next_expiration(), None);

        wheel.schedule(entry(1), 90 * SECOND);
        wheel.schedule(entry(2), 2 * SECOND);
        let next = wheel.next_expiration().unwrap();
        assert_eq!(next, 2 * SECOND);
    }

    #[test]
    fn test_clear() {
        let mut wheel = TimerWheel::new();
        let e = entry(1);
        wheel.schedule(Arc::clone(&e), 2 * SECOND);
        wheel.clear();
        assert!(wheel.is_empty());
        assert_eq!(e.timer_slot(), NIL);
        assert_eq!(wheel.next_expiration(), None);
    }
}
