// # Pacer - Coalesced Cleanup Scheduling
//
// Coordinates the delayed maintenance wake-up on an external `Scheduler`.
// Reschedules are coalesced: a request whose fire time lands within the
// tolerance of the already-pending one is skipped, so a busy cache does not
// churn the scheduler. The pacer is owned by the policy state and only
// touched under the eviction mutex.

use crate::common::{ScheduledHandle, Scheduler, Task};
use std::sync::Arc;
use std::time::Duration;

/// Scheduling slack, a power-of-two close to one second.
pub const TOLERANCE: u64 = 1 << 30;

/// Coalescing coordinator for the scheduled cleanup task.
pub struct Pacer {
    next_fire_time: u64,
    future: Option<Arc<dyn ScheduledHandle>>,
}

impl Pacer {
    pub fn new() -> Self {
        Self {
            next_fire_time: 0,
            future: None,
        }
    }

    /// Whether a cleanup is currently scheduled.
    #[inline]
    pub fn is_scheduled(&self) -> bool {
        self.future.is_some()
    }

    /// Fire time of the pending cleanup, or 0 when none is scheduled.
    #[inline]
    pub fn next_fire_time(&self) -> u64 {
        self.next_fire_time
    }

    /// Schedules the cleanup task to fire `delay` nanoseconds from `now`,
    /// unless a pending fire time is already within the tolerance. The
    /// delay is floored at the tolerance so rapid-fire deadlines coalesce.
    pub fn schedule(&mut self, scheduler: &dyn Scheduler, now: u64, delay: u64, task: Task) {
        let schedule_at = now.saturating_add(delay.max(TOLERANCE));
        if let Some(future) = &self.future {
            if !future.is_done() && self.next_fire_time.abs_diff(schedule_at) <= TOLERANCE {
                return;
            }
            future.cancel();
        }
        self.next_fire_time = schedule_at;
        let wait = Duration::from_nanos(schedule_at - now);
        self.future = Some(scheduler.schedule(wait, task));
    }

    /// Cancels any pending cleanup and clears the fire time.
    pub fn cancel(&mut self) {
        if let Some(future) = self.future.take() {
            future.cancel();
        }
        self.next_fire_time = 0;
    }
}

impl Default for Pacer {
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
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandle {
        cancelled: AtomicBool,
    }

    impl ScheduledHandle for RecordingHandle {
        fn cancel(&self) {
            self.cancelled.store(true, Ordering::Release);
        }

        fn is_done(&self) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct RecordingScheduler {
        scheduled: AtomicUsize,
        handles: Mutex<Vec<Arc<RecordingHandle>>>,
    }

    impl Scheduler for Arc<RecordingScheduler> {
        fn schedule(&self, _delay: Duration, _task: Task) -> Arc<dyn ScheduledHandle> {
            self.scheduled.fetch_add(1, Ordering::Release);
            let handle = Arc::new(RecordingHandle::default());
            self.handles.lock().unwrap().push(Arc::clone(&handle));
            handle
        }
    }

    fn noop() -> Task {
        Box::new(|| {})
    }

    #[test]
    fn test_schedule_floors_delay_at_tolerance() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut pacer = Pacer::new();

        pacer.schedule(&scheduler, 0, 1, noop());
        assert!(pacer.is_scheduled());
        assert_eq!(pacer.next_fire_time(), TOLERANCE);
    }

    #[test]
    fn test_reschedule_within_tolerance_is_skipped() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut pacer = Pacer::new();

        pacer.schedule(&scheduler, 0, 10 * TOLERANCE, noop());
        pacer.schedule(&scheduler, 0, 10 * TOLERANCE + 1, noop());
        assert_eq!(scheduler.scheduled.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_reschedule_outside_tolerance_cancels_and_replaces() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut pacer = Pacer::new();

        pacer.schedule(&scheduler, 0, 10 * TOLERANCE, noop());
        pacer.schedule(&scheduler, 0, 2 * TOLERANCE, noop());
        assert_eq!(scheduler.scheduled.load(Ordering::Acquire), 2);

        let handles = scheduler.handles.lock().unwrap();
        assert!(handles[0].cancelled.load(Ordering::Acquire));
        assert!(!handles[1].cancelled.load(Ordering::Acquire));
        assert_eq!(pacer.next_fire_time(), 2 * TOLERANCE);
    }

    #[test]
    fn test_cancel_resets_fire_time() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let mut pacer = Pacer::new();

        pacer.schedule(&scheduler, 0, 5 * TOLERANCE, noop());
        pacer.cancel();
        assert!(!pacer.is_scheduled());
        assert_eq!(pacer.next_fire_time(), 0);

        let handles = scheduler.handles.lock().unwrap();
        assert!(handles[0].cancelled.load(Ordering::Acquire));
    }
}
