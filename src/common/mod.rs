// # Common Types and Traits
//
// This module defines the shared types, traits, and collaborator interfaces
// used across all rusty-cache modules. The cache core never talks to the
// operating system directly; time, task execution, delayed scheduling,
// weighing, and expiration are all injected through the traits below so the
// engine stays deterministic under test.
//
// ## Core Concepts
//
// - **Collaborator Traits**: `Ticker`, `Executor`, `Scheduler`, `Weigher`,
//   `Expiry`, `RemovalListener` — the seams between the engine and its host
// - **Shared Types**: `RemovalCause`, `ReferenceType`, `CacheConfig`
// - **Constants**: capacity limits and policy ratios

use crate::error::{CacheError, Result};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared clock origin so caches built without an explicit ticker agree on
/// a common monotonic timeline.
static DEFAULT_TICKER: Lazy<Arc<SystemTicker>> = Lazy::new(|| Arc::new(SystemTicker::new()));

// ============================================================================
// Constants
// ============================================================================

/// Fraction of the total capacity dedicated to the main space.
pub const PERCENT_MAIN: f64 = 0.99;

/// Fraction of the main space dedicated to the protected region.
pub const PERCENT_MAIN_PROTECTED: f64 = 0.80;

/// Maximum weighted capacity of a cache.
pub const MAXIMUM_CAPACITY: u64 = i64::MAX as u64;

/// Duration within which a repeated write to the same entry is coalesced
/// into a read for buffering purposes (1 second, in nanoseconds).
pub const EXPIRE_WRITE_TOLERANCE: u64 = 1_000_000_000;

// ============================================================================
// Removal Cause
// ============================================================================

/// The reason an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalCause {
    /// The entry was manually removed by the user.
    Explicit,
    /// The entry's value was replaced by the user.
    Replaced,
    /// The entry's value reference was cleared by the collector.
    Collected,
    /// The entry's expiration deadline passed.
    Expired,
    /// The entry was evicted to satisfy the capacity bound.
    Size,
}

impl RemovalCause {
    /// Whether the removal was automatic rather than user initiated.
    #[inline]
    pub fn was_evicted(&self) -> bool {
        matches!(
            self,
            RemovalCause::Collected | RemovalCause::Expired | RemovalCause::Size
        )
    }
}

// ============================================================================
// Reference Type
// ============================================================================

/// How the cache holds entry values.
///
/// `Weak` values are held through `std::sync::Weak`; the entry is observed
/// as absent once the last external strong reference drops, and the next
/// maintenance pass removes it with cause [`RemovalCause::Collected`].
/// `Soft` has no Rust analogue and is held strongly; it is accepted so
/// configurations can be ported without edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceType {
    Strong,
    Weak,
    Soft,
}

// ============================================================================
// Ticker
// ============================================================================

/// A monotonic nanosecond clock.
pub trait Ticker: Send + Sync + 'static {
    /// Current reading, in nanoseconds from an arbitrary origin.
    fn read(&self) -> u64;
}

/// Ticker backed by `std::time::Instant`.
pub struct SystemTicker {
    origin: Instant,
}

impl SystemTicker {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker for SystemTicker {
    #[inline]
    fn read(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

// ============================================================================
// Executor
// ============================================================================

/// A deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Executes maintenance and listener tasks on behalf of the cache.
///
/// An executor may reject a task; the cache then degrades to running the
/// work synchronously on the calling thread, so rejection is never fatal.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, task: Task) -> Result<()>;
}

/// Runs every task inline on the calling thread.
pub struct DirectExecutor;

impl Executor for DirectExecutor {
    fn execute(&self, task: Task) -> Result<()> {
        task();
        Ok(())
    }
}

/// Spawns a short-lived thread per task.
pub struct ThreadSpawnExecutor;

impl Executor for ThreadSpawnExecutor {
    fn execute(&self, task: Task) -> Result<()> {
        std::thread::Builder::new()
            .name("rusty-cache-task".into())
            .spawn(task)
            .map(|_| ())
            .map_err(|e| CacheError::ExecutorRejected(e.to_string()))
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Handle to a scheduled, cancelable task.
pub trait ScheduledHandle: Send + Sync + 'static {
    /// Request that the task not run. Best effort; a task already started
    /// is not interrupted.
    fn cancel(&self);

    /// Whether the task has run or been cancelled.
    fn is_done(&self) -> bool;
}

/// Schedules a task to run after a delay.
pub trait Scheduler: Send + Sync + 'static {
    fn schedule(&self, delay: Duration, task: Task) -> Arc<dyn ScheduledHandle>;
}

struct ThreadScheduledHandle {
    cancelled: AtomicBool,
    done: AtomicBool,
}

impl ScheduledHandle for ThreadScheduledHandle {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire)
    }
}

/// Scheduler that parks a dedicated thread until the deadline.
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> Arc<dyn ScheduledHandle> {
        let handle = Arc::new(ThreadScheduledHandle {
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
        });
        let thread_handle = Arc::clone(&handle);
        let spawned = std::thread::Builder::new()
            .name("rusty-cache-pacer".into())
            .spawn(move || {
                std::thread::sleep(delay);
                if !thread_handle.cancelled.load(Ordering::Acquire) {
                    task();
                }
                thread_handle.done.store(true, Ordering::Release);
            });
        if spawned.is_err() {
            handle.done.store(true, Ordering::Release);
        }
        handle
    }
}

// ============================================================================
// Weigher
// ============================================================================

/// Computes the weight of an entry at insertion and update time.
pub trait Weigher<K, V>: Send + Sync + 'static {
    fn weigh(&self, key: &K, value: &V) -> u32;
}

/// Weighs every entry as one unit.
pub struct UnitWeigher;

impl<K, V> Weigher<K, V> for UnitWeigher {
    #[inline]
    fn weigh(&self, _key: &K, _value: &V) -> u32 {
        1
    }
}

impl<K, V, F> Weigher<K, V> for F
where
    F: Fn(&K, &V) -> u32 + Send + Sync + 'static,
{
    #[inline]
    fn weigh(&self, key: &K, value: &V) -> u32 {
        self(key, value)
    }
}

// ============================================================================
// Expiry
// ============================================================================

/// Per-entry variable expiration policy.
///
/// Each hook returns the entry's remaining lifetime in nanoseconds;
/// `current` is the previously remaining lifetime. Returning `u64::MAX`
/// keeps the entry effectively immortal.
pub trait Expiry<K, V>: Send + Sync + 'static {
    fn expire_after_create(&self, key: &K, value: &V, now: u64) -> u64;

    fn expire_after_update(&self, key: &K, value: &V, now: u64, current: u64) -> u64 {
        let _ = (key, value, now);
        current
    }

    fn expire_after_read(&self, key: &K, value: &V, now: u64, current: u64) -> u64 {
        let _ = (key, value, now);
        current
    }
}

// ============================================================================
// Removal Listener
// ============================================================================

/// Observes entries leaving the cache.
///
/// The value is `None` when the entry's weak reference was cleared before
/// the notification was assembled.
pub trait RemovalListener<K, V>: Send + Sync + 'static {
    fn on_removal(&self, key: &K, value: Option<Arc<V>>, cause: RemovalCause);
}

impl<K, V, F> RemovalListener<K, V> for F
where
    F: Fn(&K, Option<Arc<V>>, RemovalCause) + Send + Sync + 'static,
{
    fn on_removal(&self, key: &K, value: Option<Arc<V>>, cause: RemovalCause) {
        self(key, value, cause)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Cache configuration.
///
/// Collaborators default to in-process implementations (`SystemTicker`,
/// `DirectExecutor`, unit weights) so a cache is usable without wiring
/// every trait.
pub struct CacheConfig<K, V> {
    /// Weighted capacity bound, or `None` for an unbounded cache.
    pub maximum: Option<u64>,
    /// Sizing hint for the backing map.
    pub initial_capacity: usize,
    /// How values are held.
    pub value_reference: ReferenceType,
    /// Fixed time-to-idle, measured from the last access.
    pub expire_after_access: Option<Duration>,
    /// Fixed time-to-live, measured from the last write.
    pub expire_after_write: Option<Duration>,
    /// Per-entry variable expiration policy.
    pub expiry: Option<Arc<dyn Expiry<K, V>>>,
    /// Entry weigher; defaults to unit weights.
    pub weigher: Arc<dyn Weigher<K, V>>,
    /// Monotonic clock source.
    pub ticker: Arc<dyn Ticker>,
    /// Executor for maintenance and removal notifications.
    pub executor: Arc<dyn Executor>,
    /// Optional scheduler driving the cleanup pacer.
    pub scheduler: Option<Arc<dyn Scheduler>>,
    /// Invoked synchronously, under the eviction mutex, on eviction.
    pub eviction_listener: Option<Arc<dyn RemovalListener<K, V>>>,
    /// Invoked asynchronously, via the executor, on any removal.
    pub removal_listener: Option<Arc<dyn RemovalListener<K, V>>>,
}

impl<K, V> CacheConfig<K, V> {
    pub fn new() -> Self {
        Self {
            maximum: None,
            initial_capacity: 16,
            value_reference: ReferenceType::Strong,
            expire_after_access: None,
            expire_after_write: None,
            expiry: None,
            weigher: Arc::new(UnitWeigher),
            ticker: Arc::clone(&*DEFAULT_TICKER) as Arc<dyn Ticker>,
            executor: Arc::new(DirectExecutor),
            scheduler: None,
            eviction_listener: None,
            removal_listener: None,
        }
    }

    pub fn maximum(mut self, maximum: u64) -> Self {
        self.maximum = Some(maximum);
        self
    }

    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    pub fn value_reference(mut self, reference: ReferenceType) -> Self {
        self.value_reference = reference;
        self
    }

    pub fn expire_after_access(mut self, duration: Duration) -> Self {
        self.expire_after_access = Some(duration);
        self
    }

    pub fn expire_after_write(mut self, duration: Duration) -> Self {
        self.expire_after_write = Some(duration);
        self
    }

    pub fn expiry(mut self, expiry: Arc<dyn Expiry<K, V>>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn weigher(mut self, weigher: Arc<dyn Weigher<K, V>>) -> Self {
        self.weigher = weigher;
        self
    }

    pub fn ticker(mut self, ticker: Arc<dyn Ticker>) -> Self {
        self.ticker = ticker;
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn eviction_listener(mut self, listener: Arc<dyn RemovalListener<K, V>>) -> Self {
        self.eviction_listener = Some(listener);
        self
    }

    pub fn removal_listener(mut self, listener: Arc<dyn RemovalListener<K, V>>) -> Self {
        self.removal_listener = Some(listener);
        self
    }

    /// Validate the configuration before constructing a cache.
    pub fn validate(&self) -> Result<()> {
        if let Some(maximum) = self.maximum {
            if maximum > MAXIMUM_CAPACITY {
                return Err(CacheError::Configuration(format!(
                    "maximum {} exceeds capacity limit {}",
                    maximum, MAXIMUM_CAPACITY
                )));
            }
        }
        if let Some(duration) = self.expire_after_access {
            if duration.is_zero() {
                return Err(CacheError::Configuration(
                    "expire_after_access must be positive".into(),
                ));
            }
        }
        if let Some(duration) = self.expire_after_write {
            if duration.is_zero() {
                return Err(CacheError::Configuration(
                    "expire_after_write must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

impl<K, V> Default for CacheConfig<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Clone for CacheConfig<K, V> {
    fn clone(&self) -> Self {
        Self {
            maximum: self.maximum,
            initial_capacity: self.initial_capacity,
            value_reference: self.value_reference,
            expire_after_access: self.expire_after_access,
            expire_after_write: self.expire_after_write,
            expiry: self.expiry.clone(),
            weigher: Arc::clone(&self.weigher),
            ticker: Arc::clone(&self.ticker),
            executor: Arc::clone(&self.executor),
            scheduler: self.scheduler.clone(),
            eviction_listener: self.eviction_listener.clone(),
            removal_listener: self.removal_listener.clone(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removal_cause_classification() {
        assert!(RemovalCause::Size.was_evicted());
        assert!(RemovalCause::Expired.was_evicted());
        assert!(RemovalCause::Collected.was_evicted());
        assert!(!RemovalCause::Explicit.was_evicted());
        assert!(!RemovalCause::Replaced.was_evicted());
    }

    #[test]
    fn test_system_ticker_monotonic() {
        let ticker = SystemTicker::new();
        let a = ticker.read();
        let b = ticker.read();
        assert!(b >= a);
    }

    #[test]
    fn test_direct_executor_runs_inline() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        DirectExecutor
            .execute(Box::new(move || flag.store(true, Ordering::Release)))
            .unwrap();
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn test_config_validation() {
        let config: CacheConfig<u32, u32> = CacheConfig::new().maximum(100);
        assert!(config.validate().is_ok());

        let config: CacheConfig<u32, u32> =
            CacheConfig::new().expire_after_write(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unit_weigher() {
        let weigher = UnitWeigher;
        assert_eq!(<UnitWeigher as Weigher<u32, u32>>::weigh(&weigher, &1, &2), 1);
    }
}
