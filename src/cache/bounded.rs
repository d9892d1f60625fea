// # Bounded Cache - Concurrent W-TinyLFU Engine
//
// The cache engine: a concurrent data map paired with policy state behind a
// single eviction mutex. Hot paths (get, put, remove, compute) touch only
// the map, the node monitors, and the event buffers; all policy mutation is
// batched into the single-writer maintenance pass.
//
// ## Coordination
//
// The drain-status word and the eviction mutex are the cache's only global
// coordination point. Read events land in a lossy ring; write events in a
// lossless bounded queue. Either kind of signal may advance the status
// machine (Idle, Required, ProcessingToIdle, ProcessingToRequired); a
// maintenance task is submitted to the executor only on the transitions
// that leave the idle family. The mutex serialises the maintenance body no
// matter how many submissions race.
//
// ## Maintenance order
//
// drain reads -> drain writes -> collect cleared references -> expire ->
// evict to capacity -> climb -> reschedule the pacer -> resolve status.

use crate::buffer::{OfferResult, ReadBuffer, WriteBuffer};
use crate::cache::node::{Node, NodeState, Region, ValueHolder};
use crate::cache::policy::PolicyState;
use crate::common::{
    CacheConfig, Executor, Expiry, ReferenceType, RemovalCause, RemovalListener, Scheduler, Task,
    Ticker, Weigher, EXPIRE_WRITE_TOLERANCE, MAXIMUM_CAPACITY,
};
use crate::deque::NIL;
use crate::error::Result;
use crate::stats::{CacheStatistics, CacheStats};
use crate::timer::WheelEntry;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// Drain status states.
const IDLE: u8 = 0;
const REQUIRED: u8 = 1;
const PROCESSING_TO_IDLE: u8 = 2;
const PROCESSING_TO_REQUIRED: u8 = 3;

/// Sentinel for a disabled fixed expiration.
const DISABLED_EXPIRY: u64 = u64::MAX;

/// Attempts to enqueue a write task before the producer runs maintenance
/// itself.
const WRITE_BUFFER_RETRIES: usize = 100;

type NodeRef<K, V> = Arc<Node<K, V>>;
type RemovalEvent<K, V> = (Arc<K>, Option<Arc<V>>, RemovalCause);

/// Deferred write-side work, applied by the drain in publication order.
enum WriteTask<K, V> {
    Add {
        node: NodeRef<K, V>,
        weight: u32,
    },
    Update {
        node: NodeRef<K, V>,
        weight_difference: i64,
    },
    Remove {
        node: NodeRef<K, V>,
    },
}

// ============================================================================
// Bounded Cache
// ============================================================================

/// A concurrent, in-memory bounded cache with TinyLFU admission, optional
/// fixed and variable expiration, and entry weighting.
pub struct BoundedCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for BoundedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K, V> {
    data: DashMap<Arc<K>, NodeRef<K, V>>,
    policy: Mutex<PolicyState<K, V>>,
    drain_status: AtomicU8,
    read_buffer: ReadBuffer<NodeRef<K, V>>,
    write_buffer: WriteBuffer<WriteTask<K, V>>,
    hasher: RandomState,

    ticker: Arc<dyn Ticker>,
    executor: Arc<dyn Executor>,
    scheduler: Option<Arc<dyn Scheduler>>,
    expiry: Option<Arc<dyn Expiry<K, V>>>,
    weigher: Arc<dyn Weigher<K, V>>,
    eviction_listener: Option<Arc<dyn RemovalListener<K, V>>>,
    removal_listener: Option<Arc<dyn RemovalListener<K, V>>>,

    expires_after_access: AtomicU64,
    expires_after_write: AtomicU64,
    value_reference: ReferenceType,
    stats: CacheStatistics,

    /// Whether a capacity bound is active; mirrors the policy state for
    /// lock-free reads.
    bounded: AtomicBool,
    /// Latched once the weighted size crosses half the maximum; gates the
    /// read-buffer fast path.
    approaching_capacity: AtomicBool,
}

impl<K, V> BoundedCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(config: CacheConfig<K, V>) -> Result<Self> {
        config.validate()?;
        let bounded = config.maximum.is_some();
        let inner = Arc::new(Inner {
            data: DashMap::with_capacity(config.initial_capacity),
            policy: Mutex::new(PolicyState::new(
                config.maximum.map(|m| m.min(MAXIMUM_CAPACITY)),
            )),
            drain_status: AtomicU8::new(IDLE),
            read_buffer: ReadBuffer::with_capacity(ReadBuffer::<NodeRef<K, V>>::default_capacity()),
            write_buffer: WriteBuffer::with_capacity(
                WriteBuffer::<WriteTask<K, V>>::default_capacity(),
            ),
            hasher: RandomState::new(),
            ticker: config.ticker,
            executor: config.executor,
            scheduler: config.scheduler,
            expiry: config.expiry,
            weigher: config.weigher,
            eviction_listener: config.eviction_listener,
            removal_listener: config.removal_listener,
            expires_after_access: AtomicU64::new(
                config
                    .expire_after_access
                    .map_or(DISABLED_EXPIRY, |d| d.as_nanos() as u64),
            ),
            expires_after_write: AtomicU64::new(
                config
                    .expire_after_write
                    .map_or(DISABLED_EXPIRY, |d| d.as_nanos() as u64),
            ),
            value_reference: config.value_reference,
            stats: CacheStatistics::new(),
            bounded: AtomicBool::new(bounded),
            approaching_capacity: AtomicBool::new(false),
        });
        Ok(Self { inner })
    }

    // ------------------------------------------------------------------
    // Read operations
    // ------------------------------------------------------------------

    /// Returns the value mapped to the key, if present and live.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.get_if_present(key)
    }

    /// Returns the value mapped to the key without side effects beyond
    /// recency bookkeeping.
    pub fn get_if_present(&self, key: &K) -> Option<Arc<V>> {
        let node = match self.inner.data.get(key) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                self.inner.stats.record_miss();
                return None;
            }
        };
        let now = self.inner.ticker.read();
        if self.inner.has_expired(&node, now) {
            self.inner.stats.record_miss();
            self.inner.schedule_drain_buffers();
            return None;
        }
        let Some(value) = node.value() else {
            // Weak value cleared; surfaces as absent until collected.
            self.inner.stats.record_miss();
            self.inner.schedule_drain_buffers();
            return None;
        };
        self.inner.after_read(&node, now, &value);
        self.inner.stats.record_hit();
        Some(value)
    }

    /// Bulk read; records one read event per present key.
    pub fn get_all_present<'a, I>(&self, keys: I) -> Vec<(Arc<K>, Arc<V>)>
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        keys.into_iter()
            .filter_map(|key| {
                let key_arc = self.inner.data.get(key).map(|e| Arc::clone(e.key()))?;
                let value = self.get_if_present(key)?;
                Some((key_arc, value))
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Write operations
    // ------------------------------------------------------------------

    /// Inserts or replaces, returning the previous value.
    pub fn put(&self, key: K, value: V) -> Option<Arc<V>> {
        self.inner.put(key, Arc::new(value), false)
    }

    /// Inserts or replaces a shared value, returning the previous value.
    /// With weak value references the caller's `Arc` is the strong hold
    /// that keeps the entry live.
    pub fn put_arc(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        self.inner.put(key, value, false)
    }

    /// Inserts only if the key is absent; returns the current value when
    /// present.
    pub fn put_if_absent(&self, key: K, value: V) -> Option<Arc<V>> {
        self.inner.put(key, Arc::new(value), true)
    }

    /// Replaces the value only if the key is present; returns the previous
    /// value.
    pub fn replace(&self, key: &K, value: V) -> Option<Arc<V>> {
        self.inner.replace(key, Arc::new(value))
    }

    /// Compare-and-swap replace: succeeds only when the current value
    /// equals `expected`.
    pub fn replace_if(&self, key: &K, expected: &V, value: V) -> bool
    where
        V: PartialEq,
    {
        self.inner.replace_if(key, expected, Arc::new(value))
    }

    /// Removes the entry, returning its value.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.inner.remove(key)
    }

    /// Removes the entry only when its value equals `expected`.
    pub fn remove_if(&self, key: &K, expected: &V) -> bool
    where
        V: PartialEq,
    {
        self.inner.remove_if(key, expected)
    }

    /// Remaps the entry under its node monitor. Returning `None` removes
    /// the entry; the remapping function must not reenter the cache.
    pub fn compute<F>(&self, key: K, remap: F) -> Option<Arc<V>>
    where
        F: FnOnce(&K, Option<Arc<V>>) -> Option<V>,
    {
        self.inner
            .remap(key, |k, old| remap(k, old).map(Arc::new))
    }

    /// Computes and inserts a value when the key is absent (or its weak
    /// value was collected).
    pub fn compute_if_absent<F>(&self, key: K, create: F) -> Option<Arc<V>>
    where
        F: FnOnce(&K) -> Option<V>,
    {
        self.inner.remap(key, |k, old| match old {
            Some(current) => Some(current),
            None => create(k).map(Arc::new),
        })
    }

    /// Remaps the entry only when present and live.
    pub fn compute_if_present<F>(&self, key: K, remap: F) -> Option<Arc<V>>
    where
        F: FnOnce(&K, Arc<V>) -> Option<V>,
    {
        self.inner
            .remap(key, |k, old| old.and_then(|v| remap(k, v).map(Arc::new)))
    }

    /// Inserts the value when absent, otherwise merges it with the current
    /// value; a merge returning `None` removes the entry.
    pub fn merge<F>(&self, key: K, value: V, merge: F) -> Option<Arc<V>>
    where
        F: FnOnce(Arc<V>, V) -> Option<V>,
    {
        self.inner.remap(key, move |_k, old| match old {
            None => Some(Arc::new(value)),
            Some(current) => merge(current, value).map(Arc::new),
        })
    }

    // ------------------------------------------------------------------
    // Bulk operations and maintenance
    // ------------------------------------------------------------------

    /// Removes every entry, notifying listeners with cause `Explicit`
    /// (or the resolved cause for collected/expired entries).
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    /// Alias of [`BoundedCache::invalidate_all`].
    pub fn clear(&self) {
        self.inner.invalidate_all();
    }

    /// Forces a synchronous maintenance pass.
    pub fn clean_up(&self) {
        self.inner.perform_cleanup_with_pacer_reset();
    }

    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    /// Combined weight of the entries as accounted by the policy.
    pub fn weighted_size(&self) -> u64 {
        self.inner.policy.lock().weighted_size
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot()
    }

    // ------------------------------------------------------------------
    // Policy introspection
    // ------------------------------------------------------------------

    /// Entries in eviction order: window LRU first, then probation LRU,
    /// then protected LRU. Runs a maintenance pass first so pending events
    /// are reflected.
    pub fn coldest(&self, limit: usize) -> Vec<(Arc<K>, Arc<V>)> {
        self.inner.eviction_order(limit, false)
    }

    /// Entries in retention order, the reverse of [`BoundedCache::coldest`].
    pub fn hottest(&self, limit: usize) -> Vec<(Arc<K>, Arc<V>)> {
        self.inner.eviction_order(limit, true)
    }

    /// Current weighted capacity bound, if bounded.
    pub fn maximum(&self) -> Option<u64> {
        let policy = self.inner.policy.lock();
        policy.evicts().then_some(policy.maximum)
    }

    /// Changes the capacity bound, evicting immediately when shrinking.
    pub fn set_maximum(&self, maximum: u64) {
        self.inner.set_maximum(maximum);
    }

    pub fn expires_after_access(&self) -> Option<Duration> {
        let nanos = self.inner.expires_after_access.load(Ordering::Acquire);
        (nanos != DISABLED_EXPIRY).then(|| Duration::from_nanos(nanos))
    }

    pub fn expires_after_write(&self) -> Option<Duration> {
        let nanos = self.inner.expires_after_write.load(Ordering::Acquire);
        (nanos != DISABLED_EXPIRY).then(|| Duration::from_nanos(nanos))
    }

    /// Adjusts the time-to-idle bound; `None` disables it.
    pub fn set_expires_after_access(&self, duration: Option<Duration>) {
        self.inner.expires_after_access.store(
            duration.map_or(DISABLED_EXPIRY, |d| d.as_nanos() as u64),
            Ordering::Release,
        );
        self.clean_up();
    }

    /// Adjusts the time-to-live bound; `None` disables it.
    pub fn set_expires_after_write(&self, duration: Option<Duration>) {
        self.inner.expires_after_write.store(
            duration.map_or(DISABLED_EXPIRY, |d| d.as_nanos() as u64),
            Ordering::Release,
        );
        self.clean_up();
    }
}

// ============================================================================
// Engine internals
// ============================================================================

impl<K, V> Inner<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    // ------------------------------------------------------------------
    // Hot path: reads
    // ------------------------------------------------------------------

    /// Post-read bookkeeping: advance the access clock, refresh a variable
    /// deadline, and publish the event unless the fast path applies.
    fn after_read(self: &Arc<Self>, node: &NodeRef<K, V>, now: u64, value: &Arc<V>) {
        node.set_access_time(now);
        if let Some(expiry) = &self.expiry {
            let remaining = node.variable_time().saturating_sub(now);
            let duration = expiry.expire_after_read(node.key(), value, now, remaining);
            node.set_variable_time(now.saturating_add(duration));
        }
        let delayable = self.skip_read_buffer()
            || self.read_buffer.offer(Arc::clone(node)) != OfferResult::Full;
        if self.should_drain_buffers(delayable) {
            self.schedule_drain_buffers();
        }
    }

    /// Reads bypass the buffer entirely when no policy needs recency:
    /// no time-to-idle, no variable expiry, and the cache is unbounded or
    /// still below half capacity.
    fn skip_read_buffer(&self) -> bool {
        self.expires_after_access.load(Ordering::Relaxed) == DISABLED_EXPIRY
            && self.expiry.is_none()
            && (!self.bounded.load(Ordering::Relaxed)
                || !self.approaching_capacity.load(Ordering::Relaxed))
    }

    fn has_expired(&self, node: &NodeRef<K, V>, now: u64) -> bool {
        let access = self.expires_after_access.load(Ordering::Relaxed);
        if access != DISABLED_EXPIRY && now.saturating_sub(node.access_time()) >= access {
            return true;
        }
        let write = self.expires_after_write.load(Ordering::Relaxed);
        if write != DISABLED_EXPIRY && now.saturating_sub(node.write_time()) >= write {
            return true;
        }
        self.expiry.is_some() && node.variable_time() <= now
    }

    // ------------------------------------------------------------------
    // Hot path: writes
    // ------------------------------------------------------------------

    fn put(self: &Arc<Self>, key: K, value: Arc<V>, only_if_absent: bool) -> Option<Arc<V>> {
        let now = self.ticker.read();
        let key = Arc::new(key);
        let key_hash = self.hasher.hash_one(&*key);

        match self.data.entry(Arc::clone(&key)) {
            Entry::Occupied(entry) => {
                let node = Arc::clone(entry.get());
                let mut state = node.lock();
                if only_if_absent {
                    if let Some(existing) = state.value.get() {
                        drop(state);
                        drop(entry);
                        self.after_read(&node, now, &existing);
                        return Some(existing);
                    }
                }
                let (old_value, weight_difference, was_collected) =
                    self.replace_value(&node, &mut state, &value);
                drop(state);
                drop(entry);
                let exceeds_tolerance = self.update_expiration(&node, &value, now);
                if was_collected {
                    self.dispatch_removals(vec![(
                        Arc::clone(&key),
                        None,
                        RemovalCause::Collected,
                    )]);
                } else if let Some(old) = &old_value {
                    self.dispatch_removals(vec![(
                        Arc::clone(&key),
                        Some(Arc::clone(old)),
                        RemovalCause::Replaced,
                    )]);
                }
                self.publish_update(&node, &value, weight_difference, exceeds_tolerance, now);
                old_value
            }
            Entry::Vacant(entry) => {
                let weight = self.weigher.weigh(&key, &value);
                let node = Arc::new(Node::new(
                    Arc::clone(&key),
                    key_hash,
                    ValueHolder::new(Arc::clone(&value), self.value_reference),
                    weight,
                    now,
                ));
                if let Some(expiry) = &self.expiry {
                    let duration = expiry.expire_after_create(&key, &value, now);
                    node.set_variable_time(now.saturating_add(duration));
                }
                let _ = entry.insert(Arc::clone(&node));
                self.after_write(WriteTask::Add { node, weight });
                None
            }
        }
    }

    fn replace(self: &Arc<Self>, key: &K, value: Arc<V>) -> Option<Arc<V>> {
        let now = self.ticker.read();
        let node = Arc::clone(self.data.get(key)?.value());
        let (old_value, weight_difference, was_collected) = {
            let mut state = node.lock();
            if !node.is_alive() {
                return None;
            }
            self.replace_value(&node, &mut state, &value)
        };
        let exceeds_tolerance = self.update_expiration(&node, &value, now);
        if was_collected {
            self.dispatch_removals(vec![(
                Arc::clone(node.key_arc()),
                None,
                RemovalCause::Collected,
            )]);
        } else if let Some(old) = &old_value {
            self.dispatch_removals(vec![(
                Arc::clone(node.key_arc()),
                Some(Arc::clone(old)),
                RemovalCause::Replaced,
            )]);
        }
        self.publish_update(&node, &value, weight_difference, exceeds_tolerance, now);
        old_value
    }

    fn replace_if(self: &Arc<Self>, key: &K, expected: &V, value: Arc<V>) -> bool
    where
        V: PartialEq,
    {
        let now = self.ticker.read();
        let Some(node) = self.data.get(key).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        let (old_value, weight_difference) = {
            let mut state = node.lock();
            if !node.is_alive() {
                return false;
            }
            match state.value.get() {
                Some(current) if *current == *expected => {
                    let (old, diff, _) = self.replace_value(&node, &mut state, &value);
                    (old, diff)
                }
                _ => return false,
            }
        };
        let exceeds_tolerance = self.update_expiration(&node, &value, now);
        if let Some(old) = &old_value {
            self.dispatch_removals(vec![(
                Arc::clone(node.key_arc()),
                Some(Arc::clone(old)),
                RemovalCause::Replaced,
            )]);
        }
        self.publish_update(&node, &value, weight_difference, exceeds_tolerance, now);
        true
    }

    fn remove(self: &Arc<Self>, key: &K) -> Option<Arc<V>> {
        let mut old_value = None;
        let removed = self.data.remove_if(key, |_, node| {
            let state = node.lock();
            old_value = state.value.get();
            node.retire();
            true
        });
        let (_, node) = removed?;
        let cause = if old_value.is_none() && matches!(self.value_reference, ReferenceType::Weak) {
            RemovalCause::Collected
        } else {
            RemovalCause::Explicit
        };
        self.dispatch_removals(vec![(Arc::clone(node.key_arc()), old_value.clone(), cause)]);
        self.after_write(WriteTask::Remove { node });
        old_value
    }

    fn remove_if(self: &Arc<Self>, key: &K, expected: &V) -> bool
    where
        V: PartialEq,
    {
        let mut old_value = None;
        let removed = self.data.remove_if(key, |_, node| {
            let state = node.lock();
            match state.value.get() {
                Some(current) if *current == *expected => {
                    old_value = Some(current);
                    node.retire();
                    true
                }
                _ => false,
            }
        });
        let Some((_, node)) = removed else {
            return false;
        };
        self.dispatch_removals(vec![(
            Arc::clone(node.key_arc()),
            old_value,
            RemovalCause::Explicit,
        )]);
        self.after_write(WriteTask::Remove { node });
        true
    }

    /// The shared compute engine: runs the remapping function under the
    /// node monitor (and map shard lock) and routes the outcome through
    /// the insert, update, or removal path.
    fn remap<F>(self: &Arc<Self>, key: K, remap: F) -> Option<Arc<V>>
    where
        F: FnOnce(&K, Option<Arc<V>>) -> Option<Arc<V>>,
    {
        let now = self.ticker.read();
        let key = Arc::new(key);
        let key_hash = self.hasher.hash_one(&*key);

        match self.data.entry(Arc::clone(&key)) {
            Entry::Occupied(entry) => {
                let node = Arc::clone(entry.get());
                let mut state = node.lock();
                let old_value = state.value.get();
                let was_collected =
                    old_value.is_none() && matches!(self.value_reference, ReferenceType::Weak);
                match remap(&key, old_value.clone()) {
                    Some(new_value) => {
                        if let Some(old) = &old_value {
                            if Arc::ptr_eq(old, &new_value) {
                                drop(state);
                                drop(entry);
                                self.after_read(&node, now, &new_value);
                                return Some(new_value);
                            }
                        }
                        let (_, weight_difference, _) =
                            self.replace_value(&node, &mut state, &new_value);
                        drop(state);
                        drop(entry);
                        let exceeds_tolerance = self.update_expiration(&node, &new_value, now);
                        if was_collected {
                            self.dispatch_removals(vec![(
                                Arc::clone(&key),
                                None,
                                RemovalCause::Collected,
                            )]);
                        } else if let Some(old) = old_value {
                            self.dispatch_removals(vec![(
                                Arc::clone(&key),
                                Some(old),
                                RemovalCause::Replaced,
                            )]);
                        }
                        self.publish_update(
                            &node,
                            &new_value,
                            weight_difference,
                            exceeds_tolerance,
                            now,
                        );
                        Some(new_value)
                    }
                    None => {
                        node.retire();
                        drop(state);
                        let (_, node) = entry.remove_entry();
                        let cause = if was_collected {
                            RemovalCause::Collected
                        } else {
                            RemovalCause::Explicit
                        };
                        self.dispatch_removals(vec![(Arc::clone(&key), old_value, cause)]);
                        self.after_write(WriteTask::Remove { node });
                        None
                    }
                }
            }
            Entry::Vacant(entry) => match remap(&key, None) {
                Some(value) => {
                    let weight = self.weigher.weigh(&key, &value);
                    let node = Arc::new(Node::new(
                        Arc::clone(&key),
                        key_hash,
                        ValueHolder::new(Arc::clone(&value), self.value_reference),
                        weight,
                        now,
                    ));
                    if let Some(expiry) = &self.expiry {
                        let duration = expiry.expire_after_create(&key, &value, now);
                        node.set_variable_time(now.saturating_add(duration));
                    }
                    let _ = entry.insert(Arc::clone(&node));
                    self.after_write(WriteTask::Add { node, weight });
                    Some(value)
                }
                None => None,
            },
        }
    }

    /// Swaps the value under the node monitor, returning the old value,
    /// the weight delta, and whether the old value had been collected.
    fn replace_value(
        &self,
        node: &NodeRef<K, V>,
        state: &mut NodeState<V>,
        value: &Arc<V>,
    ) -> (Option<Arc<V>>, i64, bool) {
        let old_value = state.value.get();
        let was_collected =
            old_value.is_none() && matches!(self.value_reference, ReferenceType::Weak);
        let old_weight = state.weight;
        let weight = self.weigher.weigh(node.key(), value);
        state.value = ValueHolder::new(Arc::clone(value), self.value_reference);
        state.weight = weight;
        (
            old_value,
            i64::from(weight) - i64::from(old_weight),
            was_collected,
        )
    }

    /// Recomputes a variable deadline for an update and reports whether the
    /// update must be published as a write: either the last write falls
    /// outside the tolerance, or the new deadline moved by more than it.
    fn update_expiration(&self, node: &NodeRef<K, V>, value: &Arc<V>, now: u64) -> bool {
        let mut exceeds = false;
        if self.expires_after_write.load(Ordering::Relaxed) != DISABLED_EXPIRY {
            exceeds |= now.saturating_sub(node.write_time()) > EXPIRE_WRITE_TOLERANCE;
        }
        if let Some(expiry) = &self.expiry {
            let remaining = node.variable_time().saturating_sub(now);
            let duration = expiry.expire_after_update(node.key(), value, now, remaining);
            let deadline = now.saturating_add(duration);
            exceeds |= deadline.abs_diff(node.variable_time()) > EXPIRE_WRITE_TOLERANCE;
            node.set_variable_time(deadline);
        }
        exceeds
    }

    /// Routes an update either through the write buffer or, within the
    /// write tolerance with an unchanged weight, through the read buffer.
    fn publish_update(
        self: &Arc<Self>,
        node: &NodeRef<K, V>,
        value: &Arc<V>,
        weight_difference: i64,
        exceeds_tolerance: bool,
        now: u64,
    ) {
        node.set_access_time(now);
        if weight_difference != 0 || exceeds_tolerance {
            node.set_write_time(now);
            self.after_write(WriteTask::Update {
                node: Arc::clone(node),
                weight_difference,
            });
        } else {
            self.after_read(node, now, value);
        }
    }

    /// Publishes a write task, running maintenance on the calling thread
    /// when the buffer stays full, so every task eventually executes.
    fn after_write(self: &Arc<Self>, task: WriteTask<K, V>) {
        let mut task = task;
        for _ in 0..WRITE_BUFFER_RETRIES {
            match self.write_buffer.try_push(task) {
                Ok(()) => {
                    self.schedule_after_write();
                    return;
                }
                Err(returned) => {
                    task = returned;
                    self.schedule_drain_buffers();
                    std::hint::spin_loop();
                }
            }
        }
        debug!("write buffer saturated; running maintenance on writer");
        let events = {
            let mut policy = self.policy.lock();
            self.maintenance(&mut policy, Some(task))
        };
        self.dispatch_removals(events);
    }

    // ------------------------------------------------------------------
    // Drain status machine
    // ------------------------------------------------------------------

    fn drain_status_value(&self) -> u8 {
        self.drain_status.load(Ordering::Acquire)
    }

    fn should_drain_buffers(&self, delayable: bool) -> bool {
        match self.drain_status_value() {
            IDLE => !delayable,
            REQUIRED => true,
            _ => false,
        }
    }

    /// A write signal: drain is required, and a task is submitted unless
    /// one is already in flight.
    fn schedule_after_write(self: &Arc<Self>) {
        loop {
            match self.drain_status_value() {
                IDLE => {
                    let _ = self.drain_status.compare_exchange(
                        IDLE,
                        REQUIRED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    self.schedule_drain_buffers();
                    return;
                }
                REQUIRED => {
                    self.schedule_drain_buffers();
                    return;
                }
                PROCESSING_TO_IDLE => {
                    if self
                        .drain_status
                        .compare_exchange(
                            PROCESSING_TO_IDLE,
                            PROCESSING_TO_REQUIRED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => return, // PROCESSING_TO_REQUIRED
            }
        }
    }

    /// Submits the maintenance task if no drain is in flight. Submission
    /// happens only on the idle-family to processing-family transition;
    /// a rejected submission degrades to an inline drain.
    fn schedule_drain_buffers(self: &Arc<Self>) {
        if self.drain_status_value() >= PROCESSING_TO_IDLE {
            return;
        }
        let Some(_guard) = self.policy.try_lock() else {
            // The lock holder resolves the status when it finishes.
            return;
        };
        if self.drain_status_value() >= PROCESSING_TO_IDLE {
            return;
        }
        self.drain_status
            .store(PROCESSING_TO_IDLE, Ordering::Release);
        drop(_guard);

        let this = Arc::clone(self);
        let submitted = self
            .executor
            .execute(Box::new(move || this.perform_cleanup()));
        if let Err(error) = submitted {
            warn!(%error, "maintenance task rejected; draining on caller");
            self.perform_cleanup();
        }
    }

    /// Runs one maintenance session under the eviction mutex, then
    /// dispatches removal notifications outside of it.
    fn perform_cleanup(self: &Arc<Self>) {
        let events = {
            let mut policy = self.policy.lock();
            self.maintenance(&mut policy, None)
        };
        self.dispatch_removals(events);
    }

    /// `clean_up` contract: any pending pacer future is cancelled before
    /// the pass, and rescheduled afterwards only if deadlines remain.
    fn perform_cleanup_with_pacer_reset(self: &Arc<Self>) {
        let events = {
            let mut policy = self.policy.lock();
            policy.pacer.cancel();
            self.maintenance(&mut policy, None)
        };
        self.dispatch_removals(events);
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    fn maintenance(
        self: &Arc<Self>,
        policy: &mut PolicyState<K, V>,
        mut inline_task: Option<WriteTask<K, V>>,
    ) -> Vec<RemovalEvent<K, V>> {
        let mut events = Vec::new();
        let variable_expiry = self.expiry.is_some();
        loop {
            self.drain_status
                .store(PROCESSING_TO_IDLE, Ordering::Release);
            let now = self.ticker.read();

            self.read_buffer
                .drain(|node| policy.on_access(&node, variable_expiry));
            while let Some(task) = self.write_buffer.pop() {
                self.run_write_task(policy, task, now, &mut events);
            }
            if let Some(task) = inline_task.take() {
                self.run_write_task(policy, task, now, &mut events);
            }
            self.drain_collected(policy, now, &mut events);
            self.expire_entries(policy, now, &mut events);
            self.evict_entries(policy, now, &mut events);
            policy.climb();
            self.update_capacity_hint(policy);
            self.schedule_pacer(policy, now);

            if self
                .drain_status
                .compare_exchange(
                    PROCESSING_TO_IDLE,
                    IDLE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
            // New work arrived during the pass; run again before idling.
        }
        events
    }

    fn run_write_task(
        &self,
        policy: &mut PolicyState<K, V>,
        task: WriteTask<K, V>,
        _now: u64,
        _events: &mut Vec<RemovalEvent<K, V>>,
    ) {
        match task {
            WriteTask::Add { node, weight } => {
                policy.misses_in_sample += 1;
                if !node.is_alive() {
                    return;
                }
                node.set_policy_weight(node.policy_weight().saturating_add(weight));
                policy.weighted_size += u64::from(weight);
                policy.window_weighted_size += u64::from(weight);

                let slot = policy.window.push_back(Arc::clone(&node));
                node.set_access_slot(slot);
                node.set_region(Region::Window);
                let write_slot = policy.write_order.push_back(Arc::clone(&node));
                node.set_write_slot(write_slot);
                if self.expiry.is_some() {
                    policy
                        .timer_wheel
                        .schedule(Arc::clone(&node), node.variable_time());
                }
                policy.sketch.increment(node.key_hash());
            }
            WriteTask::Update {
                node,
                weight_difference,
            } => {
                if node.is_dead() {
                    return;
                }
                let new_weight =
                    (i64::from(node.policy_weight()) + weight_difference).max(0) as u32;
                node.set_policy_weight(new_weight);
                policy.weighted_size =
                    (policy.weighted_size as i64 + weight_difference).max(0) as u64;
                match node.region() {
                    Region::Window => {
                        policy.window_weighted_size =
                            (policy.window_weighted_size as i64 + weight_difference).max(0) as u64;
                    }
                    Region::MainProtected => {
                        policy.main_protected_weighted_size =
                            (policy.main_protected_weighted_size as i64 + weight_difference)
                                .max(0) as u64;
                    }
                    Region::MainProbation => {}
                }
                if !node.is_alive() {
                    return;
                }
                let slot = node.access_slot();
                if slot != NIL {
                    match node.region() {
                        Region::Window => policy.window.move_to_back(slot),
                        Region::MainProbation => policy.probation.move_to_back(slot),
                        Region::MainProtected => policy.protected.move_to_back(slot),
                    }
                }
                let write_slot = node.write_slot();
                if write_slot != NIL {
                    policy.write_order.move_to_back(write_slot);
                }
                if self.expiry.is_some() {
                    let timer = WheelEntry::timer_slot(&node);
                    if timer != NIL {
                        policy.timer_wheel.reschedule(timer, node.variable_time());
                    }
                }
            }
            WriteTask::Remove { node } => {
                let region = node.region();
                policy.unlink(&node);
                policy.subtract_weight(region, node.policy_weight());
                node.die();
            }
        }
    }

    /// Weak-value sweep: entries whose value reference was cleared are
    /// removed with cause `Collected`, unless a concurrent compute
    /// resurrected them (checked under the node monitor).
    fn drain_collected(
        &self,
        policy: &mut PolicyState<K, V>,
        now: u64,
        events: &mut Vec<RemovalEvent<K, V>>,
    ) {
        if !matches!(self.value_reference, ReferenceType::Weak) {
            return;
        }
        let collected: Vec<NodeRef<K, V>> = self
            .data
            .iter()
            .filter(|entry| entry.value().lock().value.is_collected())
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for node in collected {
            self.evict_entry(policy, &node, RemovalCause::Collected, now, events);
        }
    }

    fn expire_entries(
        &self,
        policy: &mut PolicyState<K, V>,
        now: u64,
        events: &mut Vec<RemovalEvent<K, V>>,
    ) {
        let write = self.expires_after_write.load(Ordering::Relaxed);
        if write != DISABLED_EXPIRY {
            while let Some(node) = policy.write_order.peek_front().cloned() {
                if node.write_time().saturating_add(write) > now {
                    break;
                }
                if !self.evict_entry(policy, &node, RemovalCause::Expired, now, events) {
                    if node.is_alive() {
                        break; // refreshed concurrently
                    }
                    policy.unlink(&node);
                }
            }
        }

        let access = self.expires_after_access.load(Ordering::Relaxed);
        if access != DISABLED_EXPIRY {
            for region in [Region::Window, Region::MainProbation, Region::MainProtected] {
                loop {
                    let head = match region {
                        Region::Window => policy.window.peek_front(),
                        Region::MainProbation => policy.probation.peek_front(),
                        Region::MainProtected => policy.protected.peek_front(),
                    }
                    .cloned();
                    let Some(node) = head else { break };
                    if node.access_time().saturating_add(access) > now {
                        break;
                    }
                    if !self.evict_entry(policy, &node, RemovalCause::Expired, now, events) {
                        if node.is_alive() {
                            break;
                        }
                        policy.unlink(&node);
                    }
                }
            }
        }

        if self.expiry.is_some() {
            let mut due = Vec::new();
            policy.timer_wheel.advance(now, |node| due.push(node));
            for node in due {
                if !self.evict_entry(policy, &node, RemovalCause::Expired, now, events)
                    && node.is_alive()
                {
                    // Deadline refreshed while expiring; back on the wheel.
                    policy
                        .timer_wheel
                        .schedule(Arc::clone(&node), node.variable_time());
                }
            }
        }
    }

    /// Size eviction with TinyLFU admission at the window/main boundary.
    fn evict_entries(
        &self,
        policy: &mut PolicyState<K, V>,
        now: u64,
        events: &mut Vec<RemovalEvent<K, V>>,
    ) {
        if !policy.evicts() {
            return;
        }
        policy.demote_from_main_protected();
        let mut candidates = policy.evict_from_window();

        while policy.weighted_size > policy.maximum {
            let victim = policy
                .probation
                .iter()
                .find(|n| n.policy_weight() > 0)
                .cloned();
            let candidate = if candidates > 0 {
                policy
                    .probation
                    .iter_rev()
                    .find(|n| n.policy_weight() > 0)
                    .cloned()
            } else {
                None
            };

            let progressed = match (victim, candidate) {
                (None, None) => {
                    let fallback = policy
                        .protected
                        .iter()
                        .find(|n| n.policy_weight() > 0)
                        .cloned()
                        .or_else(|| {
                            policy
                                .window
                                .iter()
                                .find(|n| n.policy_weight() > 0)
                                .cloned()
                        });
                    match fallback {
                        Some(node) => self.evict_or_unlink(policy, &node, now, events),
                        None => break,
                    }
                }
                (Some(victim), None) => self.evict_or_unlink(policy, &victim, now, events),
                (None, Some(candidate)) => {
                    candidates = candidates.saturating_sub(1);
                    self.evict_or_unlink(policy, &candidate, now, events)
                }
                (Some(victim), Some(candidate)) => {
                    if Arc::ptr_eq(&victim, &candidate) {
                        candidates = 0;
                        self.evict_or_unlink(policy, &victim, now, events)
                    } else if u64::from(candidate.policy_weight()) > policy.maximum {
                        // An entry larger than the whole cache can never be
                        // admitted anywhere; shed it first.
                        candidates = candidates.saturating_sub(1);
                        self.evict_or_unlink(policy, &candidate, now, events)
                    } else if policy.admit(candidate.key_hash(), victim.key_hash()) {
                        self.evict_or_unlink(policy, &victim, now, events)
                    } else {
                        candidates = candidates.saturating_sub(1);
                        self.evict_or_unlink(policy, &candidate, now, events)
                    }
                }
            };
            if !progressed {
                break;
            }
        }
    }

    /// Evicts with cause `Size`, or unlinks a node that a concurrent
    /// removal already retired so the loop can progress.
    fn evict_or_unlink(
        &self,
        policy: &mut PolicyState<K, V>,
        node: &NodeRef<K, V>,
        now: u64,
        events: &mut Vec<RemovalEvent<K, V>>,
    ) -> bool {
        if self.evict_entry(policy, node, RemovalCause::Size, now, events) {
            true
        } else if !node.is_alive() {
            policy.unlink(node);
            true
        } else {
            false
        }
    }

    /// Removes a node from the map and policy with a double-check under
    /// the node monitor: if the node is no longer collectable or expired,
    /// the eviction aborts and the entry survives (resurrection).
    fn evict_entry(
        &self,
        policy: &mut PolicyState<K, V>,
        node: &NodeRef<K, V>,
        cause: RemovalCause,
        now: u64,
        events: &mut Vec<RemovalEvent<K, V>>,
    ) -> bool {
        let mut resolved: Option<(RemovalCause, Option<Arc<V>>)> = None;
        self.data.remove_if(node.key(), |_, mapped| {
            if !Arc::ptr_eq(mapped, node) {
                return false;
            }
            let state = node.lock();
            let value = state.value.get();
            let actual = if value.is_none()
                && matches!(self.value_reference, ReferenceType::Weak)
            {
                Some(RemovalCause::Collected)
            } else {
                match cause {
                    RemovalCause::Collected => None, // resurrected
                    RemovalCause::Expired => self
                        .has_expired(node, now)
                        .then_some(RemovalCause::Expired),
                    RemovalCause::Explicit => {
                        if self.has_expired(node, now) {
                            Some(RemovalCause::Expired)
                        } else {
                            Some(RemovalCause::Explicit)
                        }
                    }
                    other => Some(other),
                }
            };
            match actual {
                Some(actual_cause) => {
                    node.retire();
                    resolved = Some((actual_cause, value));
                    true
                }
                None => false,
            }
        });

        let Some((actual_cause, value)) = resolved else {
            return false;
        };
        let region = node.region();
        let weight = node.policy_weight();
        policy.unlink(node);
        policy.subtract_weight(region, weight);
        node.die();

        if actual_cause.was_evicted() {
            self.stats.record_eviction(weight, actual_cause);
            if let Some(listener) = &self.eviction_listener {
                let key = node.key_arc();
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    listener.on_removal(key, value.clone(), actual_cause)
                }));
                if outcome.is_err() {
                    warn!("eviction listener panicked; drain continues");
                }
            }
        }
        events.push((Arc::clone(node.key_arc()), value, actual_cause));
        true
    }

    fn update_capacity_hint(&self, policy: &PolicyState<K, V>) {
        let bounded = policy.evicts();
        self.bounded.store(bounded, Ordering::Relaxed);
        let approaching = bounded && policy.weighted_size >= policy.maximum / 2;
        self.approaching_capacity
            .store(approaching, Ordering::Relaxed);
    }

    /// Schedules the pacer for the earliest pending deadline, or cancels
    /// it when nothing expires in the future.
    fn schedule_pacer(self: &Arc<Self>, policy: &mut PolicyState<K, V>, now: u64) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        match self.next_expiration_delay(policy, now) {
            Some(delay) => {
                let weak = Arc::downgrade(self);
                let task: Task = Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.perform_cleanup();
                    }
                });
                policy.pacer.schedule(&**scheduler, now, delay, task);
            }
            None => policy.pacer.cancel(),
        }
    }

    fn next_expiration_delay(&self, policy: &PolicyState<K, V>, now: u64) -> Option<u64> {
        let mut earliest: Option<u64> = None;
        let mut merge = |deadline: u64| {
            earliest = Some(earliest.map_or(deadline, |e: u64| e.min(deadline)));
        };

        let write = self.expires_after_write.load(Ordering::Relaxed);
        if write != DISABLED_EXPIRY {
            if let Some(node) = policy.write_order.peek_front() {
                merge(node.write_time().saturating_add(write));
            }
        }
        let access = self.expires_after_access.load(Ordering::Relaxed);
        if access != DISABLED_EXPIRY {
            for deque in [&policy.window, &policy.probation, &policy.protected] {
                if let Some(node) = deque.peek_front() {
                    merge(node.access_time().saturating_add(access));
                }
            }
        }
        if self.expiry.is_some() {
            if let Some(deadline) = policy.timer_wheel.next_expiration() {
                merge(deadline);
            }
        }
        earliest.map(|deadline| deadline.saturating_sub(now))
    }

    // ------------------------------------------------------------------
    // Bulk operations
    // ------------------------------------------------------------------

    fn invalidate_all(self: &Arc<Self>) {
        let events = {
            let mut policy = self.policy.lock();
            let now = self.ticker.read();
            let mut events = Vec::new();

            // Apply pending work so the accounting is coherent first.
            self.read_buffer.drain(|_| {});
            while let Some(task) = self.write_buffer.pop() {
                self.run_write_task(&mut policy, task, now, &mut events);
            }

            let nodes: Vec<NodeRef<K, V>> = self
                .data
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            for node in nodes {
                if !self.evict_entry(&mut policy, &node, RemovalCause::Explicit, now, &mut events)
                    && !node.is_alive()
                {
                    policy.unlink(&node);
                }
            }
            policy.pacer.cancel();
            events
        };
        self.dispatch_removals(events);
    }

    fn set_maximum(self: &Arc<Self>, maximum: u64) {
        let events = {
            let mut policy = self.policy.lock();
            policy.set_maximum(maximum.min(MAXIMUM_CAPACITY));
            self.maintenance(&mut policy, None)
        };
        self.dispatch_removals(events);
    }

    fn eviction_order(self: &Arc<Self>, limit: usize, hottest: bool) -> Vec<(Arc<K>, Arc<V>)> {
        let (entries, events) = {
            let mut policy = self.policy.lock();
            let events = self.maintenance(&mut policy, None);
            let mut entries = Vec::new();
            {
                let mut push = |node: &NodeRef<K, V>| {
                    if entries.len() < limit {
                        if let Some(value) = node.value() {
                            entries.push((Arc::clone(node.key_arc()), value));
                        }
                    }
                };
                if hottest {
                    policy.protected.iter_rev().for_each(&mut push);
                    policy.probation.iter_rev().for_each(&mut push);
                    policy.window.iter_rev().for_each(&mut push);
                } else {
                    policy.window.iter().for_each(&mut push);
                    policy.probation.iter().for_each(&mut push);
                    policy.protected.iter().for_each(&mut push);
                }
            }
            (entries, events)
        };
        self.dispatch_removals(events);
        entries
    }

    // ------------------------------------------------------------------
    // Listener dispatch
    // ------------------------------------------------------------------

    /// Removal notifications run through the executor after the eviction
    /// mutex is released; a rejecting executor degrades to inline
    /// delivery so no notification is lost.
    fn dispatch_removals(self: &Arc<Self>, events: Vec<RemovalEvent<K, V>>) {
        if events.is_empty() {
            return;
        }
        let Some(listener) = &self.removal_listener else {
            return;
        };
        let listener = Arc::clone(listener);
        let fallback = events.clone();
        let async_listener = Arc::clone(&listener);
        let task: Task = Box::new(move || {
            for (key, value, cause) in events {
                async_listener.on_removal(&key, value, cause);
            }
        });
        if self.executor.execute(task).is_err() {
            for (key, value, cause) in fallback {
                listener.on_removal(&key, value, cause);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::UnitWeigher;
    use crate::error::CacheError;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicUsize;

    struct MockTicker(AtomicU64);

    impl MockTicker {
        fn new() -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(0)))
        }

        fn advance(&self, nanos: u64) {
            self.0.fetch_add(nanos, Ordering::SeqCst);
        }
    }

    impl Ticker for MockTicker {
        fn read(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// Captures tasks without running them, pinning the drain status in
    /// the processing family.
    #[derive(Default)]
    struct CaptureExecutor {
        tasks: PlMutex<Vec<Task>>,
    }

    impl Executor for Arc<CaptureExecutor> {
        fn execute(&self, task: Task) -> crate::error::Result<()> {
            self.tasks.lock().push(task);
            Ok(())
        }
    }

    struct RejectingExecutor;

    impl Executor for RejectingExecutor {
        fn execute(&self, _task: Task) -> crate::error::Result<()> {
            Err(CacheError::ExecutorRejected("rejected".into()))
        }
    }

    fn cache(maximum: u64) -> BoundedCache<u32, u32> {
        BoundedCache::new(CacheConfig::new().maximum(maximum)).unwrap()
    }

    #[test]
    fn test_put_get_remove_roundtrip() {
        let cache = cache(100);
        assert!(cache.put(1, 10).is_none());
        assert_eq!(cache.get(&1).as_deref(), Some(&10));

        let previous = cache.put(1, 11);
        assert_eq!(previous.as_deref(), Some(&10));

        assert_eq!(cache.remove(&1).as_deref(), Some(&11));
        assert!(cache.get(&1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_if_absent() {
        let cache = cache(100);
        assert!(cache.put_if_absent(1, 10).is_none());
        assert_eq!(cache.put_if_absent(1, 11).as_deref(), Some(&10));
        assert_eq!(cache.get(&1).as_deref(), Some(&10));
    }

    #[test]
    fn test_replace_semantics() {
        let cache = cache(100);
        assert!(cache.replace(&1, 10).is_none());
        assert!(cache.get(&1).is_none(), "replace must not insert");

        cache.put(1, 10);
        assert_eq!(cache.replace(&1, 11).as_deref(), Some(&10));

        assert!(!cache.replace_if(&1, &10, 12));
        assert!(cache.replace_if(&1, &11, 12));
        assert_eq!(cache.get(&1).as_deref(), Some(&12));
    }

    #[test]
    fn test_remove_if() {
        let cache = cache(100);
        cache.put(1, 10);
        assert!(!cache.remove_if(&1, &99));
        assert!(cache.remove_if(&1, &10));
        assert!(cache.get(&1).is_none());
    }

    #[test]
    fn test_compute_family() {
        let cache = cache(100);

        let value = cache.compute_if_absent(1, |_| Some(5));
        assert_eq!(value.as_deref(), Some(&5));
        let value = cache.compute_if_absent(1, |_| Some(99));
        assert_eq!(value.as_deref(), Some(&5), "existing value wins");

        let value = cache.compute_if_present(1, |_, v| Some(*v + 1));
        assert_eq!(value.as_deref(), Some(&6));
        assert!(cache.compute_if_present(2, |_, _| Some(0)).is_none());

        let value = cache.merge(1, 4, |old, new| Some(*old + new));
        assert_eq!(value.as_deref(), Some(&10));

        assert!(cache.compute(1, |_, _| None).is_none());
        assert!(cache.get(&1).is_none());
    }

    #[test]
    fn test_invalidate_all() {
        let cache = cache(100);
        for key in 0..10 {
            cache.put(key, key);
        }
        cache.invalidate_all();
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.weighted_size(), 0);
    }

    #[test]
    fn test_drain_status_table() {
        let executor = Arc::new(CaptureExecutor::default());
        let cache: BoundedCache<u32, u32> = BoundedCache::new(
            CacheConfig::new()
                .maximum(100)
                .executor(Arc::new(Arc::clone(&executor))),
        )
        .unwrap();
        let inner = &cache.inner;

        // Idle + drain signal: submit and move to processing-to-idle.
        assert_eq!(inner.drain_status_value(), IDLE);
        inner.schedule_drain_buffers();
        assert_eq!(inner.drain_status_value(), PROCESSING_TO_IDLE);
        assert_eq!(executor.tasks.lock().len(), 1);

        // Processing family + drain signal: no double submission.
        inner.schedule_drain_buffers();
        assert_eq!(executor.tasks.lock().len(), 1);

        // Processing-to-idle + write signal: becomes processing-to-required.
        inner.schedule_after_write();
        assert_eq!(inner.drain_status_value(), PROCESSING_TO_REQUIRED);
        assert_eq!(executor.tasks.lock().len(), 1);

        // Processing-to-required + either signal: unchanged.
        inner.schedule_after_write();
        inner.schedule_drain_buffers();
        assert_eq!(inner.drain_status_value(), PROCESSING_TO_REQUIRED);
        assert_eq!(executor.tasks.lock().len(), 1);

        // Completing the drain from processing-to-required re-runs and
        // settles at idle.
        let task = executor.tasks.lock().pop().unwrap();
        task();
        assert_eq!(inner.drain_status_value(), IDLE);
    }

    #[test]
    fn test_write_tolerance_coalesces_updates_into_reads() {
        let ticker = MockTicker::new();
        let cache: BoundedCache<u32, u32> = BoundedCache::new(
            CacheConfig::new()
                .maximum(100)
                .ticker(ticker.clone())
                .expire_after_write(Duration::from_secs(60)),
        )
        .unwrap();

        cache.put(1, 1);
        assert_eq!(cache.inner.write_buffer.produced(), 1);

        // Within the tolerance: buffered as a read.
        cache.put(1, 2);
        assert_eq!(cache.inner.write_buffer.produced(), 1);
        assert_eq!(cache.get(&1).as_deref(), Some(&2));

        // Outside the tolerance: a real write task.
        ticker.advance(EXPIRE_WRITE_TOLERANCE + 1);
        cache.put(1, 3);
        assert_eq!(cache.inner.write_buffer.produced(), 2);
    }

    #[test]
    fn test_read_buffer_reconciles_after_clean_up() {
        let cache = cache(4);
        for key in 0..4 {
            cache.put(key, key);
        }
        for key in 0..4 {
            let _ = cache.get(&key);
        }
        cache.clean_up();
        assert_eq!(
            cache.inner.read_buffer.reads(),
            cache.inner.read_buffer.writes()
        );
    }

    #[test]
    fn test_executor_rejection_degrades_to_inline_drain() {
        let cache: BoundedCache<u32, u32> = BoundedCache::new(
            CacheConfig::new()
                .maximum(2)
                .executor(Arc::new(RejectingExecutor)),
        )
        .unwrap();

        for key in 0..10 {
            cache.put(key, key);
        }
        cache.clean_up();
        assert!(cache.weighted_size() <= 2);
        assert!(cache.len() <= 2);
    }

    #[test]
    fn test_oversize_entry_disappears() {
        let weigher: Arc<dyn Weigher<u32, u32>> = Arc::new(|_k: &u32, v: &u32| *v);
        let removed = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&removed);
        let listener: Arc<dyn RemovalListener<u32, u32>> =
            Arc::new(move |_k: &u32, _v: Option<Arc<u32>>, cause: RemovalCause| {
                if cause == RemovalCause::Size {
                    observed.fetch_add(1, Ordering::SeqCst);
                }
            });
        let cache: BoundedCache<u32, u32> = BoundedCache::new(
            CacheConfig::new()
                .maximum(10)
                .weigher(weigher)
                .removal_listener(listener),
        )
        .unwrap();

        cache.put(1, 50);
        cache.clean_up();
        assert!(cache.get(&1).is_none());
        assert_eq!(cache.weighted_size(), 0);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_weighted_update_sheds_oversize_entry() {
        let weigher: Arc<dyn Weigher<u32, u32>> = Arc::new(|_k: &u32, v: &u32| *v);
        let cache: BoundedCache<u32, u32> =
            BoundedCache::new(CacheConfig::new().maximum(10).weigher(weigher)).unwrap();

        cache.put(9, 9);
        cache.put(1, 1);
        cache.clean_up();
        assert_eq!(cache.weighted_size(), 10);

        cache.put(1, 20);
        cache.clean_up();
        assert!(cache.weighted_size() <= 10);
        assert!(cache.get(&1).is_none());
    }

    #[test]
    fn test_unit_weigher_default() {
        let cache: BoundedCache<u32, u32> = BoundedCache::new(
            CacheConfig::new()
                .maximum(100)
                .weigher(Arc::new(UnitWeigher)),
        )
        .unwrap();
        cache.put(1, 1);
        cache.clean_up();
        assert_eq!(cache.weighted_size(), 1);
    }
}
