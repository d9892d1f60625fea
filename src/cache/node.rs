// # Entry Node - Per-Entry Metadata and Lifecycle
//
// The node carries everything the policy needs to know about one entry:
// key, value holder, weights, timestamps, region membership, and the slots
// linking it into the order deques and the timer wheel.
//
// ## Locking Protocol
//
// The value and hot-path weight live behind the node's own mutex (the
// "node monitor"); value mutation on the hot path happens there. All other
// fields are atomics: timestamps and slots are written either on the hot
// path (times) or exclusively under the eviction mutex (slots, region,
// policy weight), and are read with acquire semantics.
//
// ## Lifecycle
//
// `Alive -> Retired -> Dead`, never backwards. Retired means the node was
// unmapped from the data map but the drain has not yet reclaimed its queue
// state; Dead means fully unlinked.

use crate::common::ReferenceType;
use crate::deque::NIL;
use crate::timer::WheelEntry;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

const ALIVE: u8 = 0;
const RETIRED: u8 = 1;
const DEAD: u8 = 2;

/// The access-ordered region an entry currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Window,
    MainProbation,
    MainProtected,
}

// ============================================================================
// Value Holder
// ============================================================================

/// Holds an entry's value, strongly or weakly.
///
/// A weak holder is observed as cleared once the last external strong
/// reference drops; the entry then surfaces as absent and the next
/// maintenance pass removes it with cause `Collected`.
pub enum ValueHolder<V> {
    Strong(Arc<V>),
    Weak(Weak<V>),
}

impl<V> ValueHolder<V> {
    pub fn new(value: Arc<V>, reference: ReferenceType) -> Self {
        match reference {
            ReferenceType::Weak => ValueHolder::Weak(Arc::downgrade(&value)),
            // Soft has no Rust analogue and degrades to a strong hold.
            ReferenceType::Strong | ReferenceType::Soft => ValueHolder::Strong(value),
        }
    }

    /// The value, if still reachable.
    pub fn get(&self) -> Option<Arc<V>> {
        match self {
            ValueHolder::Strong(value) => Some(Arc::clone(value)),
            ValueHolder::Weak(value) => value.upgrade(),
        }
    }

    /// Whether a weak holder has been cleared.
    pub fn is_collected(&self) -> bool {
        match self {
            ValueHolder::Strong(_) => false,
            ValueHolder::Weak(value) => value.strong_count() == 0,
        }
    }
}

/// State guarded by the node monitor.
pub struct NodeState<V> {
    pub value: ValueHolder<V>,
    /// Hot-path weight, set by the writer that installed the value.
    pub weight: u32,
}

// ============================================================================
// Node
// ============================================================================

/// A cache entry node.
pub struct Node<K, V> {
    key: Arc<K>,
    key_hash: u64,
    state: Mutex<NodeState<V>>,
    lifecycle: AtomicU8,
    region: AtomicU8,
    access_time: AtomicU64,
    write_time: AtomicU64,
    /// Absolute variable-expiry deadline; `u64::MAX` when not expiring.
    variable_time: AtomicU64,
    /// Weight as accounted by the policy; updated only under the eviction
    /// mutex when the corresponding write task drains.
    policy_weight: AtomicU32,
    access_slot: AtomicU32,
    write_slot: AtomicU32,
    timer_slot: AtomicU32,
}

impl<K, V> Node<K, V> {
    pub fn new(key: Arc<K>, key_hash: u64, value: ValueHolder<V>, weight: u32, now: u64) -> Self {
        Self {
            key,
            key_hash,
            state: Mutex::new(NodeState { value, weight }),
            lifecycle: AtomicU8::new(ALIVE),
            region: AtomicU8::new(Region::Window as u8),
            access_time: AtomicU64::new(now),
            write_time: AtomicU64::new(now),
            variable_time: AtomicU64::new(u64::MAX),
            policy_weight: AtomicU32::new(0),
            access_slot: AtomicU32::new(NIL),
            write_slot: AtomicU32::new(NIL),
            timer_slot: AtomicU32::new(NIL),
        }
    }

    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    #[inline]
    pub fn key_arc(&self) -> &Arc<K> {
        &self.key
    }

    #[inline]
    pub fn key_hash(&self) -> u64 {
        self.key_hash
    }

    /// Acquires the node monitor.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, NodeState<V>> {
        self.state.lock()
    }

    /// The value, if alive and reachable.
    pub fn value(&self) -> Option<Arc<V>> {
        self.state.lock().value.get()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == ALIVE
    }

    #[inline]
    pub fn is_retired(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == RETIRED
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == DEAD
    }

    /// Marks the node as unmapped. Callers hold the node monitor.
    #[inline]
    pub fn retire(&self) {
        let _ = self
            .lifecycle
            .compare_exchange(ALIVE, RETIRED, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Marks the node fully unlinked. Callers hold the eviction mutex.
    #[inline]
    pub fn die(&self) {
        self.lifecycle.store(DEAD, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Region and ordering state
    // ------------------------------------------------------------------

    #[inline]
    pub fn region(&self) -> Region {
        match self.region.load(Ordering::Acquire) {
            0 => Region::Window,
            1 => Region::MainProbation,
            _ => Region::MainProtected,
        }
    }

    #[inline]
    pub fn set_region(&self, region: Region) {
        self.region.store(region as u8, Ordering::Release);
    }

    #[inline]
    pub fn access_time(&self) -> u64 {
        self.access_time.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_access_time(&self, now: u64) {
        self.access_time.store(now, Ordering::Release);
    }

    #[inline]
    pub fn write_time(&self) -> u64 {
        self.write_time.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_write_time(&self, now: u64) {
        self.write_time.store(now, Ordering::Release);
    }

    #[inline]
    pub fn variable_time(&self) -> u64 {
        self.variable_time.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_variable_time(&self, deadline: u64) {
        self.variable_time.store(deadline, Ordering::Release);
    }

    #[inline]
    pub fn policy_weight(&self) -> u32 {
        self.policy_weight.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_policy_weight(&self, weight: u32) {
        self.policy_weight.store(weight, Ordering::Release);
    }

    #[inline]
    pub fn access_slot(&self) -> u32 {
        self.access_slot.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_access_slot(&self, slot: u32) {
        self.access_slot.store(slot, Ordering::Release);
    }

    #[inline]
    pub fn write_slot(&self) -> u32 {
        self.write_slot.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_write_slot(&self, slot: u32) {
        self.write_slot.store(slot, Ordering::Release);
    }
}

impl<K, V> WheelEntry for Arc<Node<K, V>> {
    #[inline]
    fn timer_slot(&self) -> u32 {
        self.timer_slot.load(Ordering::Acquire)
    }

    #[inline]
    fn set_timer_slot(&self, slot: u32) {
        self.timer_slot.store(slot, Ordering::Release);
    }
}

// ============================================================================
// Tests
// ============================================================================
