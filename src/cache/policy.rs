// # Eviction Policy State - Regions, Admission, and Adaptation
//
// The mutable policy state of a bounded cache: the three access-ordered
// regions of the W-TinyLFU layout, the write-order queue, the timer wheel,
// the frequency sketch, the pacer, and the hill climber that repartitions
// the window/main split from the sampled hit rate.
//
// Everything here is guarded by the eviction mutex; only the drain thread
// mutates it.

use crate::cache::node::{Node, Region};
use crate::common::{PERCENT_MAIN, PERCENT_MAIN_PROTECTED};
use crate::deque::{LinkedDeque, NIL};
use crate::pacer::Pacer;
use crate::sketch::FrequencySketch;
use crate::timer::{TimerWheel, WheelEntry};
use std::sync::Arc;

/// Sentinel for an unbounded cache.
pub const UNBOUNDED: u64 = u64::MAX;

/// Admission floor below which a candidate is rejected outright rather
/// than given a random chance, to blunt hash-flooding.
const ADMIT_HASHDOS_THRESHOLD: u32 = 6;

/// Largest number of entries moved between regions in one rebalancing
/// pass, bounding the time under the eviction mutex.
const QUEUE_TRANSFER_THRESHOLD: usize = 1_000;

/// Hill climber restart threshold: a hit-rate swing at least this large
/// resets the step to its base amplitude.
const HILL_CLIMBER_RESTART_THRESHOLD: f64 = 0.05;

/// Base step amplitude as a fraction of the maximum.
const HILL_CLIMBER_STEP_PERCENT: f64 = 0.062_5;

/// Decay applied to the step while the hit rate keeps improving slowly.
const HILL_CLIMBER_STEP_DECAY_RATE: f64 = 0.98;

type NodeRef<K, V> = Arc<Node<K, V>>;

/// Policy state guarded by the eviction mutex.
pub struct PolicyState<K, V> {
    pub window: LinkedDeque<NodeRef<K, V>>,
    pub probation: LinkedDeque<NodeRef<K, V>>,
    pub protected: LinkedDeque<NodeRef<K, V>>,
    pub write_order: LinkedDeque<NodeRef<K, V>>,
    pub timer_wheel: TimerWheel<NodeRef<K, V>>,
    pub sketch: FrequencySketch,
    pub pacer: Pacer,

    pub maximum: u64,
    pub window_maximum: u64,
    pub main_protected_maximum: u64,
    pub weighted_size: u64,
    pub window_weighted_size: u64,
    pub main_protected_weighted_size: u64,

    step_size: f64,
    previous_sample_hit_rate: f64,
    pub hits_in_sample: u64,
    pub misses_in_sample: u64,
}

impl<K, V> PolicyState<K, V> {
    pub fn new(maximum: Option<u64>) -> Self {
        let mut state = Self {
            window: LinkedDeque::new(),
            probation: LinkedDeque::new(),
            protected: LinkedDeque::new(),
            write_order: LinkedDeque::new(),
            timer_wheel: TimerWheel::new(),
            sketch: FrequencySketch::new(),
            pacer: Pacer::new(),
            maximum: UNBOUNDED,
            window_maximum: UNBOUNDED,
            main_protected_maximum: UNBOUNDED,
            weighted_size: 0,
            window_weighted_size: 0,
            main_protected_weighted_size: 0,
            step_size: 0.0,
            previous_sample_hit_rate: 0.0,
            hits_in_sample: 0,
            misses_in_sample: 0,
        };
        if let Some(maximum) = maximum {
            state.set_maximum(maximum);
        }
        state
    }

    /// Whether the cache evicts on size.
    #[inline]
    pub fn evicts(&self) -> bool {
        self.maximum != UNBOUNDED
    }

    /// Repartitions for a new capacity bound: the window receives the
    /// share left over by the main space, the protected region its fixed
    /// fraction of main, and the sketch and climber are resized.
    pub fn set_maximum(&mut self, maximum: u64) {
        self.maximum = maximum;
        let main = (maximum as f64 * PERCENT_MAIN) as u64;
        self.window_maximum = maximum - main;
        self.main_protected_maximum = (main as f64 * PERCENT_MAIN_PROTECTED) as u64;
        self.step_size = HILL_CLIMBER_STEP_PERCENT * maximum as f64;
        self.previous_sample_hit_rate = 0.0;
        self.hits_in_sample = 0;
        self.misses_in_sample = 0;
        self.sketch.ensure_capacity(maximum);
    }

    // ------------------------------------------------------------------
    // Access reordering and promotion
    // ------------------------------------------------------------------

    /// Applies one drained read event: bump the frequency, reorder within
    /// the region, and promote probation hits into the protected region.
    pub fn on_access(&mut self, node: &NodeRef<K, V>, variable_expiry: bool) {
        self.sketch.increment(node.key_hash());
        self.hits_in_sample += 1;

        if !node.is_alive() {
            return;
        }
        let slot = node.access_slot();
        if slot == NIL {
            // Published to the read buffer before the add task drained.
            return;
        }
        match node.region() {
            Region::Window => self.window.move_to_back(slot),
            Region::MainProbation => {
                if self.evicts() && u64::from(node.policy_weight()) > self.main_protected_maximum
                {
                    // Too heavy for the protected region; stays put.
                    self.probation.move_to_back(slot);
                } else {
                    self.probation.remove(slot);
                    let new_slot = self.protected.push_back(Arc::clone(node));
                    node.set_access_slot(new_slot);
                    node.set_region(Region::MainProtected);
                    self.main_protected_weighted_size += u64::from(node.policy_weight());
                }
            }
            Region::MainProtected => self.protected.move_to_back(slot),
        }

        if variable_expiry {
            let timer = WheelEntry::timer_slot(node);
            if timer != NIL {
                self.timer_wheel.reschedule(timer, node.variable_time());
            }
        }
    }

    // ------------------------------------------------------------------
    // Region rebalancing
    // ------------------------------------------------------------------

    /// Moves window overflow into probation as admission candidates.
    /// Returns how many candidates were transferred.
    pub fn evict_from_window(&mut self) -> usize {
        let mut candidates = 0;
        while self.window_weighted_size > self.window_maximum {
            let Some(node) = self.window.peek_front().cloned() else {
                break;
            };
            self.window.remove(node.access_slot());
            let slot = self.probation.push_back(Arc::clone(&node));
            node.set_access_slot(slot);
            node.set_region(Region::MainProbation);
            self.window_weighted_size = self
                .window_weighted_size
                .saturating_sub(u64::from(node.policy_weight()));
            candidates += 1;
        }
        candidates
    }

    /// Demotes protected overflow back to probation, bounded per pass.
    pub fn demote_from_main_protected(&mut self) {
        let mut demoted = 0;
        while self.main_protected_weighted_size > self.main_protected_maximum {
            let Some(node) = self.protected.peek_front().cloned() else {
                break;
            };
            self.protected.remove(node.access_slot());
            let slot = self.probation.push_back(Arc::clone(&node));
            node.set_access_slot(slot);
            node.set_region(Region::MainProbation);
            self.main_protected_weighted_size = self
                .main_protected_weighted_size
                .saturating_sub(u64::from(node.policy_weight()));
            demoted += 1;
            if demoted >= QUEUE_TRANSFER_THRESHOLD {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// TinyLFU admission: keep the candidate only if it is estimated to be
    /// more popular than the victim. Moderately popular candidates get a
    /// rare random pass so a warm victim cannot starve the window forever.
    pub fn admit(&self, candidate_hash: u64, victim_hash: u64) -> bool {
        let victim_freq = self.sketch.frequency(victim_hash);
        let candidate_freq = self.sketch.frequency(candidate_hash);
        if candidate_freq > victim_freq {
            true
        } else if candidate_freq < ADMIT_HASHDOS_THRESHOLD {
            false
        } else {
            (rand::random::<u32>() & 127) == 0
        }
    }

    // ------------------------------------------------------------------
    // Unlinking and weight accounting
    // ------------------------------------------------------------------

    /// Removes the node from every order structure it participates in.
    /// Idempotent; slots already cleared are skipped.
    pub fn unlink(&mut self, node: &NodeRef<K, V>) {
        let slot = node.access_slot();
        if slot != NIL {
            let removed = match node.region() {
                Region::Window => self.window.remove(slot),
                Region::MainProbation => self.probation.remove(slot),
                Region::MainProtected => self.protected.remove(slot),
            };
            debug_assert!(removed.map_or(true, |n| Arc::ptr_eq(&n, node)));
            node.set_access_slot(NIL);
        }
        let slot = node.write_slot();
        if slot != NIL {
            self.write_order.remove(slot);
            node.set_write_slot(NIL);
        }
        let slot = WheelEntry::timer_slot(node);
        if slot != NIL {
            self.timer_wheel.deschedule(slot);
        }
    }

    /// Subtracts a departing node's weight from the region accounting.
    /// Callers pass the region the node occupied when unlinked.
    pub fn subtract_weight(&mut self, region: Region, weight: u32) {
        let weight = u64::from(weight);
        self.weighted_size = self.weighted_size.saturating_sub(weight);
        match region {
            Region::Window => {
                self.window_weighted_size = self.window_weighted_size.saturating_sub(weight);
            }
            Region::MainProtected => {
                self.main_protected_weighted_size =
                    self.main_protected_weighted_size.saturating_sub(weight);
            }
            Region::MainProbation => {}
        }
    }

    // ------------------------------------------------------------------
    // Hill climber
    // ------------------------------------------------------------------

    /// Adapts the window/main split from the sampled hit rate, then
    /// restores the protected bound.
    pub fn climb(&mut self) {
        if !self.evicts() {
            return;
        }
        let adjustment = self.determine_adjustment();
        if adjustment == 0 {
            return;
        }
        if adjustment > 0 {
            self.increase_window(adjustment as u64);
        } else {
            self.decrease_window(adjustment.unsigned_abs());
        }
        self.demote_from_main_protected();
    }

    /// One climber step: compare this sample's hit rate with the previous
    /// one; keep direction while improving, flip and halve on regression,
    /// restart the amplitude on a large swing.
    fn determine_adjustment(&mut self) -> i64 {
        if self.sketch.is_not_initialized() {
            self.previous_sample_hit_rate = 0.0;
            self.hits_in_sample = 0;
            self.misses_in_sample = 0;
            return 0;
        }
        let requests = self.hits_in_sample + self.misses_in_sample;
        if requests < self.sketch.sample_size() {
            return 0;
        }
        let hit_rate = self.hits_in_sample as f64 / requests as f64;
        let delta = hit_rate - self.previous_sample_hit_rate;
        if delta < 0.0 {
            self.step_size = -(self.step_size / 2.0);
        } else if delta.abs() >= HILL_CLIMBER_RESTART_THRESHOLD {
            self.step_size =
                HILL_CLIMBER_STEP_PERCENT * self.maximum as f64 * self.step_size.signum();
        } else {
            self.step_size *= HILL_CLIMBER_STEP_DECAY_RATE;
        }
        self.previous_sample_hit_rate = hit_rate;
        self.hits_in_sample = 0;
        self.misses_in_sample = 0;
        self.step_size as i64
    }

    fn increase_window(&mut self, amount: u64) {
        let quota = amount.min(self.maximum - self.window_maximum);
        self.window_maximum += quota;
        self.recompute_protected_maximum();
    }

    fn decrease_window(&mut self, amount: u64) {
        let quota = amount.min(self.window_maximum);
        self.window_maximum -= quota;
        self.recompute_protected_maximum();
    }

    fn recompute_protected_maximum(&mut self) {
        let main = self.maximum - self.window_maximum;
        self.main_protected_maximum = (main as f64 * PERCENT_MAIN_PROTECTED) as u64;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::node::ValueHolder;
    use crate::common::ReferenceType;

    fn state(maximum: u64) -> PolicyState<u32, u32> {
        PolicyState::new(Some(maximum))
    }

    fn node(key: u32, weight: u32) -> NodeRef<u32, u32> {
        Arc::new(Node::new(
            Arc::new(key),
            u64::from(key),
            ValueHolder::new(Arc::new(key), ReferenceType::Strong),
            weight,
            0,
        ))
    }

    /// Links a node into the window the way the add task does.
    fn add_to_window(state: &mut PolicyState<u32, u32>, node: &NodeRef<u32, u32>) {
        node.set_policy_weight(1);
        state.weighted_size += 1;
        state.window_weighted_size += 1;
        let slot = state.window.push_back(Arc::clone(node));
        node.set_access_slot(slot);
        node.set_region(Region::Window);
    }

    #[test]
    fn test_partitioning_for_maximum() {
        let state = state(100);
        assert_eq!(state.window_maximum, 1);
        assert_eq!(state.main_protected_maximum, 79);
        assert!(state.evicts());
    }

    #[test]
    fn test_unbounded_does_not_evict() {
        let state: PolicyState<u32, u32> = PolicyState::new(None);
        assert!(!state.evicts());
    }

    #[test]
    fn test_window_overflow_produces_candidates() {
        let mut state = state(10);
        let a = node(1, 1);
        let b = node(2, 1);
        add_to_window(&mut state, &a);
        add_to_window(&mut state, &b);

        let candidates = state.evict_from_window();
        assert_eq!(candidates, 1);
        assert_eq!(a.region(), Region::MainProbation);
        assert_eq!(b.region(), Region::Window);
        assert_eq!(state.window_weighted_size, 1);
        assert_eq!(state.probation.len(), 1);
    }

    #[test]
    fn test_access_promotes_probation_to_protected() {
        let mut state = state(10);
        let a = node(1, 1);
        let b = node(2, 1);
        add_to_window(&mut state, &a);
        add_to_window(&mut state, &b);
        state.evict_from_window();

        state.on_access(&a, false);
        assert_eq!(a.region(), Region::MainProtected);
        assert_eq!(state.protected.len(), 1);
        assert_eq!(state.main_protected_weighted_size, 1);
    }

    #[test]
    fn test_protected_overflow_demotes() {
        let mut state = state(10);
        state.window_maximum = 0;
        state.main_protected_maximum = 1;
        for key in 0..3 {
            let n = node(key, 1);
            add_to_window(&mut state, &n);
            state.evict_from_window();
            state.on_access(&n, false);
        }
        assert_eq!(state.protected.len(), 3);

        state.demote_from_main_protected();
        assert_eq!(state.protected.len(), 1);
        assert_eq!(state.probation.len(), 2);
        assert_eq!(state.main_protected_weighted_size, 1);
    }

    #[test]
    fn test_admission_prefers_higher_frequency() {
        let mut state = state(64);
        for _ in 0..8 {
            state.sketch.increment(1);
        }
        state.sketch.increment(2);

        assert!(state.admit(1, 2), "popular candidate wins");
        assert!(!state.admit(2, 1), "rare candidate loses");
    }

    #[test]
    fn test_climber_flips_direction_on_regression() {
        let mut state = state(100);
        let sample = state.sketch.sample_size();

        // First sample: strong hit rate establishes a baseline.
        state.hits_in_sample = sample;
        state.misses_in_sample = 0;
        let first = state.determine_adjustment();
        assert!(first > 0);
        let window_before = state.window_maximum;
        state.increase_window(first as u64);
        assert!(state.window_maximum > window_before);

        // Second sample: regression flips and halves the step.
        state.hits_in_sample = 0;
        state.misses_in_sample = sample;
        let second = state.determine_adjustment();
        assert!(second < 0);
        assert!(second.unsigned_abs() <= (first.unsigned_abs() / 2).max(1));
    }

    #[test]
    fn test_unlink_is_idempotent() {
        let mut state = state(10);
        let a = node(1, 1);
        add_to_window(&mut state, &a);

        state.unlink(&a);
        assert_eq!(state.window.len(), 0);
        assert_eq!(a.access_slot(), NIL);

        state.unlink(&a);
        assert_eq!(state.window.len(), 0);
    }
}
