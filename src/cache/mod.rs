// # Bounded Caching Engine
//
// A concurrent, in-memory bounded cache built around a Window TinyLFU
// eviction policy with optional time-based expiration and entry weighting.
//
// ## Overview
//
// The engine splits work between lock-free hot paths and a single-writer
// maintenance pass:
//
// - **Hot paths**: `get`, `put`, `remove`, and the compute family operate
//   on the concurrent map and per-entry monitors, publishing events to
//   bounded buffers instead of mutating policy state inline
// - **Maintenance**: a drain loop, serialised by the eviction mutex,
//   batches buffered events into the access/write order queues, evicts to
//   capacity with TinyLFU admission, expires due entries, and adapts the
//   window/main partition from the sampled hit rate
//
// ## Architecture
//
// ```text
// ┌───────────────────────────────────────────────────────────┐
// │                      BoundedCache                         │
// │  ┌──────────────┐  ┌───────────────┐  ┌────────────────┐  │
// │  │ Concurrent   │  │  Read Buffer  │  │  Write Buffer  │  │
// │  │ Map (nodes)  │  │  (lossy ring) │  │  (lossless)    │  │
// │  └──────────────┘  └───────┬───────┘  └───────┬────────┘  │
// │                            └───────┬──────────┘           │
// │                             drain  │  (eviction mutex)    │
// │  ┌─────────────────────────────────▼─────────────────────┐│
// │  │ Window │ Main Probation │ Main Protected │ TimerWheel ││
// │  │   frequency sketch · hill climber · pacer             ││
// │  └───────────────────────────────────────────────────────┘│
// └───────────────────────────────────────────────────────────┘
// ```
//
// ## Guarantees
//
// - A successful `put(k, v)` happens-before a subsequent `get(k)` that
//   returns `v`; values are never stale, only recency may be
// - The weighted size never exceeds the maximum after a completed drain,
//   unless a single entry alone exceeds it (then that entry is evicted)
// - Listener notifications fire exactly once per departure, with a cause

pub mod bounded;
pub mod node;
pub mod policy;

pub use bounded::BoundedCache;
pub use node::Region;
