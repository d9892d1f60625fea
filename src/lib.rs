// RustyCache - Concurrent in-memory bounded cache
// Core library module

pub mod buffer;
pub mod cache;
pub mod common;
pub mod deque;
pub mod error;
pub mod pacer;
pub mod sketch;
pub mod stats;
pub mod timer;

pub use cache::BoundedCache;
pub use common::{
    CacheConfig, DirectExecutor, Executor, Expiry, ReferenceType, RemovalCause, RemovalListener,
    ScheduledHandle, Scheduler, SystemTicker, ThreadScheduler, Ticker, UnitWeigher, Weigher,
};
pub use error::{CacheError, Result};
pub use stats::CacheStats;
