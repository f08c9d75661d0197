//! Persistent response cache.
//!
//! This module provides a durable key/value cache for raw remote responses:
//! - Entries carry an expiry; expired entries are a miss on read
//! - Expired entries are removed lazily by a periodic background sweep
//! - Prefixed layers let several users share one backing table

mod layer;
mod storage;
mod sweeper;
mod traits;

pub use layer::CacheLayer;
pub use storage::{SqliteResponseCache, CLEANUP_BATCH_SIZE};
pub use sweeper::{CacheSweeper, SweeperHandle, DEFAULT_SWEEP_INTERVAL};
pub use traits::{NoopCache, ResponseCache};
