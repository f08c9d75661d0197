//! Core trait for the response cache.

use chrono::Duration;
use color_eyre::Result;

/// Durable key/value cache with per-entry expiry.
///
/// Expired entries are a miss on read. They stay on disk until the next
/// [`cleanup`](ResponseCache::cleanup).
pub trait ResponseCache: Send + Sync {
  /// Get a value if present and not expired.
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  /// Store a value that expires after `ttl`.
  fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

  /// Remove a single entry.
  fn delete(&self, key: &str) -> Result<()>;

  /// Remove all entries.
  fn clear(&self) -> Result<()>;

  /// Remove expired entries, returning how many were removed.
  fn cleanup(&self) -> Result<usize>;
}

/// Cache that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopCache;

impl ResponseCache for NoopCache {
  fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
    Ok(None) // Always miss
  }

  fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<()> {
    Ok(()) // Discard
  }

  fn delete(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }

  fn cleanup(&self) -> Result<usize> {
    Ok(0)
  }
}
