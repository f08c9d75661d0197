//! Namespaced view over a response cache.

use chrono::Duration;
use color_eyre::Result;
use std::sync::Arc;

use super::traits::ResponseCache;

/// Cache layer that prefixes every key and applies a default TTL.
///
/// Lets several users share one backing cache without key collisions,
/// e.g. the HTTP transport stores its bodies under `http:`.
#[derive(Clone)]
pub struct CacheLayer {
  cache: Arc<dyn ResponseCache>,
  prefix: String,
  /// Expiry used by [`CacheLayer::put`]
  default_ttl: Duration,
}

impl CacheLayer {
  /// Create a new cache layer over the given backend.
  pub fn new(cache: Arc<dyn ResponseCache>, prefix: impl Into<String>) -> Self {
    Self {
      cache,
      prefix: prefix.into(),
      default_ttl: Duration::hours(24),
    }
  }

  /// Set the default TTL.
  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  fn key(&self, key: &str) -> String {
    format!("{}{}", self.prefix, key)
  }

  pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    self.cache.get(&self.key(key))
  }

  /// Store with the default TTL.
  pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
    self.cache.set(&self.key(key), value, self.default_ttl)
  }

  pub fn delete(&self, key: &str) -> Result<()> {
    self.cache.delete(&self.key(key))
  }
}
