//! SQLite implementation of the response cache.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::debug;

use crate::clock::Clock;
use crate::db::Database;

use super::traits::ResponseCache;

/// Maximum rows deleted per lock hold during cleanup.
pub const CLEANUP_BATCH_SIZE: usize = 500;

/// Response cache stored in the `response_cache` table.
pub struct SqliteResponseCache {
  db: Arc<Database>,
  clock: Arc<dyn Clock>,
}

impl SqliteResponseCache {
  pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
    Self { db, clock }
  }

  fn now_millis(&self) -> i64 {
    self.clock.now().timestamp_millis()
  }

  /// Number of stored entries, expired ones included.
  pub fn len(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM response_cache", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}

impl ResponseCache for SqliteResponseCache {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let now = self.now_millis();
    let conn = self.db.conn()?;
    conn
      .query_row(
        "SELECT value FROM response_cache WHERE key = ? AND expires_at > ?",
        params![key, now],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))
  }

  fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
    let expires_at = self.now_millis() + ttl.num_milliseconds();
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO response_cache (key, value, expires_at) VALUES (?, ?, ?)",
        params![key, value, expires_at],
      )
      .map_err(|e| eyre!("Failed to write cache entry {}: {}", key, e))?;
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute("DELETE FROM response_cache WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete cache entry {}: {}", key, e))?;
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute("DELETE FROM response_cache", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
    Ok(())
  }

  fn cleanup(&self) -> Result<usize> {
    let now = self.now_millis();
    let mut total = 0;

    loop {
      // The connection is released after every batch.
      let removed = {
        let conn = self.db.conn()?;
        conn
          .execute(
            "DELETE FROM response_cache WHERE key IN (
               SELECT key FROM response_cache WHERE expires_at <= ? LIMIT ?
             )",
            params![now, CLEANUP_BATCH_SIZE as i64],
          )
          .map_err(|e| eyre!("Failed to clean up cache: {}", e))?
      };
      total += removed;
      if removed < CLEANUP_BATCH_SIZE {
        break;
      }
    }

    debug!(removed = total, "Response cache cleanup");
    Ok(total)
  }
}
