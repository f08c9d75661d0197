//! SQLite storage for statuses, section payloads and cached responses.

mod schema;
mod section_store;
mod status_store;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub use section_store::SectionDataStore;
pub use status_store::{Owner, SqliteStatusStore, StatusStore, StoredStatus};

/// Database connection wrapper shared by all stores.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at the default location
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the database at `path`
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Private database, used by tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("mirrorsync.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Lock the connection.
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Directory holding the database and logs.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("mirrorsync"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_open_creates_parent_directory() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let path = dir.path().join("nested").join("mirror.db");

    let db = Database::open(&path).expect("Open should succeed");
    drop(db);

    assert!(path.exists(), "Database file should exist");
  }

  #[test]
  fn test_migrations_are_idempotent() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let path = dir.path().join("mirror.db");

    Database::open(&path).expect("First open should succeed");
    Database::open(&path).expect("Second open should succeed");
  }
}
