//! Durable section statuses and owners.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use std::sync::Arc;

use crate::status::{OwnerId, SectionId, SectionStatus};

use super::Database;

/// An account as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
  pub id: OwnerId,
  pub name: String,
}

/// The persisted part of a [`SectionStatus`].
///
/// Names and timeouts come from the section catalog, not from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredStatus {
  pub section_id: SectionId,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub content_hash: String,
  pub error_message: String,
}

/// Durable listings used to seed the status registry.
pub trait StatusStore: Send + Sync {
  /// All account owners.
  fn list_owners(&self) -> Result<Vec<Owner>>;

  /// Create or rename an owner.
  fn save_owner(&self, id: OwnerId, name: &str) -> Result<()>;

  /// Delete an owner with all its statuses and section data.
  fn delete_owner(&self, id: OwnerId) -> Result<()>;

  /// Stored statuses of one owner.
  fn list_statuses(&self, owner: OwnerId) -> Result<Vec<StoredStatus>>;

  /// Upsert a status.
  fn save_status(&self, status: &SectionStatus) -> Result<()>;
}

/// SQLite-backed [`StatusStore`].
#[derive(Clone)]
pub struct SqliteStatusStore {
  db: Arc<Database>,
}

impl SqliteStatusStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl StatusStore for SqliteStatusStore {
  fn list_owners(&self) -> Result<Vec<Owner>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT id, name FROM owners ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let owners = stmt
      .query_map([], |row| {
        Ok(Owner {
          id: OwnerId(row.get(0)?),
          name: row.get(1)?,
        })
      })
      .map_err(|e| eyre!("Failed to list owners: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read owner: {}", e))?;

    Ok(owners)
  }

  fn save_owner(&self, id: OwnerId, name: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT INTO owners (id, name) VALUES (?, ?)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        params![id.0, name],
      )
      .map_err(|e| eyre!("Failed to save owner {}: {}", id, e))?;
    Ok(())
  }

  fn delete_owner(&self, id: OwnerId) -> Result<()> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for sql in [
      "DELETE FROM section_status WHERE owner_id = ?",
      "DELETE FROM section_data WHERE owner_id = ?",
      "DELETE FROM owners WHERE id = ?",
    ] {
      tx.execute(sql, params![id.0])
        .map_err(|e| eyre!("Failed to delete owner {}: {}", id, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn list_statuses(&self, owner: OwnerId) -> Result<Vec<StoredStatus>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT section_id, started_at, completed_at, content_hash, error_message
         FROM section_status WHERE owner_id = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![owner.0], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, Option<String>>(1)?,
          row.get::<_, Option<String>>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, String>(4)?,
        ))
      })
      .map_err(|e| eyre!("Failed to list statuses: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read status: {}", e))?;

    rows
      .into_iter()
      .map(
        |(section_id, started_at, completed_at, content_hash, error_message)| {
          Ok(StoredStatus {
            section_id: SectionId::new(section_id),
            started_at: started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: completed_at.as_deref().map(parse_datetime).transpose()?,
            content_hash,
            error_message,
          })
        },
      )
      .collect()
  }

  fn save_status(&self, status: &SectionStatus) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO section_status
           (owner_id, section_id, started_at, completed_at, content_hash, error_message)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          status.owner_id.0,
          status.section_id.as_str(),
          status.started_at.map(format_datetime),
          status.completed_at.map(format_datetime),
          status.content_hash,
          status.error_message,
        ],
      )
      .map_err(|e| {
        eyre!(
          "Failed to save status {}/{}: {}",
          status.owner_id,
          status.section_id,
          e
        )
      })?;
    Ok(())
  }
}

pub(crate) fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse a datetime string as written by [`format_datetime`].
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  fn store() -> SqliteStatusStore {
    SqliteStatusStore::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  fn status(owner: i64, section: &str) -> SectionStatus {
    SectionStatus {
      owner_id: OwnerId(owner),
      owner_name: String::new(),
      section_id: section.into(),
      section_name: String::new(),
      started_at: None,
      completed_at: Some(Utc::now()),
      content_hash: "hash".to_string(),
      error_message: String::new(),
      timeout: Duration::minutes(5),
    }
  }

  #[test]
  fn test_save_owner_upserts() {
    let store = store();
    store.save_owner(OwnerId(1), "Alice").unwrap();
    store.save_owner(OwnerId(2), "Bob").unwrap();
    store.save_owner(OwnerId(1), "Zed").unwrap();

    let owners = store.list_owners().unwrap();
    assert_eq!(
      owners,
      vec![
        Owner {
          id: OwnerId(2),
          name: "Bob".to_string()
        },
        Owner {
          id: OwnerId(1),
          name: "Zed".to_string()
        },
      ]
    );
  }

  #[test]
  fn test_save_status_roundtrips_timestamps() {
    let store = store();
    let saved = status(1, "wallet");
    store.save_status(&saved).unwrap();

    let listed = store.list_statuses(OwnerId(1)).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].section_id, saved.section_id);
    assert_eq!(listed[0].completed_at, saved.completed_at);
    assert_eq!(listed[0].started_at, None);
    assert_eq!(listed[0].content_hash, "hash");
  }

  #[test]
  fn test_save_status_replaces() {
    let store = store();
    let mut saved = status(1, "wallet");
    store.save_status(&saved).unwrap();
    saved.error_message = "boom".to_string();
    store.save_status(&saved).unwrap();

    let listed = store.list_statuses(OwnerId(1)).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].error_message, "boom");
  }

  #[test]
  fn test_delete_owner_removes_statuses() {
    let store = store();
    store.save_owner(OwnerId(1), "Alice").unwrap();
    store.save_status(&status(1, "wallet")).unwrap();
    store.save_status(&status(2, "wallet")).unwrap();

    store.delete_owner(OwnerId(1)).unwrap();

    assert!(store.list_owners().unwrap().is_empty());
    assert!(store.list_statuses(OwnerId(1)).unwrap().is_empty());
    assert_eq!(store.list_statuses(OwnerId(2)).unwrap().len(), 1);
  }
}
