//! Latest payload per owner and section.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::sync::Arc;

use crate::status::{OwnerId, SectionId};

use super::status_store::format_datetime;
use super::Database;

/// Stores section payloads as JSON, one row per owner and section.
#[derive(Clone)]
pub struct SectionDataStore {
  db: Arc<Database>,
}

impl SectionDataStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Insert or replace the payload. Writing the same data twice is harmless.
  pub fn upsert(&self, owner: OwnerId, section: &SectionId, data: &Value) -> Result<()> {
    let bytes = serde_json::to_vec(data).map_err(|e| eyre!("Failed to serialize data: {}", e))?;
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO section_data (owner_id, section_id, data, updated_at)
         VALUES (?, ?, ?, ?)",
        params![owner.0, section.as_str(), bytes, format_datetime(Utc::now())],
      )
      .map_err(|e| eyre!("Failed to store {} data for {}: {}", section, owner, e))?;
    Ok(())
  }

  pub fn get(&self, owner: OwnerId, section: &SectionId) -> Result<Option<Value>> {
    let conn = self.db.conn()?;
    let bytes: Option<Vec<u8>> = conn
      .query_row(
        "SELECT data FROM section_data WHERE owner_id = ? AND section_id = ?",
        params![owner.0, section.as_str()],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to load {} data for {}: {}", section, owner, e))?;

    bytes
      .map(|b| serde_json::from_slice(&b).map_err(|e| eyre!("Failed to parse stored data: {}", e)))
      .transpose()
  }
}
