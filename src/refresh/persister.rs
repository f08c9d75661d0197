//! Change-gated persistence of fetched section data.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::status::OwnerId;

use super::error::RefreshError;
use super::section::SectionHandler;

/// Stable fingerprint of normalized section data.
///
/// Semantically identical payloads hash identically: object keys are
/// sorted, integral floats are written as integers and RFC 3339 timestamps
/// are normalized to UTC.
pub fn fingerprint(data: &Value) -> String {
  let canonical = canonicalize(data);
  let mut hasher = Sha256::new();
  hasher.update(canonical.to_string().as_bytes());
  hex::encode(hasher.finalize())
}

fn canonicalize(value: &Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      let mut sorted = Map::new();
      for key in keys {
        sorted.insert(key.clone(), canonicalize(&map[key]));
      }
      Value::Object(sorted)
    }
    Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
    Value::Number(n) => Value::Number(canonical_number(n)),
    Value::String(s) => Value::String(canonical_timestamp(s).unwrap_or_else(|| s.clone())),
    other => other.clone(),
  }
}

fn canonical_number(n: &Number) -> Number {
  match n.as_f64() {
    Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
      Number::from(f as i64)
    }
    _ => n.clone(),
  }
}

fn canonical_timestamp(s: &str) -> Option<String> {
  DateTime::parse_from_rfc3339(s)
    .ok()
    .map(|dt| dt.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Outcome of [`ChangeGatedPersister::persist_if_changed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistOutcome {
  /// Data differed from the previous run and was written
  pub changed: bool,
  /// Fingerprint of the data just fetched
  pub content_hash: String,
}

/// Writes fetched data only when its fingerprint differs from the stored one.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeGatedPersister;

impl ChangeGatedPersister {
  pub async fn persist_if_changed(
    &self,
    handler: &dyn SectionHandler,
    owner: OwnerId,
    data: Value,
    prior_hash: &str,
  ) -> Result<PersistOutcome, RefreshError> {
    let content_hash = fingerprint(&data);
    if content_hash == prior_hash {
      debug!(owner = %owner, "Section data unchanged, skipping write");
      return Ok(PersistOutcome {
        changed: false,
        content_hash,
      });
    }

    handler
      .persist(owner, data)
      .await
      .map_err(|e| RefreshError::Persist(e.to_string()))?;

    Ok(PersistOutcome {
      changed: true,
      content_hash,
    })
  }
}
