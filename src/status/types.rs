//! Section status records and the identifiers they are keyed by.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of the entity a section belongs to (an account, or the global singleton).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub i64);

impl OwnerId {
  /// Owner of all global sections.
  pub const GLOBAL: OwnerId = OwnerId(0);

  pub const GLOBAL_NAME: &'static str = "Global";

  pub fn is_global(self) -> bool {
    self == Self::GLOBAL
  }
}

impl fmt::Display for OwnerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Identifier of a tracked kind of data (e.g. "wallet", "skills").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectionId(String);

impl SectionId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<&str> for SectionId {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

impl From<String> for SectionId {
  fn from(s: String) -> Self {
    Self(s)
  }
}

impl fmt::Display for SectionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Which owners a section applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionScope {
  /// One instance per account
  #[default]
  Owner,
  /// A single instance held by [`OwnerId::GLOBAL`]
  Global,
}

impl SectionScope {
  pub fn applies_to(self, owner: OwnerId) -> bool {
    match self {
      Self::Owner => !owner.is_global(),
      Self::Global => owner.is_global(),
    }
  }
}

/// Static description of a section, as registered at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
  pub id: SectionId,
  pub name: String,
  pub scope: SectionScope,
  /// Freshness window after a completed run
  pub timeout: Duration,
}

/// Freshness of one (owner, section) pair.
///
/// Records are always replaced as a whole, never patched in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionStatus {
  pub owner_id: OwnerId,
  pub owner_name: String,
  pub section_id: SectionId,
  pub section_name: String,
  /// Set while a refresh is running
  pub started_at: Option<DateTime<Utc>>,
  /// When the last run finished, successful or not
  pub completed_at: Option<DateTime<Utc>>,
  /// Fingerprint of the last stored payload; empty before the first success
  pub content_hash: String,
  /// Error of the last run; empty when it succeeded or never ran
  pub error_message: String,
  pub timeout: Duration,
}

impl SectionStatus {
  /// A status that has never run.
  pub fn missing(owner_id: OwnerId, owner_name: impl Into<String>, info: &SectionInfo) -> Self {
    Self {
      owner_id,
      owner_name: owner_name.into(),
      section_id: info.id.clone(),
      section_name: info.name.clone(),
      started_at: None,
      completed_at: None,
      content_hash: String::new(),
      error_message: String::new(),
      timeout: info.timeout,
    }
  }

  pub fn key(&self) -> (OwnerId, SectionId) {
    (self.owner_id, self.section_id.clone())
  }

  pub fn is_missing(&self) -> bool {
    self.completed_at.is_none()
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    match self.completed_at {
      None => true,
      Some(completed) => completed
        .checked_add_signed(self.timeout)
        .is_some_and(|fresh_until| now > fresh_until),
    }
  }

  /// Usable data, possibly stale: completed within twice the timeout.
  pub fn is_current(&self, now: DateTime<Utc>) -> bool {
    match self.completed_at {
      None => false,
      Some(completed) => self
        .timeout
        .checked_add(&self.timeout)
        .and_then(|window| completed.checked_add_signed(window))
        .map_or(true, |current_until| now < current_until),
    }
  }

  pub fn is_running(&self) -> bool {
    self.started_at.is_some()
  }

  pub fn is_ok(&self) -> bool {
    self.error_message.is_empty()
  }
}

/// Aggregate counts over a set of statuses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSummary {
  /// Completed with no error on the last run
  pub ok: usize,
  pub running: usize,
  pub total: usize,
}

impl StatusSummary {
  pub fn from_statuses<'a>(statuses: impl IntoIterator<Item = &'a SectionStatus>) -> Self {
    let mut summary = Self::default();
    for status in statuses {
      summary.total += 1;
      if status.is_running() {
        summary.running += 1;
      }
      if !status.is_missing() && status.is_ok() {
        summary.ok += 1;
      }
    }
    summary
  }

  pub fn add(self, other: Self) -> Self {
    Self {
      ok: self.ok + other.ok,
      running: self.running + other.running,
      total: self.total + other.total,
    }
  }

  /// Fraction of sections that are ok, in 0.0..=1.0.
  pub fn progress(&self) -> f32 {
    if self.total == 0 {
      return 0.0;
    }
    self.ok as f32 / self.total as f32
  }

  pub fn is_running(&self) -> bool {
    self.running > 0
  }
}
