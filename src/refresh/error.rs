use thiserror::Error;

use crate::status::{OwnerId, SectionId};

/// Errors returned by a section refresh.
///
/// Cloneable, since one shared refresh hands the same result to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
  /// The remote call failed (network, status or decode).
  #[error("{0}")]
  Fetch(String),

  /// Writing the fetched data failed.
  #[error("{0}")]
  Persist(String),

  /// The section is not registered or does not apply to this owner.
  #[error("invalid section {section} for owner {owner}")]
  InvalidSection { owner: OwnerId, section: SectionId },

  /// The owner is not registered, or was deleted during the refresh.
  #[error("unknown owner {0}")]
  UnknownOwner(OwnerId),

  /// The caller's cancellation signal fired.
  #[error("refresh cancelled")]
  Cancelled,

  /// The refresh task died before producing a result.
  #[error("refresh aborted: {0}")]
  Aborted(String),
}

impl RefreshError {
  pub fn is_cancelled(&self) -> bool {
    matches!(self, Self::Cancelled)
  }
}
