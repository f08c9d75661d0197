//! Section freshness tracking.
//!
//! A [`SectionStatus`] describes how fresh the local copy of one section of
//! one owner is. The [`StatusRegistry`] holds all of them in memory and is
//! the source of truth for staleness queries.

mod registry;
mod types;

pub use registry::StatusRegistry;
pub use types::{OwnerId, SectionId, SectionInfo, SectionScope, SectionStatus, StatusSummary};
