//! Keeping sections fresh.
//!
//! [`SectionUpdater`] is the entry point: it checks a section's status,
//! runs at most one refresh per section through the [`Coordinator`], writes
//! fetched data through the [`ChangeGatedPersister`] and records the outcome
//! in the status registry.

mod coordinator;
mod error;
mod paging;
mod persister;
mod section;
mod updater;

pub use coordinator::Coordinator;
pub use error::RefreshError;
pub use paging::{fetch_all_pages, Page};
pub use persister::{fingerprint, ChangeGatedPersister, PersistOutcome};
pub use section::{Section, SectionHandler, SectionTable, TypedSection};
pub use updater::{RefreshKey, SectionUpdater};
