//! In-memory registry of section statuses.

use color_eyre::Result;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::db::StatusStore;

use super::types::{OwnerId, SectionId, SectionInfo, SectionStatus, StatusSummary};

#[derive(Default)]
struct Inner {
  owners: HashMap<OwnerId, String>,
  statuses: HashMap<(OwnerId, SectionId), SectionStatus>,
}

/// Concurrency-safe map of every known [`SectionStatus`].
///
/// Many readers, occasional writers. Writers always swap in a complete
/// record, so readers never see a half-updated status.
pub struct StatusRegistry {
  catalog: Vec<SectionInfo>,
  inner: RwLock<Inner>,
}

impl StatusRegistry {
  /// Create an empty registry for the given sections.
  pub fn new(catalog: Vec<SectionInfo>) -> Self {
    let mut inner = Inner::default();
    inner
      .owners
      .insert(OwnerId::GLOBAL, OwnerId::GLOBAL_NAME.to_string());
    Self {
      catalog,
      inner: RwLock::new(inner),
    }
  }

  /// Rebuild the registry from durable storage.
  ///
  /// Stored run markers are dropped: nothing is running right after startup.
  pub fn load(catalog: Vec<SectionInfo>, store: &dyn StatusStore) -> Result<Self> {
    let registry = Self::new(catalog);
    let owners = store.list_owners()?;
    let mut loaded = 0usize;

    {
      let mut inner = registry.write();
      for owner in &owners {
        inner.owners.insert(owner.id, owner.name.clone());
      }

      let owner_ids = inner.owners.keys().copied().collect::<Vec<_>>();
      for owner_id in owner_ids {
        let owner_name = inner.owners.get(&owner_id).cloned().unwrap_or_default();
        for stored in store.list_statuses(owner_id)? {
          let Some(info) = registry.info(&stored.section_id) else {
            debug!(owner = %owner_id, section = %stored.section_id, "Skipping status of unknown section");
            continue;
          };
          let status = SectionStatus {
            owner_id,
            owner_name: owner_name.clone(),
            section_id: info.id.clone(),
            section_name: info.name.clone(),
            started_at: None,
            completed_at: stored.completed_at,
            content_hash: stored.content_hash,
            error_message: stored.error_message,
            timeout: info.timeout,
          };
          inner.statuses.insert(status.key(), status);
          loaded += 1;
        }
      }
    }

    info!(owners = owners.len(), statuses = loaded, "Status registry loaded");
    Ok(registry)
  }

  fn read(&self) -> RwLockReadGuard<'_, Inner> {
    self.inner.read().unwrap_or_else(|e| e.into_inner())
  }

  fn write(&self) -> RwLockWriteGuard<'_, Inner> {
    self.inner.write().unwrap_or_else(|e| e.into_inner())
  }

  /// Registered sections.
  pub fn catalog(&self) -> &[SectionInfo] {
    &self.catalog
  }

  pub fn info(&self, section: &SectionId) -> Option<&SectionInfo> {
    self.catalog.iter().find(|info| &info.id == section)
  }

  /// Replace the record for the status' key.
  pub fn set(&self, status: SectionStatus) {
    self.write().statuses.insert(status.key(), status);
  }

  pub fn get(&self, owner: OwnerId, section: &SectionId) -> Option<SectionStatus> {
    self
      .read()
      .statuses
      .get(&(owner, section.clone()))
      .cloned()
  }

  /// The stored status, or a zero-valued one when the section never ran.
  ///
  /// Returns `None` only for sections missing from the catalog.
  pub fn status_or_missing(&self, owner: OwnerId, section: &SectionId) -> Option<SectionStatus> {
    let info = self.info(section)?;
    let inner = self.read();
    let status = match inner.statuses.get(&(owner, section.clone())) {
      Some(status) => status.clone(),
      None => {
        let owner_name = inner.owners.get(&owner).cloned().unwrap_or_default();
        SectionStatus::missing(owner, owner_name, info)
      }
    };
    Some(status)
  }

  /// Atomically derive a new record from the current one and store it.
  ///
  /// Returns the stored record, or `None` when the section is missing from
  /// the catalog or the owner is unknown. Nothing is stored in that case.
  pub fn modify<F>(&self, owner: OwnerId, section: &SectionId, f: F) -> Option<SectionStatus>
  where
    F: FnOnce(&mut SectionStatus),
  {
    let info = self.info(section)?;
    let mut inner = self.write();
    let owner_name = inner.owners.get(&owner)?.clone();
    let mut status = match inner.statuses.get(&(owner, section.clone())) {
      Some(status) => status.clone(),
      None => SectionStatus::missing(owner, owner_name, info),
    };
    f(&mut status);
    inner.statuses.insert(status.key(), status.clone());
    Some(status)
  }

  /// Statuses of every section that applies to this owner, ordered by section name.
  pub fn list_for_owner(&self, owner: OwnerId) -> Vec<SectionStatus> {
    let inner = self.read();
    let owner_name = inner.owners.get(&owner).cloned().unwrap_or_default();
    let mut list: Vec<SectionStatus> = self
      .catalog
      .iter()
      .filter(|info| info.scope.applies_to(owner))
      .map(|info| match inner.statuses.get(&(owner, info.id.clone())) {
        Some(status) => status.clone(),
        None => SectionStatus::missing(owner, owner_name.clone(), info),
      })
      .collect();
    list.sort_by(|a, b| a.section_name.cmp(&b.section_name));
    list
  }

  pub fn summary(&self, owner: OwnerId) -> StatusSummary {
    StatusSummary::from_statuses(&self.list_for_owner(owner))
  }

  /// Summary over every known owner, global sections included.
  pub fn summary_all(&self) -> StatusSummary {
    let owners = self.read().owners.keys().copied().collect::<Vec<_>>();
    owners
      .into_iter()
      .map(|owner| self.summary(owner))
      .fold(StatusSummary::default(), StatusSummary::add)
  }

  /// Add or rename an owner.
  pub fn set_owner(&self, owner: OwnerId, name: impl Into<String>) {
    let name = name.into();
    let mut inner = self.write();
    inner.owners.insert(owner, name.clone());
    for status in inner.statuses.values_mut() {
      if status.owner_id == owner && status.owner_name != name {
        let mut renamed = status.clone();
        renamed.owner_name = name.clone();
        *status = renamed;
      }
    }
  }

  pub fn owner_name(&self, owner: OwnerId) -> Option<String> {
    self.read().owners.get(&owner).cloned()
  }

  /// Known account owners, ordered by name. The global owner is not included.
  pub fn list_owners(&self) -> Vec<(OwnerId, String)> {
    let mut owners: Vec<(OwnerId, String)> = self
      .read()
      .owners
      .iter()
      .filter(|(id, _)| !id.is_global())
      .map(|(id, name)| (*id, name.clone()))
      .collect();
    owners.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
    owners
  }

  /// Drop an owner together with all of its statuses.
  pub fn remove_owner(&self, owner: OwnerId) {
    let mut inner = self.write();
    inner.owners.remove(&owner);
    inner.statuses.retain(|(id, _), _| *id != owner);
  }
}
