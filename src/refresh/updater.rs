//! Section update orchestration.

use color_eyre::Result;
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::db::StatusStore;
use crate::status::{OwnerId, SectionId, SectionStatus, StatusRegistry, StatusSummary};

use super::coordinator::Coordinator;
use super::error::RefreshError;
use super::persister::ChangeGatedPersister;
use super::section::{Section, SectionTable};

/// Coalescing key: unrelated sections never wait on each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefreshKey {
  pub owner: OwnerId,
  pub section: SectionId,
  pub kind: String,
}

/// Public entry point for keeping sections fresh.
///
/// Decides whether a section needs a refresh, makes sure only one refresh
/// per section runs at a time, and records every run in the status registry.
pub struct SectionUpdater {
  sections: SectionTable,
  registry: Arc<StatusRegistry>,
  store: Arc<dyn StatusStore>,
  clock: Arc<dyn Clock>,
  coordinator: Coordinator<RefreshKey, bool>,
}

impl SectionUpdater {
  pub fn new(
    sections: SectionTable,
    registry: Arc<StatusRegistry>,
    store: Arc<dyn StatusStore>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      sections,
      registry,
      store,
      clock,
      coordinator: Coordinator::new(),
    }
  }

  /// Build the registry from durable storage, then create the updater.
  pub fn load(
    sections: SectionTable,
    store: Arc<dyn StatusStore>,
    clock: Arc<dyn Clock>,
  ) -> Result<Self> {
    let registry = StatusRegistry::load(sections.catalog(), store.as_ref())?;
    Ok(Self::new(sections, Arc::new(registry), store, clock))
  }

  pub fn registry(&self) -> &Arc<StatusRegistry> {
    &self.registry
  }

  pub fn sections(&self) -> &SectionTable {
    &self.sections
  }

  fn section(&self, owner: OwnerId, id: &SectionId) -> Result<&Section, RefreshError> {
    self
      .sections
      .get(id)
      .filter(|s| s.info.scope.applies_to(owner))
      .ok_or_else(|| RefreshError::InvalidSection {
        owner,
        section: id.clone(),
      })
  }

  /// Refresh a section when its data expired, or always when `force_update` is set.
  ///
  /// Returns whether the stored data changed. Concurrent calls for the same
  /// section share one fetch and all get its result.
  pub async fn update_section_if_needed(
    &self,
    owner: OwnerId,
    section_id: &SectionId,
    force_update: bool,
    cancel: &CancellationToken,
  ) -> Result<bool, RefreshError> {
    let section = self.section(owner, section_id)?;
    if self.registry.owner_name(owner).is_none() {
      return Err(RefreshError::UnknownOwner(owner));
    }
    if cancel.is_cancelled() {
      return Err(RefreshError::Cancelled);
    }

    if !force_update && !self.needs_update(owner, section_id) {
      return Ok(false);
    }

    let key = RefreshKey {
      owner,
      section: section_id.clone(),
      kind: section.handler.fetch_kind().to_string(),
    };
    let job = RefreshJob {
      owner,
      section: section.clone(),
      force_update,
      registry: Arc::clone(&self.registry),
      store: Arc::clone(&self.store),
      clock: Arc::clone(&self.clock),
    };

    let (result, shared) = self.coordinator.run(key, cancel, move || job.run()).await;
    if shared {
      debug!(owner = %owner, section = %section_id, "Joined running refresh");
    }
    result
  }

  fn needs_update(&self, owner: OwnerId, section_id: &SectionId) -> bool {
    match self.registry.get(owner, section_id) {
      Some(status) => status.is_expired(self.clock.now()),
      None => true,
    }
  }

  /// Refresh all sections of an owner concurrently.
  pub async fn update_owner_sections(
    &self,
    owner: OwnerId,
    force_update: bool,
    cancel: &CancellationToken,
  ) -> Vec<(SectionId, Result<bool, RefreshError>)> {
    let ids: Vec<SectionId> = self
      .sections
      .for_owner(owner)
      .map(|s| s.info.id.clone())
      .collect();

    let results = join_all(
      ids
        .iter()
        .map(|id| self.update_section_if_needed(owner, id, force_update, cancel)),
    )
    .await;

    ids.into_iter().zip(results).collect()
  }

  /// Refresh everything: global sections and the sections of every known owner.
  pub async fn update_all_if_needed(
    &self,
    cancel: &CancellationToken,
  ) -> Vec<(OwnerId, SectionId, Result<bool, RefreshError>)> {
    let mut owners = vec![OwnerId::GLOBAL];
    owners.extend(self.registry.list_owners().into_iter().map(|(id, _)| id));

    let results = join_all(
      owners
        .iter()
        .map(|owner| self.update_owner_sections(*owner, false, cancel)),
    )
    .await;

    owners
      .into_iter()
      .zip(results)
      .flat_map(|(owner, results)| {
        results
          .into_iter()
          .map(move |(section, result)| (owner, section, result))
      })
      .collect()
  }

  /// Current status, or `None` when the section never ran for this owner.
  pub fn status(&self, owner: OwnerId, section_id: &SectionId) -> Option<SectionStatus> {
    self.registry.get(owner, section_id)
  }

  /// Statuses of all sections of an owner, ordered by section name.
  pub fn list_statuses(&self, owner: OwnerId) -> Vec<SectionStatus> {
    self.registry.list_for_owner(owner)
  }

  pub fn summary(&self, owner: OwnerId) -> StatusSummary {
    self.registry.summary(owner)
  }

  pub fn summary_all(&self) -> StatusSummary {
    self.registry.summary_all()
  }

  /// Add or rename an owner, durably.
  pub fn register_owner(&self, owner: OwnerId, name: &str) -> Result<()> {
    self.store.save_owner(owner, name)?;
    self.registry.set_owner(owner, name);
    Ok(())
  }

  /// Remove an owner with all its statuses and data.
  ///
  /// A refresh of this owner still running afterwards discards its result.
  pub fn delete_owner(&self, owner: OwnerId) -> Result<()> {
    self.registry.remove_owner(owner);
    self.store.delete_owner(owner)?;
    info!(owner = %owner, "Owner deleted");
    Ok(())
  }
}

/// One refresh run, executed by the coordinator.
struct RefreshJob {
  owner: OwnerId,
  section: Section,
  force_update: bool,
  registry: Arc<StatusRegistry>,
  store: Arc<dyn StatusStore>,
  clock: Arc<dyn Clock>,
}

impl RefreshJob {
  async fn run(self) -> Result<bool, RefreshError> {
    let owner = self.owner;
    let id = &self.section.info.id;

    // A run may have finished between the caller's check and now.
    if !self.force_update {
      if let Some(status) = self.registry.get(owner, id) {
        if !status.is_expired(self.clock.now()) {
          return Ok(false);
        }
      }
    }

    let started_at = self.clock.now();
    let prior_hash = self
      .registry
      .modify(owner, id, |s| s.started_at = Some(started_at))
      .map(|s| s.content_hash)
      .ok_or(RefreshError::UnknownOwner(owner))?;
    debug!(owner = %owner, section = %id, "Section update started");

    let outcome = async {
      let data = self
        .section
        .handler
        .fetch(owner)
        .await
        .map_err(|e| RefreshError::Fetch(e.to_string()))?;
      ChangeGatedPersister
        .persist_if_changed(self.section.handler.as_ref(), owner, data, &prior_hash)
        .await
    }
    .await;

    let completed_at = self.clock.now();
    let status = self.registry.modify(owner, id, |s| {
      s.started_at = None;
      s.completed_at = Some(completed_at);
      match &outcome {
        Ok(outcome) => {
          s.error_message.clear();
          if outcome.changed {
            s.content_hash = outcome.content_hash.clone();
          }
        }
        Err(e) => s.error_message = e.to_string(),
      }
    });

    if let Some(status) = status {
      if let Err(e) = self.store.save_status(&status) {
        warn!(owner = %owner, section = %id, error = %e, "Failed to save section status");
      }
    }

    // The owner may have been deleted while fetching. Its rows written
    // since then are removed again.
    if self.registry.owner_name(owner).is_none() {
      info!(owner = %owner, section = %id, "Owner deleted during update, discarding result");
      if let Err(e) = self.store.delete_owner(owner) {
        warn!(owner = %owner, error = %e, "Failed to remove rows of deleted owner");
      }
      return Err(RefreshError::UnknownOwner(owner));
    }

    match outcome {
      Ok(outcome) => {
        info!(
          owner = %owner,
          section = %id,
          changed = outcome.changed,
          elapsed_ms = (completed_at - started_at).num_milliseconds(),
          "Section updated"
        );
        Ok(outcome.changed)
      }
      Err(e) => {
        warn!(owner = %owner, section = %id, error = %e, "Section update failed");
        Err(e)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::db::{Database, SqliteStatusStore};
  use crate::refresh::section::SectionHandler;
  use crate::status::SectionScope;
  use chrono::{Duration, Utc};
  use color_eyre::eyre::eyre;
  use futures::future::{BoxFuture, FutureExt};
  use serde_json::{json, Value};
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  /// Scripted remote: answers fetches from a queue (repeating the last answer).
  #[derive(Default)]
  struct FakeRemote {
    answers: Mutex<VecDeque<std::result::Result<Value, String>>>,
    latency_ms: u64,
    fetches: AtomicUsize,
    writes: Mutex<Vec<Value>>,
  }

  impl FakeRemote {
    fn new(answers: Vec<std::result::Result<Value, String>>, latency_ms: u64) -> Arc<Self> {
      Arc::new(Self {
        answers: Mutex::new(answers.into()),
        latency_ms,
        ..Default::default()
      })
    }

    fn fetches(&self) -> usize {
      self.fetches.load(Ordering::SeqCst)
    }

    fn writes(&self) -> usize {
      self.writes.lock().unwrap().len()
    }
  }

  impl SectionHandler for FakeRemote {
    fn fetch(&self, _owner: OwnerId) -> BoxFuture<'_, Result<Value>> {
      async move {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.latency_ms > 0 {
          tokio::time::sleep(std::time::Duration::from_millis(self.latency_ms)).await;
        }
        let answer = {
          let mut answers = self.answers.lock().unwrap();
          if answers.len() > 1 {
            answers.pop_front()
          } else {
            answers.front().cloned()
          }
        };
        match answer {
          Some(Ok(value)) => Ok(value),
          Some(Err(msg)) => Err(eyre!(msg)),
          None => Err(eyre!("no answer scripted")),
        }
      }
      .boxed()
    }

    fn persist(&self, _owner: OwnerId, data: Value) -> BoxFuture<'_, Result<()>> {
      self.writes.lock().unwrap().push(data);
      async { Ok(()) }.boxed()
    }
  }

  struct Fixture {
    updater: Arc<SectionUpdater>,
    clock: Arc<ManualClock>,
    remote: Arc<FakeRemote>,
    store: Arc<SqliteStatusStore>,
  }

  const ALICE: OwnerId = OwnerId(42);

  fn wallet() -> SectionId {
    SectionId::from("wallet")
  }

  fn fixture(remote: Arc<FakeRemote>) -> Fixture {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = Arc::new(SqliteStatusStore::new(Arc::new(
      Database::open_in_memory().unwrap(),
    )));
    let mut sections = SectionTable::new();
    sections.register(Section::new(
      "wallet",
      "Wallet",
      SectionScope::Owner,
      Duration::minutes(30),
      remote.clone(),
    ));
    sections.register(Section::new(
      "universe",
      "Universe",
      SectionScope::Global,
      Duration::hours(24),
      remote.clone(),
    ));
    let updater = SectionUpdater::load(sections, store.clone(), clock.clone()).unwrap();
    updater.register_owner(ALICE, "Alice").unwrap();
    Fixture {
      updater: Arc::new(updater),
      clock,
      remote,
      store,
    }
  }

  #[tokio::test]
  async fn test_first_success_marks_section_fresh() {
    let f = fixture(FakeRemote::new(vec![Ok(json!({"balance": 1}))], 0));
    let cancel = CancellationToken::new();
    assert!(f.updater.status(ALICE, &wallet()).is_none());

    let changed = f
      .updater
      .update_section_if_needed(ALICE, &wallet(), false, &cancel)
      .await;

    assert_eq!(changed, Ok(true));
    let status = f.updater.status(ALICE, &wallet()).unwrap();
    let now = f.clock.now();
    assert!(!status.is_missing());
    assert!(!status.is_expired(now));
    assert!(status.is_ok());
    assert!(!status.is_running());
    assert_eq!(status.completed_at, Some(now));
    assert_eq!(status.owner_name, "Alice");
    assert!(!status.content_hash.is_empty());
    assert_eq!(f.remote.writes(), 1);
  }

  #[tokio::test]
  async fn test_fresh_section_is_not_fetched_again() {
    let f = fixture(FakeRemote::new(vec![Ok(json!({"balance": 1}))], 0));
    let cancel = CancellationToken::new();

    let first = f
      .updater
      .update_section_if_needed(ALICE, &wallet(), false, &cancel)
      .await;
    let second = f
      .updater
      .update_section_if_needed(ALICE, &wallet(), false, &cancel)
      .await;

    assert_eq!(first, Ok(true));
    assert_eq!(second, Ok(false));
    assert_eq!(f.remote.fetches(), 1);
  }

  #[tokio::test]
  async fn test_force_update_ignores_freshness() {
    let f = fixture(FakeRemote::new(vec![Ok(json!({"balance": 1}))], 0));
    let cancel = CancellationToken::new();

    f.updater
      .update_section_if_needed(ALICE, &wallet(), false, &cancel)
      .await
      .unwrap();
    let forced = f
      .updater
      .update_section_if_needed(ALICE, &wallet(), true, &cancel)
      .await;

    assert_eq!(forced, Ok(false));
    assert_eq!(f.remote.fetches(), 2);
    assert_eq!(f.remote.writes(), 1);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrent_updates_fetch_once() {
    let f = fixture(FakeRemote::new(vec![Ok(json!({"balance": 1}))], 200));
    let barrier = Arc::new(tokio::sync::Barrier::new(10));

    let tasks: Vec<_> = (0..10)
      .map(|_| {
        let updater = Arc::clone(&f.updater);
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
          let cancel = CancellationToken::new();
          barrier.wait().await;
          updater
            .update_section_if_needed(ALICE, &wallet(), false, &cancel)
            .await
        })
      })
      .collect();

    for task in tasks {
      assert_eq!(task.await.unwrap(), Ok(true));
    }
    assert_eq!(f.remote.fetches(), 1);
    assert_eq!(f.remote.writes(), 1);
  }

  #[tokio::test]
  async fn test_running_is_visible_while_fetching() {
    let f = fixture(FakeRemote::new(vec![Ok(json!({"balance": 1}))], 100));

    let task = {
      let updater = Arc::clone(&f.updater);
      tokio::spawn(async move {
        let cancel = CancellationToken::new();
        updater
          .update_section_if_needed(ALICE, &wallet(), false, &cancel)
          .await
      })
    };
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    let status = f.updater.status(ALICE, &wallet()).unwrap();
    assert!(status.is_running());
    assert!(status.is_missing());
    assert_eq!(f.updater.summary(ALICE).running, 1);

    task.await.unwrap().unwrap();
    assert!(!f.updater.status(ALICE, &wallet()).unwrap().is_running());
  }

  #[tokio::test]
  async fn test_identical_content_is_not_a_change() {
    let f = fixture(FakeRemote::new(
      vec![
        Ok(json!({"amount": 100.0, "date": "2018-02-23T14:31:32Z"})),
        Ok(json!({"date": "2018-02-23T15:31:32+01:00", "amount": 100})),
        Ok(json!({"date": "2018-02-23T15:31:32+01:00", "amount": 101})),
      ],
      0,
    ));
    let cancel = CancellationToken::new();

    let mut results = Vec::new();
    for _ in 0..3 {
      results.push(
        f.updater
          .update_section_if_needed(ALICE, &wallet(), true, &cancel)
          .await,
      );
    }

    assert_eq!(results, vec![Ok(true), Ok(false), Ok(true)]);
    assert_eq!(f.remote.writes(), 2);
  }

  #[tokio::test]
  async fn test_failure_advances_completion_and_keeps_hash() {
    let f = fixture(FakeRemote::new(
      vec![Ok(json!({"balance": 1})), Err("502 Bad Gateway".to_string())],
      0,
    ));
    let cancel = CancellationToken::new();

    f.updater
      .update_section_if_needed(ALICE, &wallet(), false, &cancel)
      .await
      .unwrap();
    let good = f.updater.status(ALICE, &wallet()).unwrap();

    for _ in 0..2 {
      f.clock.advance(Duration::minutes(31));
      let result = f
        .updater
        .update_section_if_needed(ALICE, &wallet(), false, &cancel)
        .await;
      assert_eq!(result, Err(RefreshError::Fetch("502 Bad Gateway".to_string())));

      let status = f.updater.status(ALICE, &wallet()).unwrap();
      assert_eq!(status.completed_at, Some(f.clock.now()));
      assert_eq!(status.error_message, "502 Bad Gateway");
      assert_eq!(status.content_hash, good.content_hash);
      assert!(!status.is_ok());
      assert!(!status.is_running());
    }

    // A failed run starts a new freshness window.
    f.clock.advance(Duration::minutes(10));
    let result = f
      .updater
      .update_section_if_needed(ALICE, &wallet(), false, &cancel)
      .await;
    assert_eq!(result, Ok(false));
    assert_eq!(f.remote.fetches(), 3);
  }

  #[tokio::test]
  async fn test_invalid_sections_fail_without_status() {
    let f = fixture(FakeRemote::new(vec![Ok(json!(1))], 0));
    let cancel = CancellationToken::new();

    let unknown = f
      .updater
      .update_section_if_needed(ALICE, &"nope".into(), false, &cancel)
      .await;
    assert_eq!(
      unknown,
      Err(RefreshError::InvalidSection {
        owner: ALICE,
        section: "nope".into()
      })
    );

    let wrong_scope = f
      .updater
      .update_section_if_needed(ALICE, &"universe".into(), false, &cancel)
      .await;
    assert!(matches!(wrong_scope, Err(RefreshError::InvalidSection { .. })));

    assert!(f.updater.status(ALICE, &"universe".into()).is_none());
    assert_eq!(f.remote.fetches(), 0);
  }

  #[tokio::test]
  async fn test_cancelled_caller_detaches_and_refresh_completes() {
    let f = fixture(FakeRemote::new(vec![Ok(json!({"balance": 1}))], 100));

    let cancel_a = CancellationToken::new();
    let a = {
      let updater = Arc::clone(&f.updater);
      let cancel = cancel_a.clone();
      tokio::spawn(async move {
        updater
          .update_section_if_needed(ALICE, &wallet(), false, &cancel)
          .await
      })
    };
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let b = {
      let updater = Arc::clone(&f.updater);
      tokio::spawn(async move {
        let cancel = CancellationToken::new();
        updater
          .update_section_if_needed(ALICE, &wallet(), false, &cancel)
          .await
      })
    };
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    cancel_a.cancel();
    assert_eq!(a.await.unwrap(), Err(RefreshError::Cancelled));
    assert_eq!(b.await.unwrap(), Ok(true));

    let status = f.updater.status(ALICE, &wallet()).unwrap();
    assert!(!status.is_running());
    assert!(!status.is_missing());
    assert_eq!(f.remote.fetches(), 1);
  }

  #[tokio::test]
  async fn test_statuses_survive_reload() {
    let f = fixture(FakeRemote::new(vec![Ok(json!({"balance": 1}))], 0));
    let cancel = CancellationToken::new();
    f.updater
      .update_section_if_needed(ALICE, &wallet(), false, &cancel)
      .await
      .unwrap();
    let before = f.updater.status(ALICE, &wallet()).unwrap();

    let registry = StatusRegistry::load(f.updater.sections().catalog(), f.store.as_ref()).unwrap();

    assert_eq!(registry.get(ALICE, &wallet()), Some(before));
  }

  #[tokio::test]
  async fn test_update_all_covers_global_and_owners() {
    let f = fixture(FakeRemote::new(vec![Ok(json!({"v": 1}))], 0));
    let cancel = CancellationToken::new();

    let results = f.updater.update_all_if_needed(&cancel).await;

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, _, r)| r == &Ok(true)));
    assert_eq!(f.updater.summary_all().ok, 2);
    assert_eq!(
      f.updater
        .list_statuses(ALICE)
        .iter()
        .map(|s| s.section_name.as_str())
        .collect::<Vec<_>>(),
      vec!["Wallet"]
    );
  }

  #[tokio::test]
  async fn test_delete_owner_removes_statuses() {
    let f = fixture(FakeRemote::new(vec![Ok(json!({"balance": 1}))], 0));
    let cancel = CancellationToken::new();
    f.updater
      .update_section_if_needed(ALICE, &wallet(), false, &cancel)
      .await
      .unwrap();

    f.updater.delete_owner(ALICE).unwrap();

    assert!(f.updater.status(ALICE, &wallet()).is_none());
    assert!(f.store.list_statuses(ALICE).unwrap().is_empty());
    assert!(f.updater.registry().list_owners().is_empty());
  }

  #[tokio::test]
  async fn test_owner_deleted_during_refresh_leaves_nothing_behind() {
    let f = fixture(FakeRemote::new(vec![Ok(json!({"balance": 1}))], 100));

    let task = {
      let updater = Arc::clone(&f.updater);
      tokio::spawn(async move {
        let cancel = CancellationToken::new();
        updater
          .update_section_if_needed(ALICE, &wallet(), false, &cancel)
          .await
      })
    };
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    f.updater.delete_owner(ALICE).unwrap();

    assert_eq!(task.await.unwrap(), Err(RefreshError::UnknownOwner(ALICE)));
    assert!(f.updater.status(ALICE, &wallet()).is_none());
    assert!(f.store.list_statuses(ALICE).unwrap().is_empty());
    assert!(f.updater.registry().list_owners().is_empty());
  }

  #[tokio::test]
  async fn test_unknown_owner_is_not_fetched() {
    let f = fixture(FakeRemote::new(vec![Ok(json!({"balance": 1}))], 0));
    let cancel = CancellationToken::new();

    let result = f
      .updater
      .update_section_if_needed(OwnerId(7), &wallet(), false, &cancel)
      .await;

    assert_eq!(result, Err(RefreshError::UnknownOwner(OwnerId(7))));
    assert!(f.updater.status(OwnerId(7), &wallet()).is_none());
    assert_eq!(f.remote.fetches(), 0);
  }

  #[tokio::test]
  async fn test_cancelled_before_start_does_not_fetch() {
    let f = fixture(FakeRemote::new(vec![Ok(json!({"balance": 1}))], 0));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let results = f.updater.update_all_if_needed(&cancel).await;

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, _, r)| r == &Err(RefreshError::Cancelled)));
    assert_eq!(f.remote.fetches(), 0);
    assert!(f.updater.status(ALICE, &wallet()).is_none());
  }
}
