//! Section registration table.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::status::{OwnerId, SectionId, SectionInfo, SectionScope};

/// Fetch and storage collaborators of one section.
pub trait SectionHandler: Send + Sync {
  /// Fetch the current data from the remote side, normalized for fingerprinting.
  fn fetch(&self, owner: OwnerId) -> BoxFuture<'_, Result<Value>>;

  /// Store fetched data. Must be an idempotent upsert.
  fn persist(&self, owner: OwnerId, data: Value) -> BoxFuture<'_, Result<()>>;

  /// Distinguishes different fetch paths of the same section.
  fn fetch_kind(&self) -> &str {
    "remote"
  }
}

/// [`SectionHandler`] built from a typed fetch and a typed persist function.
///
/// Data passes through `serde_json::Value` in between, which is also what
/// gets fingerprinted.
pub struct TypedSection<T, F, P> {
  fetch: F,
  persist: P,
  _data: PhantomData<fn() -> T>,
}

impl<T, F, FFut, P, PFut> TypedSection<T, F, P>
where
  T: Serialize + DeserializeOwned + Send + 'static,
  F: Fn(OwnerId) -> FFut + Send + Sync,
  FFut: Future<Output = Result<T>> + Send + 'static,
  P: Fn(OwnerId, T) -> PFut + Send + Sync,
  PFut: Future<Output = Result<()>> + Send + 'static,
{
  pub fn new(fetch: F, persist: P) -> Self {
    Self {
      fetch,
      persist,
      _data: PhantomData,
    }
  }
}

impl<T, F, FFut, P, PFut> SectionHandler for TypedSection<T, F, P>
where
  T: Serialize + DeserializeOwned + Send + 'static,
  F: Fn(OwnerId) -> FFut + Send + Sync,
  FFut: Future<Output = Result<T>> + Send + 'static,
  P: Fn(OwnerId, T) -> PFut + Send + Sync,
  PFut: Future<Output = Result<()>> + Send + 'static,
{
  fn fetch(&self, owner: OwnerId) -> BoxFuture<'_, Result<Value>> {
    let fut = (self.fetch)(owner);
    async move {
      let data = fut.await?;
      serde_json::to_value(data).map_err(|e| eyre!("Failed to normalize data: {}", e))
    }
    .boxed()
  }

  fn persist(&self, owner: OwnerId, data: Value) -> BoxFuture<'_, Result<()>> {
    let data = match serde_json::from_value::<T>(data) {
      Ok(data) => data,
      Err(e) => return async move { Err(eyre!("Failed to decode data: {}", e)) }.boxed(),
    };
    (self.persist)(owner, data).boxed()
  }
}

/// A registered section: its description and collaborators.
#[derive(Clone)]
pub struct Section {
  pub info: SectionInfo,
  pub handler: Arc<dyn SectionHandler>,
}

impl Section {
  pub fn new(
    id: impl Into<SectionId>,
    name: impl Into<String>,
    scope: SectionScope,
    timeout: Duration,
    handler: Arc<dyn SectionHandler>,
  ) -> Self {
    Self {
      info: SectionInfo {
        id: id.into(),
        name: name.into(),
        scope,
        timeout,
      },
      handler,
    }
  }
}

/// Maps section identifiers to their collaborators. Populated at startup.
#[derive(Clone, Default)]
pub struct SectionTable {
  sections: BTreeMap<SectionId, Section>,
}

impl SectionTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a section, replacing any earlier one with the same id.
  pub fn register(&mut self, section: Section) -> &mut Self {
    self.sections.insert(section.info.id.clone(), section);
    self
  }

  pub fn get(&self, id: &SectionId) -> Option<&Section> {
    self.sections.get(id)
  }

  /// Descriptions of all registered sections.
  pub fn catalog(&self) -> Vec<SectionInfo> {
    self.sections.values().map(|s| s.info.clone()).collect()
  }

  /// Sections that apply to `owner`.
  pub fn for_owner(&self, owner: OwnerId) -> impl Iterator<Item = &Section> {
    self
      .sections
      .values()
      .filter(move |s| s.info.scope.applies_to(owner))
  }

  pub fn len(&self) -> usize {
    self.sections.len()
  }

  pub fn is_empty(&self) -> bool {
    self.sections.is_empty()
  }
}
