use chrono::SecondsFormat;
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheLayer, CacheSweeper, NoopCache, ResponseCache, SqliteResponseCache};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::{Database, SectionDataStore, SqliteStatusStore, StatusStore};
use crate::event::{Event, EventHandler};
use crate::refresh::{RefreshError, Section, SectionTable, SectionUpdater};
use crate::remote::{CachedHttpClient, HttpSection};
use crate::status::{OwnerId, SectionId, SectionStatus};

/// Runtime switches from the command line
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
  /// Serve remote data from the response cache only
  pub offline: bool,
}

/// Main application state
pub struct App {
  /// Application configuration
  config: Config,

  /// Shared response cache backend
  cache: Arc<dyn ResponseCache>,

  /// Keeps sections fresh
  updater: SectionUpdater,

  clock: Arc<dyn Clock>,
}

impl App {
  pub fn new(config: Config, options: Options) -> Result<Self> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let db = match &config.database {
      Some(path) => Database::open(path)?,
      None => Database::open_default()?,
    };
    Self::with_database(config, options, Arc::new(db), clock)
  }

  /// Build the app over an already opened database.
  pub fn with_database(
    config: Config,
    options: Options,
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
  ) -> Result<Self> {
    let cache: Arc<dyn ResponseCache> = if config.cache.enabled {
      Arc::new(SqliteResponseCache::new(Arc::clone(&db), Arc::clone(&clock)))
    } else {
      Arc::new(NoopCache)
    };

    let http_cache = CacheLayer::new(Arc::clone(&cache), "http:")
      .with_default_ttl(chrono::Duration::seconds(config.cache.ttl_secs as i64));
    let client = CachedHttpClient::new(http_cache, Arc::clone(&clock))?.with_offline(options.offline);
    let sections = build_sections(&config, &client, &SectionDataStore::new(Arc::clone(&db)));

    let store: Arc<dyn StatusStore> = Arc::new(SqliteStatusStore::new(db));
    let updater = SectionUpdater::load(sections, store, Arc::clone(&clock))?;

    let app = Self {
      config,
      cache,
      updater,
      clock,
    };
    app.sync_owners()?;
    Ok(app)
  }

  /// Make the stored owners match the configured ones.
  fn sync_owners(&self) -> Result<()> {
    let configured: BTreeSet<i64> = self.config.owners.iter().map(|o| o.id).collect();

    for (owner, name) in self.updater.registry().list_owners() {
      if !configured.contains(&owner.0) {
        info!(owner = %owner, name = %name, "Owner no longer configured, removing");
        self.updater.delete_owner(owner)?;
      }
    }

    for owner in &self.config.owners {
      let id = OwnerId(owner.id);
      if self.updater.registry().owner_name(id).as_deref() != Some(owner.name.as_str()) {
        self.updater.register_owner(id, &owner.name)?;
      }
    }
    Ok(())
  }

  pub fn updater(&self) -> &SectionUpdater {
    &self.updater
  }

  /// Keep everything fresh until Ctrl-C.
  pub async fn run(&self, disable_updates: bool) -> Result<()> {
    let sweeper = CacheSweeper::spawn(
      Arc::clone(&self.cache),
      Duration::from_secs(self.config.cache.cleanup_interval_secs),
    );

    let shutdown = CancellationToken::new();
    let mut events = EventHandler::new(self.config.poll_interval(), shutdown.clone());

    info!(
      owners = self.config.owners.len(),
      sections = self.updater.sections().len(),
      disable_updates,
      "Started"
    );

    while let Some(event) = events.next().await {
      match event {
        Event::Tick if disable_updates => debug!("Updates disabled, skipping pass"),
        Event::Tick if shutdown.is_cancelled() => break,
        Event::Tick => self.update_pass(&shutdown).await,
        Event::Shutdown => break,
      }
    }

    sweeper.shutdown().await;
    info!("Stopped");
    Ok(())
  }

  async fn update_pass(&self, cancel: &CancellationToken) {
    let results = self.updater.update_all_if_needed(cancel).await;

    let mut changed = 0;
    let mut failed = 0;
    for (owner, section, result) in results {
      match result {
        Ok(true) => changed += 1,
        Ok(false) => {}
        Err(RefreshError::Cancelled) => {}
        Err(e) => {
          failed += 1;
          warn!(owner = %owner, section = %section, error = %e, "Update failed");
        }
      }
    }

    let summary = self.updater.summary_all();
    info!(
      changed,
      failed,
      ok = summary.ok,
      total = summary.total,
      "Update pass finished"
    );
  }

  /// Refresh one section, or all sections of the owner when `section` is `None`.
  pub async fn refresh(
    &self,
    owner: OwnerId,
    section: Option<&SectionId>,
    force: bool,
  ) -> Result<Vec<(SectionId, bool)>> {
    let cancel = CancellationToken::new();
    let results = match section {
      Some(section) => {
        let result = self
          .updater
          .update_section_if_needed(owner, section, force, &cancel)
          .await;
        vec![(section.clone(), result)]
      }
      None => self.updater.update_owner_sections(owner, force, &cancel).await,
    };

    results
      .into_iter()
      .map(|(section, result)| {
        result
          .map(|changed| (section.clone(), changed))
          .map_err(|e| eyre!("Failed to update {} for {}: {}", section, owner, e))
      })
      .collect()
  }

  /// Status table, one line per section.
  pub fn status_report(&self, owner: Option<OwnerId>) -> String {
    let owners = match owner {
      Some(owner) => vec![owner],
      None => {
        let mut owners = vec![OwnerId::GLOBAL];
        owners.extend(self.updater.registry().list_owners().into_iter().map(|(id, _)| id));
        owners
      }
    };

    let now = self.clock.now();
    let mut lines = Vec::new();
    for owner in owners {
      for status in self.updater.list_statuses(owner) {
        lines.push(format_status(&status, now));
      }
    }

    let summary = match owner {
      Some(owner) => self.updater.summary(owner),
      None => self.updater.summary_all(),
    };
    lines.push(format!(
      "{}/{} sections ok ({:.0}%){}",
      summary.ok,
      summary.total,
      summary.progress() * 100.0,
      if summary.is_running() { ", updating" } else { "" }
    ));
    lines.join("\n")
  }

  /// Remove all cached responses.
  pub fn clear_cache(&self) -> Result<()> {
    self.cache.clear()?;
    info!("Response cache cleared");
    Ok(())
  }
}

fn build_sections(
  config: &Config,
  client: &CachedHttpClient,
  store: &SectionDataStore,
) -> SectionTable {
  let mut table = SectionTable::new();
  for section in &config.sections {
    let handler = HttpSection::new(section.id.as_str(), &section.url, client.clone(), store.clone())
      .paged(section.paged);
    table.register(Section::new(
      section.id.as_str(),
      section.display_name(),
      section.scope,
      section.timeout(),
      Arc::new(handler),
    ));
  }
  table
}

fn format_status(status: &SectionStatus, now: chrono::DateTime<chrono::Utc>) -> String {
  let state = if status.is_running() {
    "running"
  } else if status.is_missing() {
    "never"
  } else if !status.is_ok() {
    "error"
  } else if status.is_expired(now) {
    "expired"
  } else {
    "ok"
  };
  let completed = status
    .completed_at
    .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
    .unwrap_or_else(|| "-".to_string());
  let owner = if status.owner_name.is_empty() {
    status.owner_id.to_string()
  } else {
    status.owner_name.clone()
  };

  let mut line = format!(
    "{:<16} {:<20} {:<8} {}",
    owner, status.section_name, state, completed
  );
  if !status.error_message.is_empty() {
    line.push_str("  ");
    line.push_str(&status.error_message);
  }
  line
}
