//! HTTP client with a persistent response cache.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, CACHE_CONTROL, EXPIRES};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::cache::CacheLayer;
use crate::clock::Clock;

/// Header carrying the total page count of a paged listing.
pub const PAGES_HEADER: &str = "x-pages";

/// A decoded JSON response.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
  pub body: Value,
  /// Total pages of the listing, 1 for unpaged endpoints
  pub pages: u32,
  /// Served from the local cache without touching the network
  pub from_cache: bool,
}

/// What gets stored in the response cache for one URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedResponse {
  body: Value,
  pages: u32,
  /// Until when the server allows reuse without asking again
  fresh_until: DateTime<Utc>,
}

/// JSON-over-HTTP client.
///
/// Successful responses are kept in the cache. A cached entry is reused while
/// the server's `Cache-Control`/`Expires` headers allow it. In offline mode
/// the network is never touched and any cached entry is served, stale or not.
#[derive(Clone)]
pub struct CachedHttpClient {
  client: reqwest::Client,
  cache: CacheLayer,
  clock: Arc<dyn Clock>,
  offline: bool,
}

impl CachedHttpClient {
  pub fn new(cache: CacheLayer, clock: Arc<dyn Clock>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
      .timeout(std::time::Duration::from_secs(30))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      cache,
      clock,
      offline: false,
    })
  }

  /// Serve only from the cache.
  pub fn with_offline(mut self, offline: bool) -> Self {
    self.offline = offline;
    self
  }

  pub fn is_offline(&self) -> bool {
    self.offline
  }

  /// GET a JSON document.
  pub async fn get_json(&self, url: &str) -> Result<RemoteResponse> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;

    if let Some(cached) = self.cached(&url) {
      if self.offline || cached.fresh_until > self.clock.now() {
        debug!(url = %redact(&url), "Serving cached response");
        return Ok(RemoteResponse {
          body: cached.body,
          pages: cached.pages,
          from_cache: true,
        });
      }
    }

    if self.offline {
      return Err(eyre!("Offline and no cached response for {}", redact(&url)));
    }

    self.fetch(url).await
  }

  fn cached(&self, url: &Url) -> Option<CachedResponse> {
    let bytes = match self.cache.get(url.as_str()) {
      Ok(bytes) => bytes?,
      Err(e) => {
        warn!(error = %e, "Failed to read response cache");
        return None;
      }
    };
    match serde_json::from_slice(&bytes) {
      Ok(cached) => Some(cached),
      Err(e) => {
        warn!(url = %redact(url), error = %e, "Discarding unreadable cache entry");
        None
      }
    }
  }

  async fn fetch(&self, url: Url) -> Result<RemoteResponse> {
    let started = Instant::now();
    let response = self
      .client
      .get(url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", redact(&url), e))?;

    let status = response.status();
    log_response(&url, status, started.elapsed().as_millis());
    if !status.is_success() {
      return Err(eyre!("{} {}", status, redact(&url)));
    }

    let now = self.clock.now();
    let headers = response.headers().clone();
    let pages = page_count(&headers);
    let fresh_until = now + freshness(&headers, now);

    let bytes = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response from {}: {}", redact(&url), e))?;
    let body: Value = serde_json::from_slice(&bytes)
      .map_err(|e| eyre!("Failed to parse response from {}: {}", redact(&url), e))?;

    let entry = CachedResponse {
      body,
      pages,
      fresh_until,
    };
    match serde_json::to_vec(&entry) {
      Ok(bytes) => {
        if let Err(e) = self.cache.put(url.as_str(), &bytes) {
          warn!(url = %redact(&url), error = %e, "Failed to cache response");
        }
      }
      Err(e) => warn!(error = %e, "Failed to encode cache entry"),
    }

    Ok(RemoteResponse {
      body: entry.body,
      pages,
      from_cache: false,
    })
  }
}

fn log_response(url: &Url, status: StatusCode, elapsed_ms: u128) {
  if status.as_u16() >= 400 {
    warn!(url = %redact(url), status = status.as_u16(), elapsed_ms, "HTTP response");
  } else {
    debug!(url = %redact(url), status = status.as_u16(), elapsed_ms, "HTTP response");
  }
}

/// URL for logs: query strings may carry tokens.
fn redact(url: &Url) -> String {
  let mut url = url.clone();
  if url.query().is_some() {
    url.set_query(Some("redacted"));
  }
  let _ = url.set_password(None);
  url.to_string()
}

fn page_count(headers: &HeaderMap) -> u32 {
  headers
    .get(PAGES_HEADER)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.trim().parse().ok())
    .filter(|pages| *pages > 0)
    .unwrap_or(1)
}

/// How long the server allows a response to be reused.
fn freshness(headers: &HeaderMap, now: DateTime<Utc>) -> Duration {
  if let Some(cache_control) = headers.get(CACHE_CONTROL).and_then(|v| v.to_str().ok()) {
    for directive in cache_control.split(',').map(str::trim) {
      if directive.eq_ignore_ascii_case("no-store") || directive.eq_ignore_ascii_case("no-cache") {
        return Duration::zero();
      }
      if let Some(secs) = directive.strip_prefix("max-age=") {
        if let Ok(secs) = secs.trim_matches('"').parse::<i64>() {
          return Duration::seconds(secs.max(0));
        }
      }
    }
  }

  headers
    .get(EXPIRES)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
    .map(|expires| (expires.with_timezone(&Utc) - now).max(Duration::zero()))
    .unwrap_or_else(Duration::zero)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ResponseCache, SqliteResponseCache};
  use crate::clock::ManualClock;
  use crate::db::Database;
  use reqwest::header::HeaderValue;
  use serde_json::json;

  // Nothing listens on the discard port; reaching the network fails fast.
  const URL: &str = "http://127.0.0.1:9/wallet/42?token=secret";

  fn client(clock: Arc<ManualClock>) -> CachedHttpClient {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let backend: Arc<dyn ResponseCache> = Arc::new(SqliteResponseCache::new(db, clock.clone()));
    CachedHttpClient::new(CacheLayer::new(backend, "http:"), clock).unwrap()
  }

  fn seed(client: &CachedHttpClient, fresh_until: DateTime<Utc>) {
    let entry = CachedResponse {
      body: json!({"balance": 7}),
      pages: 3,
      fresh_until,
    };
    let key = Url::parse(URL).unwrap();
    client
      .cache
      .put(key.as_str(), &serde_json::to_vec(&entry).unwrap())
      .unwrap();
  }

  #[tokio::test]
  async fn test_fresh_entry_is_served_from_cache() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let client = client(clock.clone());
    seed(&client, clock.now() + Duration::minutes(5));

    let response = client.get_json(URL).await.unwrap();

    assert!(response.from_cache);
    assert_eq!(response.body, json!({"balance": 7}));
    assert_eq!(response.pages, 3);
  }

  #[tokio::test]
  async fn test_offline_serves_stale_entry() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let client = client(clock.clone()).with_offline(true);
    seed(&client, clock.now() - Duration::minutes(5));

    let response = client.get_json(URL).await.unwrap();

    assert!(response.from_cache);
    assert!(client.is_offline());
  }

  #[tokio::test]
  async fn test_offline_without_entry_fails() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let client = client(clock).with_offline(true);

    let err = client.get_json(URL).await.unwrap_err();

    assert!(err.to_string().contains("Offline"));
    assert!(!err.to_string().contains("secret"));
  }

  #[tokio::test]
  async fn test_invalid_url_is_rejected() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    assert!(client(clock).get_json("not a url").await.is_err());
  }

  #[test]
  fn test_page_count_header() {
    let mut headers = HeaderMap::new();
    assert_eq!(page_count(&headers), 1);

    headers.insert(PAGES_HEADER, HeaderValue::from_static("4"));
    assert_eq!(page_count(&headers), 4);

    headers.insert(PAGES_HEADER, HeaderValue::from_static("0"));
    assert_eq!(page_count(&headers), 1);
  }

  #[test]
  fn test_freshness_from_headers() {
    let now = DateTime::parse_from_rfc3339("2015-10-21T07:00:00Z")
      .unwrap()
      .with_timezone(&Utc);

    let mut headers = HeaderMap::new();
    assert_eq!(freshness(&headers, now), Duration::zero());

    headers.insert(EXPIRES, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
    assert_eq!(freshness(&headers, now), Duration::minutes(28));

    headers.insert(CACHE_CONTROL, HeaderValue::from_static("public, max-age=300"));
    assert_eq!(freshness(&headers, now), Duration::seconds(300));

    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    assert_eq!(freshness(&headers, now), Duration::zero());
  }

  #[test]
  fn test_redact_hides_query_and_password() {
    let url = Url::parse("https://user:pw@example.com/a?token=secret").unwrap();
    let redacted = redact(&url);
    assert!(!redacted.contains("secret"));
    assert!(!redacted.contains("pw"));
    assert!(redacted.starts_with("https://user@example.com/a?"));
  }
}
