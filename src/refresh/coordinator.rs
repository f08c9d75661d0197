//! Coalescing of concurrent refreshes of the same key.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::error::RefreshError;

type SharedCall<T> = Shared<BoxFuture<'static, Result<T, RefreshError>>>;

/// Runs at most one call per key at a time.
///
/// The first caller for a key spawns the work on the runtime; everyone who
/// asks for the same key while it runs waits for that result instead of
/// starting their own. Once the call finishes the key is idle again and the
/// next caller starts fresh.
///
/// A caller whose cancellation token fires stops waiting and gets
/// [`RefreshError::Cancelled`]. The spawned work is not aborted: it keeps
/// running for the remaining waiters and completes its side effects even
/// when nobody is left waiting.
pub struct Coordinator<K, T> {
  calls: Arc<Mutex<HashMap<K, SharedCall<T>>>>,
}

impl<K, T> Default for Coordinator<K, T> {
  fn default() -> Self {
    Self {
      calls: Arc::new(Mutex::new(HashMap::new())),
    }
  }
}

impl<K, T> Coordinator<K, T>
where
  K: Eq + Hash + Clone + Send + 'static,
  T: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(calls: &Mutex<HashMap<K, SharedCall<T>>>) -> MutexGuard<'_, HashMap<K, SharedCall<T>>> {
    calls.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Run `make` for `key`, or join the call already in flight.
  ///
  /// Returns the result and whether it was shared with an earlier caller.
  /// A caller that is already cancelled neither starts nor joins a call.
  pub async fn run<F, Fut>(
    &self,
    key: K,
    cancel: &CancellationToken,
    make: F,
  ) -> (Result<T, RefreshError>, bool)
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, RefreshError>> + Send + 'static,
  {
    if cancel.is_cancelled() {
      return (Err(RefreshError::Cancelled), false);
    }

    let (call, shared) = {
      let mut calls = Self::lock(&self.calls);
      match calls.get(&key) {
        Some(call) => (call.clone(), true),
        None => {
          let call = self.start(key.clone(), make());
          calls.insert(key, call.clone());
          (call, false)
        }
      }
    };

    trace!(shared, "Waiting for refresh");
    let result = tokio::select! {
      result = call => result,
      _ = cancel.cancelled() => Err(RefreshError::Cancelled),
    };
    (result, shared)
  }

  fn start<Fut>(&self, key: K, work: Fut) -> SharedCall<T>
  where
    Fut: Future<Output = Result<T, RefreshError>> + Send + 'static,
  {
    let unregister = Unregister {
      calls: Arc::clone(&self.calls),
      key: Some(key),
    };
    let handle = tokio::spawn(async move {
      // Dropped on completion and on panic alike.
      let _unregister = unregister;
      work.await
    });

    async move {
      handle
        .await
        .unwrap_or_else(|e| Err(RefreshError::Aborted(e.to_string())))
    }
    .boxed()
    .shared()
  }

  /// Number of keys with a call in flight.
  pub fn in_flight(&self) -> usize {
    Self::lock(&self.calls).len()
  }
}

/// Removes a finished call from the map.
struct Unregister<K: Eq + Hash, T> {
  calls: Arc<Mutex<HashMap<K, SharedCall<T>>>>,
  key: Option<K>,
}

impl<K: Eq + Hash, T> Drop for Unregister<K, T> {
  fn drop(&mut self) {
    if let Some(key) = self.key.take() {
      self
        .calls
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&key);
    }
  }
}
