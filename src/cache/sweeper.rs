//! Background cleanup of expired cache entries.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::traits::ResponseCache;

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Spawns the periodic sweep task.
pub struct CacheSweeper;

impl CacheSweeper {
  /// Start sweeping `cache` every `interval`.
  ///
  /// The first sweep happens one interval after start. Each sweep runs on the
  /// blocking pool, so it never stalls the async runtime.
  pub fn spawn(cache: Arc<dyn ResponseCache>, interval: Duration) -> SweeperHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      // Skip the first tick (immediate)
      ticker.tick().await;

      loop {
        tokio::select! {
          _ = ticker.tick() => {
            let cache = Arc::clone(&cache);
            match tokio::task::spawn_blocking(move || cache.cleanup()).await {
              Ok(Ok(removed)) if removed > 0 => info!(removed, "Removed expired cache entries"),
              Ok(Ok(_)) => debug!("No expired cache entries"),
              Ok(Err(e)) => warn!(error = %e, "Cache cleanup failed"),
              Err(e) => warn!(error = %e, "Cache cleanup task failed"),
            }
          }
          _ = &mut shutdown_rx => {
            debug!("Cache sweeper stopped");
            break;
          }
        }
      }
    });

    SweeperHandle {
      shutdown_tx: Some(shutdown_tx),
      task,
    }
  }
}

/// Handle for stopping the sweep task.
pub struct SweeperHandle {
  shutdown_tx: Option<oneshot::Sender<()>>,
  task: JoinHandle<()>,
}

impl SweeperHandle {
  /// Stop sweeping and wait for the task to finish.
  pub async fn shutdown(mut self) {
    if let Some(tx) = self.shutdown_tx.take() {
      let _ = tx.send(());
    }
    let _ = (&mut self.task).await;
  }
}

impl Drop for SweeperHandle {
  fn drop(&mut self) {
    if self.shutdown_tx.is_some() {
      self.task.abort();
    }
  }
}
