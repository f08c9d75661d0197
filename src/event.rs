use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Events driving the update loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
  /// Time for the next update pass
  Tick,
  /// Ctrl-C or a cancelled shutdown token; the loop should exit
  Shutdown,
}

/// Event handler that produces events from a tick timer and Ctrl-C
pub struct EventHandler {
  /// Holds at most one pending tick. Ticks firing while one is pending
  /// are dropped, so a slow pass is followed by one pass, not a backlog.
  rx: mpsc::Receiver<Event>,
  shutdown: CancellationToken,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate.
  ///
  /// The first tick fires immediately. `shutdown` is cancelled on Ctrl-C
  /// so that running refreshes stop waiting.
  pub fn new(tick_rate: Duration, shutdown: CancellationToken) -> Self {
    let (tx, rx) = mpsc::channel(1);

    // Spawn ticker
    let tick_shutdown = shutdown.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      loop {
        tokio::select! {
          _ = interval.tick() => match tx.try_send(Event::Tick) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => debug!("Previous tick still pending, skipping"),
            Err(mpsc::error::TrySendError::Closed(_)) => break,
          },
          _ = tick_shutdown.cancelled() => break,
        }
      }
    });

    // Spawn signal listener
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
      tokio::select! {
        result = tokio::signal::ctrl_c() => {
          if result.is_ok() {
            info!("Interrupted, shutting down");
            signal_shutdown.cancel();
          }
        }
        _ = signal_shutdown.cancelled() => {}
      }
    });

    Self { rx, shutdown }
  }

  /// Receive the next event. Once shut down, always `Shutdown`, even with
  /// a tick pending.
  pub async fn next(&mut self) -> Option<Event> {
    tokio::select! {
      biased;
      _ = self.shutdown.cancelled() => Some(Event::Shutdown),
      event = self.rx.recv() => event,
    }
  }
}
