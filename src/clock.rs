//! Substitutable time source.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Source of the current time.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Clock that only moves when told to. Used by tests to travel in time.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  /// Move the clock forward by `by`.
  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now += by;
  }

  pub fn set(&self, to: DateTime<Utc>) {
    *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_manual_clock_advances() {
    let start = Utc::now();
    let clock = ManualClock::new(start);
    assert_eq!(clock.now(), start);

    clock.advance(Duration::minutes(10));
    assert_eq!(clock.now(), start + Duration::minutes(10));

    clock.set(start);
    assert_eq!(clock.now(), start);
  }
}
