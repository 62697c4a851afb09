use std::cmp::max;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock in milliseconds since the epoch.
pub fn current_time_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}

/// A hybrid clock: each value is strictly greater than the last one handed out and never behind
/// the wall clock.
#[derive(Debug, Default)]
pub struct LogicalClock {
  last: AtomicU64,
}
impl LogicalClock {
  pub fn new() -> LogicalClock {
    LogicalClock::default()
  }

  pub fn current(&self) -> u64 {
    self.last.load(Ordering::Acquire)
  }

  pub fn next(&self) -> u64 {
    self.next_at(current_time_millis())
  }

  /// `max(last + 1, now)`.
  pub fn next_at(&self, now: u64) -> u64 {
    let mut prev = self.last.load(Ordering::Acquire);
    loop {
      let next = max(prev + 1, now);
      match self.last.compare_exchange_weak(
        prev,
        next,
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return next,
        Err(actual) => prev = actual,
      }
    }
  }

  /// Moves the clock forward to a value seen elsewhere, never backward.
  pub fn observe(&self, seen: u64) {
    self.last.fetch_max(seen, Ordering::AcqRel);
  }
}

#[test]
fn test_logical_clock_is_strictly_increasing() {
  let clock = LogicalClock::new();
  assert_eq!(clock.next_at(100), 100);
  assert_eq!(clock.next_at(100), 101);
  assert_eq!(clock.next_at(50), 102);
  assert_eq!(clock.next_at(500), 500);
  clock.observe(400);
  assert_eq!(clock.current(), 500);
  clock.observe(900);
  assert_eq!(clock.next_at(0), 901);
  assert!(clock.next() >= current_time_millis() - 1);
}
