use core::sync::atomic::{AtomicI64, Ordering};

/// Statistics-only running total.
///
/// Updates are relaxed: they never block and impose no ordering on other
/// memory, so a concurrent reader may observe a stale value. Use it for
/// estimates, never for accounting that must balance exactly at every
/// instant.
#[derive(Debug, Default)]
pub struct StatsCounter {
  value: AtomicI64,
}

impl StatsCounter {
  pub const fn new() -> Self {
    Self {
      value: AtomicI64::new(0),
    }
  }

  #[inline]
  pub fn lossy_add(&self, delta: i64) {
    self.value.fetch_add(delta, Ordering::Relaxed);
  }

  #[inline]
  pub fn value(&self) -> i64 {
    self.value.load(Ordering::Relaxed)
  }
}
