//! Clock abstraction so tests can backdate rows instead of sleeping.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// Anything that can report "now". All time reads in the engine go through
/// this instead of `Utc::now()` directly.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests: backdate rows, advance time deterministically,
/// never sleep.
#[derive(Clone)]
pub struct TestClock {
    inner: Arc<RwLock<DateTime<Utc>>>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(start)),
        }
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.inner.write() = t;
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.inner.write();
        *guard = *guard + delta;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.read()
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
