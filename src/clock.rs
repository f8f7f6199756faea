use std::sync::RwLock;

use chrono::{DateTime, Utc};

/// Injectable time source, so tests can advance time deterministically
/// instead of sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test double: returns a fixed instant until advanced explicitly.
#[derive(Debug)]
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.now.write().expect("fixed clock lock poisoned");
        *guard += delta;
    }

    pub fn set(&self, now: DateTime<Utc>) {
        let mut guard = self.now.write().expect("fixed clock lock poisoned");
        *guard = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().expect("fixed clock lock poisoned")
    }
}
