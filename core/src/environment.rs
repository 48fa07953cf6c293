//! Environment traits injected into the runtime services.

use chrono::{DateTime, Utc};

/// Clock trait - abstracts time operations for testability
///
/// The admission gate stamps intents with `now()`, the worker stamps orders,
/// and the seeder uses it to decide which offers are active.
pub trait Clock: Send + Sync {
    /// Get the current time
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
