//! # Flashsale Testing
//!
//! In-memory collaborators for testing the flash-sale pipeline without
//! Redis, Postgres or a broker.
//!
//! This crate provides:
//! - [`InMemoryStockLedger`], [`InMemoryOrderStore`], [`InMemoryOrderQueue`]
//!   and [`InMemoryDeadLetters`], each with fault injection
//! - Deterministic [`FixedClock`] and [`SequentialIdGenerator`]
//! - proptest strategies for admission workloads
//!
//! ## Example
//!
//! ```ignore
//! use flashsale_testing::{InMemoryOrderQueue, InMemoryStockLedger, test_clock};
//!
//! #[tokio::test]
//! async fn admits_until_sold_out() {
//!     let ledger = Arc::new(InMemoryStockLedger::new());
//!     let queue = Arc::new(InMemoryOrderQueue::new());
//!     let gate = AdmissionGate::new(ledger, queue, Arc::new(test_clock()), outbox);
//!     // ...
//! }
//! ```

use chrono::{DateTime, Utc};
use flashsale_core::{Clock, IdGenerator, OrderId};

pub mod ledger;
pub mod queue;
pub mod store;

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, IdGenerator, OrderId, Utc};
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use flashsale_testing::mocks::FixedClock;
    /// use flashsale_core::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Order ids 1, 2, 3, ...
    #[derive(Debug, Default)]
    pub struct SequentialIdGenerator {
        next: AtomicI64,
    }

    impl SequentialIdGenerator {
        /// Start at 1.
        #[must_use]
        pub const fn new() -> Self {
            Self {
                next: AtomicI64::new(0),
            }
        }

        /// Ids handed out so far.
        #[must_use]
        pub fn issued(&self) -> i64 {
            self.next.load(Ordering::SeqCst)
        }
    }

    impl IdGenerator for SequentialIdGenerator {
        fn next_id(&self) -> OrderId {
            OrderId::new(self.next.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use super::{DateTime, Utc};
    use chrono::Duration;
    use flashsale_core::NewOffer;

    /// An offer open for one hour around `now`.
    #[must_use]
    pub fn open_offer(name: &str, stock: i64, now: DateTime<Utc>) -> NewOffer {
        NewOffer {
            name: name.to_string(),
            stock,
            starts_at: now - Duration::minutes(5),
            ends_at: now + Duration::hours(1),
        }
    }

    /// Route `tracing` output to the test harness. Safe to call repeatedly.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("flashsale=debug")),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// A flash-sale workload: stock and the buyer id of each admission call.
    ///
    /// Buyer ids are drawn from a small range so repeat buyers are common.
    pub fn workload() -> impl Strategy<Value = (i64, Vec<i64>)> {
        (0i64..20, prop::collection::vec(1i64..40, 0..80))
    }
}

// Re-export commonly used items
pub use ledger::InMemoryStockLedger;
pub use mocks::{FixedClock, SequentialIdGenerator, test_clock};
pub use queue::{InMemoryOrderQueue, QueueStats};
pub use store::{InMemoryDeadLetters, InMemoryOrderStore};
