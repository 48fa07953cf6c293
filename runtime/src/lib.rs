//! # Flashsale Runtime
//!
//! The moving parts of the flash-sale pipeline, built over the collaborator
//! traits of `flashsale-core`:
//!
//! - [`admission::AdmissionGate`]: the synchronous admit/reject decision
//! - [`fulfillment::WorkerPool`]: supervised, drainable queue consumers that
//!   materialize orders
//! - [`seeder::LedgerSeeder`] / [`seeder::Reconciler`]: startup seeding,
//!   offer provisioning and periodic ledger correction
//! - [`outbox::UnpublishedIntents`]: admitted intents whose publish failed
//!
//! Plus the ambient pieces: [`retry`], [`metrics`], [`health`] and
//! [`shutdown`].
//!
//! ## Example
//!
//! ```ignore
//! use flashsale_runtime::admission::AdmissionGate;
//!
//! let gate = AdmissionGate::new(ledger, publisher, clock, outbox);
//! match gate.try_admit(offer_id, buyer_id).await {
//!     AdmissionDecision::Admitted => { /* 200 */ }
//!     d if d.is_rejection() => { /* 409 */ }
//!     _ => { /* 503, retry */ }
//! }
//! ```

/// Admission Gate
pub mod admission;

/// Fulfillment handler, worker and pool
pub mod fulfillment;

/// Health monitor over the pipeline's collaborators
pub mod health;

/// Prometheus metrics for observability
pub mod metrics;

/// Bounded holding area for unpublished intents
pub mod outbox;

/// Retry logic with exponential backoff
pub mod retry;

/// Ledger seeding and reconciliation
pub mod seeder;

/// Signal handling for graceful shutdown
pub mod shutdown;

/// Error types for the pipeline runtime
pub mod error {
    use flashsale_core::{ErrorClass, LedgerError, StoreError};
    use thiserror::Error;

    /// Errors raised by runtime components.
    #[derive(Error, Debug)]
    pub enum RuntimeError {
        /// The stock ledger failed
        #[error(transparent)]
        Ledger(#[from] LedgerError),

        /// The order store failed
        #[error(transparent)]
        Store(#[from] StoreError),

        /// An offer definition was rejected before any write
        #[error("Invalid offer: {0}")]
        InvalidOffer(String),

        /// Drain timed out waiting for in-flight deliveries
        #[error("Shutdown timed out with {0} deliveries still in flight")]
        ShutdownTimeout(usize),

        /// A worker task panicked or was cancelled
        #[error("Worker task failed: {0}")]
        TaskJoinError(#[from] tokio::task::JoinError),
    }

    impl RuntimeError {
        /// Error class of the failure, when it maps onto the pipeline taxonomy.
        #[must_use]
        pub const fn class(&self) -> Option<ErrorClass> {
            match self {
                Self::Ledger(e) => Some(e.class()),
                Self::Store(e) => Some(e.class()),
                Self::InvalidOffer(_) | Self::ShutdownTimeout(_) | Self::TaskJoinError(_) => None,
            }
        }
    }
}

pub use admission::AdmissionGate;
pub use error::RuntimeError;
pub use fulfillment::{FulfillmentHandler, FulfillmentWorker, Settlement, WorkerPool};
pub use health::HealthMonitor;
pub use outbox::UnpublishedIntents;
pub use retry::RetryPolicy;
pub use seeder::{LedgerSeeder, Reconciler, SeedReport};

/// Health check status levels
///
/// Indicates the current health state of a component or system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,

    /// Component is operational but needs attention (e.g. dead-letter backlog)
    Degraded,

    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Check if status is degraded
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded)
    }

    /// Check if status is unhealthy
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    /// Get the worst status between two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health check result for a component
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Name of the component being checked
    pub component: String,

    /// Current health status
    pub status: HealthStatus,

    /// Optional message providing details
    pub message: Option<String>,

    /// Optional metadata (e.g. backlog sizes)
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    /// Create a healthy check result
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            message: None,
            metadata: Vec::new(),
        }
    }

    /// Create a degraded check result
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Create an unhealthy check result
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Add metadata to the health check
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }
}

/// Aggregated health report
///
/// Combines multiple health checks into an overall system status.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Overall system status (worst of all checks)
    pub status: HealthStatus,

    /// Individual component checks
    pub checks: Vec<HealthCheck>,

    /// Timestamp when report was generated
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    /// Create a new health report from checks
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            checks,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Check if overall system is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// Check if overall system is degraded
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.status.is_degraded()
    }

    /// Check if overall system is unhealthy
    #[must_use]
    pub const fn is_unhealthy(&self) -> bool {
        self.status.is_unhealthy()
    }

    /// Find the check for one component.
    #[must_use]
    pub fn check(&self, component: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.component == component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_status_wins() {
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::Unhealthy.worst(HealthStatus::Degraded),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Healthy),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn report_aggregates_checks() {
        let report = HealthReport::new(vec![
            HealthCheck::healthy("stock_ledger"),
            HealthCheck::degraded("dead_letters", "150 pending").with_metadata("pending", "150"),
        ]);

        assert!(report.is_degraded());
        let dlq = report.check("dead_letters");
        assert_eq!(
            dlq.map(|c| c.metadata.clone()),
            Some(vec![("pending".to_string(), "150".to_string())])
        );
        assert!(report.check("order_store").is_none());
    }

    #[test]
    fn empty_report_is_healthy() {
        assert!(HealthReport::new(Vec::new()).is_healthy());
    }
}
