//! Component health for readiness probes.

use crate::outbox::UnpublishedIntents;
use crate::{HealthCheck, HealthReport};
use flashsale_core::{DeadLetterSink, OrderStore, StockLedger};
use std::sync::Arc;

/// Pending dead letters above which the pipeline reports `Degraded`.
pub const DEFAULT_DEAD_LETTER_THRESHOLD: i64 = 100;

/// Checks the ledger, the order store and the dead-letter backlog.
pub struct HealthMonitor {
    ledger: Arc<dyn StockLedger>,
    store: Arc<dyn OrderStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    outbox: Option<Arc<UnpublishedIntents>>,
    dead_letter_threshold: i64,
}

impl HealthMonitor {
    /// Create a monitor.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn StockLedger>,
        store: Arc<dyn OrderStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            ledger,
            store,
            dead_letters,
            outbox: None,
            dead_letter_threshold: DEFAULT_DEAD_LETTER_THRESHOLD,
        }
    }

    /// Also report parked intents.
    #[must_use]
    pub fn with_outbox(mut self, outbox: Arc<UnpublishedIntents>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Set the dead-letter backlog threshold.
    #[must_use]
    pub const fn with_dead_letter_threshold(mut self, threshold: i64) -> Self {
        self.dead_letter_threshold = threshold;
        self
    }

    /// Run every check.
    pub async fn check(&self) -> HealthReport {
        let mut checks = Vec::with_capacity(4);

        checks.push(match self.ledger.ping().await {
            Ok(()) => HealthCheck::healthy("stock_ledger"),
            Err(e) => HealthCheck::unhealthy("stock_ledger", e.to_string()),
        });

        checks.push(match self.store.ping().await {
            Ok(()) => HealthCheck::healthy("order_store"),
            Err(e) => HealthCheck::unhealthy("order_store", e.to_string()),
        });

        checks.push(match self.dead_letters.pending_count().await {
            Ok(pending) if pending > self.dead_letter_threshold => HealthCheck::degraded(
                "dead_letters",
                format!("{pending} pending dead letters"),
            )
            .with_metadata("pending", pending.to_string()),
            Ok(pending) => {
                HealthCheck::healthy("dead_letters").with_metadata("pending", pending.to_string())
            },
            Err(e) => HealthCheck::degraded("dead_letters", e.to_string()),
        });

        if let Some(outbox) = &self.outbox {
            let parked = outbox.len();
            checks.push(if parked == 0 {
                HealthCheck::healthy("outbox")
            } else {
                HealthCheck::degraded("outbox", format!("{parked} admitted intents unpublished"))
                    .with_metadata("parked", parked.to_string())
            });
        }

        let report = HealthReport::new(checks);
        if !report.is_healthy() {
            tracing::warn!(status = %report.status, "Pipeline health check not healthy");
        }
        report
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("dead_letter_threshold", &self.dead_letter_threshold)
            .finish_non_exhaustive()
    }
}
