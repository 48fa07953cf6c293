//! Prometheus metrics for the admission and fulfillment pipeline.
//!
//! Every component records through the `metrics` facade; the recorder
//! structs below keep metric names in one place:
//!
//! - admission decisions and latency
//! - publish failures and the unpublished-intent outbox
//! - fulfillment outcomes, retries and dead letters
//! - seeding and reconciliation
//!
//! # Example
//!
//! ```rust,no_run
//! use flashsale_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Serve metrics on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use flashsale_core::{AdmissionDecision, DeadLetterReason};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Installs the global recorder and serves `/metrics` on `addr` for
/// Prometheus scraping. Must be started from within a Tokio runtime.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and spawn the HTTP listener.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built (e.g. the address
    /// cannot be bound).
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g. in tests), this logs a
    /// warning and leaves [`handle`](Self::handle) empty.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.000_5, 0.001, 0.002_5, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if let Err(e) = metrics::set_global_recorder(recorder) {
            tracing::warn!(error = %e, "Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Admission
    describe_counter!(
        "flashsale_admission_decisions_total",
        "Admission decisions by outcome"
    );
    describe_histogram!(
        "flashsale_admission_duration_seconds",
        "Time taken to decide one admission"
    );

    // Queue
    describe_counter!(
        "flashsale_intents_published_total",
        "Purchase intents published to the order queue"
    );
    describe_counter!(
        "flashsale_publish_failures_total",
        "Admitted intents whose publish failed"
    );
    describe_gauge!(
        "flashsale_outbox_size",
        "Admitted intents waiting to be republished"
    );
    describe_counter!(
        "flashsale_outbox_republished_total",
        "Parked intents republished from the outbox"
    );
    describe_counter!(
        "flashsale_outbox_dropped_total",
        "Parked intents dropped because the outbox was full"
    );

    // Fulfillment
    describe_counter!(
        "flashsale_orders_created_total",
        "Orders durably created"
    );
    describe_counter!(
        "flashsale_duplicate_deliveries_total",
        "Redelivered intents absorbed by the uniqueness constraint"
    );
    describe_counter!(
        "flashsale_drift_total",
        "Fulfillments that found durable stock exhausted"
    );
    describe_counter!(
        "flashsale_fulfillment_retries_total",
        "Deliveries requeued after a transient failure"
    );
    describe_counter!(
        "flashsale_dead_letters_total",
        "Deliveries moved to the dead-letter table, by reason"
    );
    describe_counter!(
        "flashsale_settle_failures_total",
        "Deliveries that could not be acknowledged or requeued"
    );
    describe_counter!(
        "flashsale_worker_resubscriptions_total",
        "Worker subscriptions restarted after a stream error or end"
    );
    describe_histogram!(
        "flashsale_fulfillment_duration_seconds",
        "Time taken to process one delivery"
    );

    // Seeding
    describe_counter!(
        "flashsale_offers_seeded_total",
        "Offers loaded into the stock ledger"
    );
    describe_counter!(
        "flashsale_reconcile_adjustments_total",
        "Ledger counters corrected by reconciliation"
    );
    describe_counter!(
        "flashsale_oversold_total",
        "Reconciliations that found more purchases than allotment"
    );

    // Retry
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!(
        "retry_successes_total",
        "Total number of successful retries"
    );
    describe_counter!(
        "retry_exhausted_total",
        "Total number of retry attempts that exhausted max retries"
    );
}

/// Admission metrics recorder.
pub struct AdmissionMetrics;

impl AdmissionMetrics {
    /// Record one admission decision.
    pub fn record_decision(decision: AdmissionDecision, duration: Duration) {
        counter!("flashsale_admission_decisions_total", "outcome" => decision.as_str())
            .increment(1);
        histogram!("flashsale_admission_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Order queue metrics recorder.
pub struct QueueMetrics;

impl QueueMetrics {
    /// Record a successful publish.
    pub fn record_publish() {
        counter!("flashsale_intents_published_total").increment(1);
    }

    /// Record a publish failure.
    pub fn record_publish_failure() {
        counter!("flashsale_publish_failures_total").increment(1);
    }

    /// Record the outbox size.
    #[allow(clippy::cast_precision_loss)] // bounded by outbox capacity
    pub fn record_outbox_size(len: usize) {
        gauge!("flashsale_outbox_size").set(len as f64);
    }

    /// Record intents republished from the outbox.
    pub fn record_republished(count: usize) {
        counter!("flashsale_outbox_republished_total").increment(count as u64);
    }

    /// Record an intent dropped from a full outbox.
    pub fn record_outbox_dropped() {
        counter!("flashsale_outbox_dropped_total").increment(1);
    }
}

/// Fulfillment metrics recorder.
pub struct FulfillmentMetrics;

impl FulfillmentMetrics {
    /// Record a created order.
    pub fn record_created(duration: Duration) {
        counter!("flashsale_orders_created_total").increment(1);
        histogram!("flashsale_fulfillment_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an absorbed duplicate delivery.
    pub fn record_duplicate() {
        counter!("flashsale_duplicate_deliveries_total").increment(1);
    }

    /// Record stock drift.
    pub fn record_drift() {
        counter!("flashsale_drift_total").increment(1);
    }

    /// Record a requeue after a transient failure.
    pub fn record_retry() {
        counter!("flashsale_fulfillment_retries_total").increment(1);
    }

    /// Record a dead-lettered delivery.
    pub fn record_dead_letter(reason: DeadLetterReason) {
        counter!("flashsale_dead_letters_total", "reason" => reason.as_str()).increment(1);
    }

    /// Record a failed acknowledgement or requeue.
    pub fn record_settle_failure() {
        counter!("flashsale_settle_failures_total").increment(1);
    }

    /// Record a worker resubscription.
    pub fn record_resubscription() {
        counter!("flashsale_worker_resubscriptions_total").increment(1);
    }
}

/// Seeder and reconciler metrics recorder.
pub struct SeederMetrics;

impl SeederMetrics {
    /// Record offers seeded into the ledger.
    pub fn record_seeded(count: usize) {
        counter!("flashsale_offers_seeded_total").increment(count as u64);
    }

    /// Record a corrected ledger counter.
    pub fn record_adjustment() {
        counter!("flashsale_reconcile_adjustments_total").increment(1);
    }

    /// Record an oversold offer.
    pub fn record_oversold() {
        counter!("flashsale_oversold_total").increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        AdmissionMetrics::record_decision(AdmissionDecision::Admitted, Duration::from_micros(300));
        FulfillmentMetrics::record_created(Duration::from_millis(4));
        FulfillmentMetrics::record_dead_letter(DeadLetterReason::Drift);

        // Another test may have installed the recorder first; recording still works.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("flashsale_admission_decisions_total"));
            assert!(rendered.contains("flashsale_orders_created_total"));
            assert!(rendered.contains("reason=\"drift\""));
        }
    }
}
