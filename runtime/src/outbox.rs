//! Holding area for admitted intents whose publish failed.
//!
//! The reservation stays committed in the ledger when publishing fails, so
//! the intent is parked here and republished by the reconciler loop. The
//! outbox is bounded: when full, the oldest entry is dropped with an error
//! log and a metric, leaving a reservation that only reconciliation can
//! account for.

use crate::metrics::QueueMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use chrono::{DateTime, Utc};
use flashsale_core::{IntentPublisher, PurchaseIntent, QueueError};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default number of intents the outbox holds.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 10_000;

/// An admitted intent waiting to be republished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkedIntent {
    /// The intent to publish
    pub intent: PurchaseIntent,
    /// Error from the most recent publish attempt
    pub error_message: String,
    /// Publish attempts so far
    pub attempts: u32,
    /// When the intent was first parked
    pub parked_at: DateTime<Utc>,
}

/// Result of one outbox flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Intents published
    pub published: usize,
    /// Intents parked again after failing
    pub failed: usize,
}

/// Bounded FIFO of unpublished intents.
#[derive(Debug)]
pub struct UnpublishedIntents {
    queue: Mutex<VecDeque<ParkedIntent>>,
    // Entries taken by a running flush and not yet settled.
    flushing: AtomicUsize,
    capacity: usize,
}

impl Default for UnpublishedIntents {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOX_CAPACITY)
    }
}

impl UnpublishedIntents {
    /// Create an outbox holding at most `capacity` intents (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            flushing: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Park an intent after its first publish failed.
    pub fn park(&self, intent: PurchaseIntent, error_message: String, parked_at: DateTime<Utc>) {
        self.push(ParkedIntent {
            intent,
            error_message,
            attempts: 1,
            parked_at,
        });
    }

    fn push(&self, entry: ParkedIntent) {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if queue.len() >= self.capacity {
            if let Some(dropped) = queue.pop_front() {
                QueueMetrics::record_outbox_dropped();
                tracing::error!(
                    offer_id = %dropped.intent.offer_id,
                    buyer_id = %dropped.intent.buyer_id,
                    attempts = dropped.attempts,
                    capacity = self.capacity,
                    "Outbox full, dropping oldest unpublished intent; reservation will not be fulfilled"
                );
            }
        }

        queue.push_back(entry);
        QueueMetrics::record_outbox_size(queue.len());
    }

    /// Number of unpublished intents, counting those a flush is
    /// republishing right now.
    #[must_use]
    pub fn len(&self) -> usize {
        let queue = self
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        queue.len() + self.flushing.load(Ordering::SeqCst)
    }

    /// Whether nothing is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of parked intents.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remove and return every parked intent, oldest first.
    pub fn drain(&self) -> Vec<ParkedIntent> {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entries: Vec<_> = queue.drain(..).collect();
        QueueMetrics::record_outbox_size(0);
        entries
    }

    /// Republish every parked intent.
    ///
    /// Each intent is retried under `policy` while the error is transient;
    /// intents that still fail are parked again with their attempt count
    /// bumped.
    pub async fn flush(&self, publisher: &dyn IntentPublisher, policy: &RetryPolicy) -> FlushReport {
        let entries: Vec<_> = {
            let mut queue = self
                .queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            self.flushing.fetch_add(queue.len(), Ordering::SeqCst);
            queue.drain(..).collect()
        };
        if entries.is_empty() {
            return FlushReport::default();
        }

        let mut report = FlushReport::default();
        for mut entry in entries {
            let result = retry_with_predicate(
                policy,
                || publisher.publish(&entry.intent),
                |e: &QueueError| e.class().is_retryable(),
            )
            .await;

            match result {
                Ok(()) => {
                    report.published += 1;
                    tracing::info!(
                        offer_id = %entry.intent.offer_id,
                        buyer_id = %entry.intent.buyer_id,
                        attempts = entry.attempts + 1,
                        "Republished parked intent"
                    );
                },
                Err(e) => {
                    report.failed += 1;
                    entry.attempts += 1;
                    entry.error_message = e.to_string();
                    self.push(entry);
                },
            }
            self.flushing.fetch_sub(1, Ordering::SeqCst);
        }

        QueueMetrics::record_republished(report.published);
        QueueMetrics::record_outbox_size(self.len());
        if report.failed > 0 {
            tracing::warn!(
                published = report.published,
                failed = report.failed,
                "Outbox flush left intents unpublished"
            );
        }
        report
    }
}
