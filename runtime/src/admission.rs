//! The buyer-facing admission decision.
//!
//! [`AdmissionGate::try_admit`] runs the ledger's atomic reserve and, on
//! success, publishes the purchase intent before answering. It holds no
//! locks of its own: atomicity lives in the ledger, so any number of callers
//! may share one gate.

use crate::metrics::{AdmissionMetrics, QueueMetrics};
use crate::outbox::UnpublishedIntents;
use flashsale_core::{
    AdmissionDecision, BuyerId, Clock, IntentPublisher, OfferId, PurchaseIntent, QueueError,
    ReserveOutcome, StockLedger,
};
use std::sync::Arc;
use std::time::Instant;

/// Admission Gate over a stock ledger and the order queue.
#[derive(Clone)]
pub struct AdmissionGate {
    ledger: Arc<dyn StockLedger>,
    publisher: Arc<dyn IntentPublisher>,
    clock: Arc<dyn Clock>,
    outbox: Arc<UnpublishedIntents>,
}

impl AdmissionGate {
    /// Create a gate.
    ///
    /// `outbox` receives intents whose publish fails after admission.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn StockLedger>,
        publisher: Arc<dyn IntentPublisher>,
        clock: Arc<dyn Clock>,
        outbox: Arc<UnpublishedIntents>,
    ) -> Self {
        Self {
            ledger,
            publisher,
            clock,
            outbox,
        }
    }

    /// Decide one purchase attempt.
    ///
    /// - `Admitted`: one unit reserved for the buyer and the intent handed
    ///   to the queue (or parked in the outbox when publish failed)
    /// - `AlreadyPurchased` / `OutOfStock`: nothing changed
    /// - `SystemError`: the ledger could not be reached or evaluated; no
    ///   stock was reserved and the caller may retry
    pub async fn try_admit(&self, offer_id: OfferId, buyer_id: BuyerId) -> AdmissionDecision {
        let start = Instant::now();

        let decision = match self.ledger.try_reserve(offer_id, buyer_id).await {
            Ok(outcome) => {
                if outcome == ReserveOutcome::UnknownOffer {
                    tracing::warn!(%offer_id, %buyer_id, "Admission for offer missing from the ledger");
                }
                AdmissionDecision::from(outcome)
            },
            Err(e) => {
                tracing::error!(%offer_id, %buyer_id, error = %e, "Ledger unavailable, failing admission closed");
                AdmissionDecision::SystemError
            },
        };

        if decision == AdmissionDecision::Admitted {
            let intent = PurchaseIntent::new(buyer_id, offer_id, self.clock.now());
            if let Err(e) = self.publish_intent(&intent).await {
                // The reservation stands; rolling it back would reopen the race.
                tracing::error!(
                    %offer_id,
                    %buyer_id,
                    error = %e,
                    "Publish failed after admission, parking intent for republish"
                );
                self.outbox.park(intent, e.to_string(), self.clock.now());
            }
        }

        AdmissionMetrics::record_decision(decision, start.elapsed());
        tracing::debug!(%offer_id, %buyer_id, %decision, "Admission decided");
        decision
    }

    /// Publish one purchase intent to the order queue.
    ///
    /// # Errors
    ///
    /// Returns the queue's error when the broker does not confirm the write.
    pub async fn publish_intent(&self, intent: &PurchaseIntent) -> Result<(), QueueError> {
        match self.publisher.publish(intent).await {
            Ok(()) => {
                QueueMetrics::record_publish();
                Ok(())
            },
            Err(e) => {
                QueueMetrics::record_publish_failure();
                Err(e)
            },
        }
    }

    /// Intents admitted but not yet published.
    #[must_use]
    pub const fn outbox(&self) -> &Arc<UnpublishedIntents> {
        &self.outbox
    }
}

impl std::fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("parked", &self.outbox.len())
            .finish_non_exhaustive()
    }
}
