//! Durable store and dead-letter abstractions.

use crate::BoxFuture;
use crate::error::{FulfillmentError, StoreError};
use crate::ids::{BuyerId, OfferId, OrderId};
use crate::intent::PurchaseIntent;
use crate::offer::{NewOffer, Offer, OfferStock};
use crate::order::{FulfillmentOutcome, Order};
use chrono::{DateTime, Utc};
use std::fmt;

/// Trait for the durable, relational order store.
///
/// The store exclusively owns the durable stock counters and the order
/// table. `(buyer_id, offer_id)` is unique across orders.
pub trait OrderStore: Send + Sync {
    /// Materialize an intent in one transaction.
    ///
    /// The insert is attempted first; the conditional stock decrement runs
    /// only when the insert created a row. A duplicate insert leaves stock
    /// untouched and yields [`FulfillmentOutcome::Duplicate`].
    ///
    /// # Errors
    ///
    /// - [`FulfillmentError::Drift`] if a new order found no durable stock;
    ///   the transaction is rolled back.
    /// - [`FulfillmentError::Store`] for any other failure; the transaction
    ///   is rolled back.
    fn fulfill(
        &self,
        intent: &PurchaseIntent,
        order_id: OrderId,
        created_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<FulfillmentOutcome, FulfillmentError>>;

    /// Define a new offer with its initial durable stock.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the insert fails.
    fn create_offer(&self, offer: &NewOffer) -> BoxFuture<'_, Result<Offer, StoreError>>;

    /// Consistent stock snapshots of every offer whose window has not ended.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn open_offer_stocks(
        &self,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<OfferStock>, StoreError>>;

    /// Consistent stock snapshot of one offer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn offer_stock(&self, offer_id: OfferId) -> BoxFuture<'_, Result<Option<OfferStock>, StoreError>>;

    /// Buyers holding an order for the offer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn buyers_for_offer(&self, offer_id: OfferId) -> BoxFuture<'_, Result<Vec<BuyerId>, StoreError>>;

    /// The order for a `(buyer, offer)` pair, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn find_order(
        &self,
        buyer_id: BuyerId,
        offer_id: OfferId,
    ) -> BoxFuture<'_, Result<Option<Order>, StoreError>>;

    /// Check that the store is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConnectionFailed`] if it is not.
    fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>>;
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadLetterReason {
    /// The payload is not a purchase intent
    Malformed,
    /// The durable store had no stock for an admitted reservation
    Drift,
    /// Transient failures exhausted the retry budget
    RetriesExhausted,
}

impl DeadLetterReason {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Drift => "drift",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }

    /// Parse from the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "malformed" => Some(Self::Malformed),
            "drift" => Some(Self::Drift),
            "retries_exhausted" => Some(Self::RetriesExhausted),
            _ => None,
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message parked for manual inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// Raw payload as delivered
    pub payload: Vec<u8>,
    /// Decoded intent, when the payload was well formed
    pub intent: Option<PurchaseIntent>,
    /// Why it was parked
    pub reason: DeadLetterReason,
    /// Last error message
    pub error_message: String,
    /// Delivery attempts made
    pub attempts: u32,
    /// When it was parked
    pub failed_at: DateTime<Utc>,
}

/// Terminal sink for messages that cannot be fulfilled.
pub trait DeadLetterSink: Send + Sync {
    /// Persist a dead letter. Returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if it could not be persisted; the caller must
    /// then leave the message on the queue.
    fn dead_letter(&self, letter: DeadLetter) -> BoxFuture<'_, Result<i64, StoreError>>;

    /// Number of dead letters awaiting inspection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn pending_count(&self) -> BoxFuture<'_, Result<i64, StoreError>>;
}
