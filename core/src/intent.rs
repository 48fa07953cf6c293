//! Purchase intents: the message carried from admission to fulfillment.
//!
//! # Wire format
//!
//! ```json
//! { "buyer_id": 1001, "offer_id": 7, "emitted_at": "2025-01-01T00:00:00Z" }
//! ```
//!
//! `emitted_at` is optional on decode so that producers emitting only the
//! two identifiers are still understood.

use crate::error::QueueError;
use crate::ids::{BuyerId, OfferId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An admitted reservation awaiting durable fulfillment.
///
/// Produced once per `Admitted` decision, consumed one or more times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseIntent {
    /// Buyer that won the reservation
    pub buyer_id: BuyerId,
    /// Offer the reservation was taken from
    pub offer_id: OfferId,
    /// Admission time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emitted_at: Option<DateTime<Utc>>,
}

impl PurchaseIntent {
    /// Create an intent stamped with its admission time.
    #[must_use]
    pub const fn new(buyer_id: BuyerId, offer_id: OfferId, emitted_at: DateTime<Utc>) -> Self {
        Self {
            buyer_id,
            offer_id,
            emitted_at: Some(emitted_at),
        }
    }

    /// Message key used for partitioning: intents of one offer share a partition.
    #[must_use]
    pub fn partition_key(&self) -> String {
        self.offer_id.to_string()
    }

    /// Encode to the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::SerializationFailed`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, QueueError> {
        serde_json::to_vec(self).map_err(|e| QueueError::SerializationFailed(e.to_string()))
    }

    /// Decode from the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::DeserializationFailed`] for malformed payloads.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, QueueError> {
        serde_json::from_slice(bytes).map_err(|e| QueueError::DeserializationFailed(e.to_string()))
    }
}
