//! Durable order records.

use crate::ids::{BuyerId, OfferId, OrderId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order status.
///
/// Orders are only ever created as paid; payment and cancellation flows are
/// layered above the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// The reservation has been durably materialized
    Paid,
}

impl OrderStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Paid => "paid",
        }
    }

    /// Parse from the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "paid" => Some(Self::Paid),
            _ => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted order. At most one exists per `(buyer_id, offer_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Time-ordered unique id
    pub order_id: OrderId,
    /// Buyer
    pub buyer_id: BuyerId,
    /// Offer
    pub offer_id: OfferId,
    /// Status
    pub status: OrderStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Result of materializing one purchase intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FulfillmentOutcome {
    /// A new order row was inserted and durable stock decremented
    Created(Order),
    /// An order for the pair already existed; nothing was written
    Duplicate,
}

impl FulfillmentOutcome {
    /// Whether this call created the order.
    #[must_use]
    pub const fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}
