//! Offers and durable stock snapshots.

use crate::ids::OfferId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A time-boxed offer with strictly limited stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    /// Offer identifier
    pub id: OfferId,
    /// Display name
    pub name: String,
    /// Durable remaining stock
    pub stock: i64,
    /// Start of the sale window (inclusive)
    pub starts_at: DateTime<Utc>,
    /// End of the sale window (exclusive)
    pub ends_at: DateTime<Utc>,
}

impl Offer {
    /// Whether the sale window contains `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now && now < self.ends_at
    }
}

/// Input for defining a new offer (the stock seed write).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOffer {
    /// Display name
    pub name: String,
    /// Initial stock, must be non-negative
    pub stock: i64,
    /// Start of the sale window (inclusive)
    pub starts_at: DateTime<Utc>,
    /// End of the sale window (exclusive)
    pub ends_at: DateTime<Utc>,
}

/// One consistent read of an offer's durable stock.
///
/// `remaining` and `orders` must come from the same snapshot: every
/// fulfillment moves exactly one unit from `remaining` to `orders`, so their
/// sum is the offer's allotment and stays constant while workers commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferStock {
    /// Offer identifier
    pub offer_id: OfferId,
    /// Durable remaining stock
    pub remaining: i64,
    /// Number of persisted orders for the offer
    pub orders: i64,
}

impl OfferStock {
    /// Units the offer was provisioned with (`remaining + orders`).
    #[must_use]
    pub const fn allotment(&self) -> i64 {
        self.remaining + self.orders
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn active_window_is_half_open() {
        let start = Utc::now();
        let offer = Offer {
            id: OfferId::new(1),
            name: "phone".to_string(),
            stock: 10,
            starts_at: start,
            ends_at: start + Duration::hours(1),
        };

        assert!(offer.is_active(start));
        assert!(offer.is_active(start + Duration::minutes(59)));
        assert!(!offer.is_active(start + Duration::hours(1)));
        assert!(!offer.is_active(start - Duration::seconds(1)));
    }

    #[test]
    fn allotment_is_remaining_plus_orders() {
        let stock = OfferStock {
            offer_id: OfferId::new(1),
            remaining: 7,
            orders: 3,
        };
        assert_eq!(stock.allotment(), 10);
    }
}
