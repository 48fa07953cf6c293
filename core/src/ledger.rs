//! Stock Ledger abstraction.
//!
//! The ledger holds, per offer, a remaining-stock counter and the set of
//! buyers who were admitted. Every mutation is a single operation evaluated
//! by the ledger itself; callers never read-then-write.
//!
//! # Atomic reservation
//!
//! ```text
//! if buyer ∈ purchased[offer]     → AlreadyPurchased
//! elif stock[offer] missing       → UnknownOffer
//! elif stock[offer] <= 0          → OutOfStock
//! else stock[offer] -= 1
//!      purchased[offer] += buyer  → Reserved
//! ```
//!
//! Among N concurrent callers for an offer with stock K, exactly K observe
//! `Reserved`. A buyer racing themself observes exactly one `Reserved`.

use crate::BoxFuture;
use crate::error::LedgerError;
use crate::ids::{BuyerId, OfferId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ledger-level result of the atomic reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReserveOutcome {
    /// One unit was reserved and the buyer recorded
    Reserved,
    /// The buyer already holds a reservation for the offer
    AlreadyPurchased,
    /// No stock left
    OutOfStock,
    /// The offer has never been seeded into the ledger
    UnknownOffer,
}

/// Decision returned to the request layer.
///
/// The HTTP layer maps `Admitted` to success, `AlreadyPurchased` and
/// `OutOfStock` to a non-retryable rejection, and `SystemError` to a
/// retryable failure. `SystemError` never reserves stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionDecision {
    /// A unit was reserved for the buyer
    Admitted,
    /// The buyer already won this offer
    AlreadyPurchased,
    /// The offer is sold out (or unknown to the ledger)
    OutOfStock,
    /// The ledger could not evaluate the decision; nothing was reserved
    SystemError,
}

impl AdmissionDecision {
    /// Whether the buyer got a reservation.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Admitted)
    }

    /// Whether this is a business rejection (never retried).
    #[must_use]
    pub const fn is_rejection(self) -> bool {
        matches!(self, Self::AlreadyPurchased | Self::OutOfStock)
    }

    /// Whether the client may retry the call.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::SystemError)
    }

    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admitted => "admitted",
            Self::AlreadyPurchased => "already_purchased",
            Self::OutOfStock => "out_of_stock",
            Self::SystemError => "system_error",
        }
    }
}

impl fmt::Display for AdmissionDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ReserveOutcome> for AdmissionDecision {
    fn from(outcome: ReserveOutcome) -> Self {
        match outcome {
            ReserveOutcome::Reserved => Self::Admitted,
            ReserveOutcome::AlreadyPurchased => Self::AlreadyPurchased,
            ReserveOutcome::OutOfStock | ReserveOutcome::UnknownOffer => Self::OutOfStock,
        }
    }
}

/// Snapshot of one offer's ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSnapshot {
    /// Remaining-stock counter
    pub remaining: i64,
    /// Size of the purchased-buyer set
    pub purchased: i64,
}

/// Result of one reconciliation of a ledger counter against durable truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Offer
    pub offer_id: OfferId,
    /// Counter before reconciliation
    pub previous: i64,
    /// Counter after reconciliation
    pub target: i64,
    /// Purchased-buyer set size seen by the reconciliation
    pub purchased: i64,
    /// Whether the unclamped target was negative (more buyers admitted than provisioned)
    pub oversold: bool,
}

impl ReconcileReport {
    /// Signed adjustment applied to the counter.
    #[must_use]
    pub const fn drift(&self) -> i64 {
        self.target - self.previous
    }
}

/// Trait for Stock Ledger implementations.
///
/// Implementations must evaluate each method as one indivisible operation
/// on the ledger server (script, transaction, or compare-and-swap). No
/// method may be emulated with separate client-side reads and writes.
///
/// # Dyn Compatibility
///
/// Methods return [`BoxFuture`] so that the ledger can be shared as
/// `Arc<dyn StockLedger>` across request handlers.
pub trait StockLedger: Send + Sync {
    /// Atomically check-dedup, check-stock, decrement and record.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the ledger is unreachable or the operation
    /// could not be evaluated. Nothing is reserved in that case.
    fn try_reserve(
        &self,
        offer_id: OfferId,
        buyer_id: BuyerId,
    ) -> BoxFuture<'_, Result<ReserveOutcome, LedgerError>>;

    /// Initialize an offer's counter and purchased set if the offer has no
    /// counter yet.
    ///
    /// Returns `true` if the entry was written, `false` if it already existed
    /// (in which case nothing is modified).
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the ledger is unreachable.
    fn seed_if_absent(
        &self,
        offer_id: OfferId,
        remaining: i64,
        purchased: &[BuyerId],
    ) -> BoxFuture<'_, Result<bool, LedgerError>>;

    /// Re-derive the counter as `min(allotment - |purchased|, durable_remaining)`,
    /// clamped at zero, reading the purchased-set size in the same atomic
    /// operation that writes the counter.
    ///
    /// Returns `None` if the offer has not been seeded.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the ledger is unreachable.
    fn reconcile(
        &self,
        offer_id: OfferId,
        allotment: i64,
        durable_remaining: i64,
    ) -> BoxFuture<'_, Result<Option<ReconcileReport>, LedgerError>>;

    /// Read an offer's counter and purchased-set size.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the ledger is unreachable.
    fn snapshot(
        &self,
        offer_id: OfferId,
    ) -> BoxFuture<'_, Result<Option<LedgerSnapshot>, LedgerError>>;

    /// Check that the ledger is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::ConnectionFailed`] if it is not.
    fn ping(&self) -> BoxFuture<'_, Result<(), LedgerError>>;
}
