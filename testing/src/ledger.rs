//! In-memory stock ledger.
//!
//! Every operation runs under one mutex, which gives the same
//! all-or-nothing behavior the Redis scripts get from server-side
//! evaluation.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use flashsale_core::{
    BoxFuture, BuyerId, LedgerError, LedgerSnapshot, OfferId, ReconcileReport, ReserveOutcome,
    StockLedger,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Entry {
    remaining: i64,
    purchased: BTreeSet<BuyerId>,
}

/// `HashMap`-backed [`StockLedger`] with an outage switch.
///
/// # Example
///
/// ```
/// use flashsale_core::{BuyerId, OfferId, ReserveOutcome, StockLedger};
/// use flashsale_testing::InMemoryStockLedger;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let ledger = InMemoryStockLedger::new();
/// ledger.seed_if_absent(OfferId::new(1), 1, &[]).await?;
///
/// let outcome = ledger.try_reserve(OfferId::new(1), BuyerId::new(7)).await?;
/// assert_eq!(outcome, ReserveOutcome::Reserved);
/// assert_eq!(ledger.remaining(OfferId::new(1)), Some(0));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryStockLedger {
    offers: Arc<Mutex<HashMap<OfferId, Entry>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStockLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Remaining counter of an offer.
    #[must_use]
    pub fn remaining(&self, offer_id: OfferId) -> Option<i64> {
        self.offers.lock().unwrap().get(&offer_id).map(|e| e.remaining)
    }

    /// Purchased buyers of an offer, ascending.
    #[must_use]
    pub fn purchased(&self, offer_id: OfferId) -> Vec<BuyerId> {
        self.offers
            .lock()
            .unwrap()
            .get(&offer_id)
            .map(|e| e.purchased.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Overwrite a counter, e.g. to simulate drift.
    pub fn set_remaining(&self, offer_id: OfferId, remaining: i64) {
        self.offers
            .lock()
            .unwrap()
            .entry(offer_id)
            .or_default()
            .remaining = remaining;
    }

    /// Forget an offer, e.g. to simulate a ledger restart without persistence.
    pub fn forget(&self, offer_id: OfferId) {
        self.offers.lock().unwrap().remove(&offer_id);
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LedgerError::ConnectionFailed(
                "in-memory ledger marked unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

impl StockLedger for InMemoryStockLedger {
    fn try_reserve(
        &self,
        offer_id: OfferId,
        buyer_id: BuyerId,
    ) -> BoxFuture<'_, Result<ReserveOutcome, LedgerError>> {
        Box::pin(async move {
            self.check_available()?;
            let mut offers = self.offers.lock().unwrap();

            let Some(entry) = offers.get_mut(&offer_id) else {
                return Ok(ReserveOutcome::UnknownOffer);
            };
            if entry.purchased.contains(&buyer_id) {
                return Ok(ReserveOutcome::AlreadyPurchased);
            }
            if entry.remaining <= 0 {
                return Ok(ReserveOutcome::OutOfStock);
            }

            entry.remaining -= 1;
            entry.purchased.insert(buyer_id);
            Ok(ReserveOutcome::Reserved)
        })
    }

    fn seed_if_absent(
        &self,
        offer_id: OfferId,
        remaining: i64,
        purchased: &[BuyerId],
    ) -> BoxFuture<'_, Result<bool, LedgerError>> {
        let purchased: BTreeSet<BuyerId> = purchased.iter().copied().collect();
        Box::pin(async move {
            self.check_available()?;
            let mut offers = self.offers.lock().unwrap();

            if offers.contains_key(&offer_id) {
                return Ok(false);
            }
            offers.insert(
                offer_id,
                Entry {
                    remaining,
                    purchased,
                },
            );
            Ok(true)
        })
    }

    fn reconcile(
        &self,
        offer_id: OfferId,
        allotment: i64,
        durable_remaining: i64,
    ) -> BoxFuture<'_, Result<Option<ReconcileReport>, LedgerError>> {
        Box::pin(async move {
            self.check_available()?;
            let mut offers = self.offers.lock().unwrap();

            let Some(entry) = offers.get_mut(&offer_id) else {
                return Ok(None);
            };

            let previous = entry.remaining;
            #[allow(clippy::cast_possible_wrap)] // buyer sets are far below i64::MAX
            let purchased = entry.purchased.len() as i64;
            let target = (allotment - purchased).min(durable_remaining);
            let oversold = target < 0;
            let target = target.max(0);
            entry.remaining = target;

            Ok(Some(ReconcileReport {
                offer_id,
                previous,
                target,
                purchased,
                oversold,
            }))
        })
    }

    fn snapshot(
        &self,
        offer_id: OfferId,
    ) -> BoxFuture<'_, Result<Option<LedgerSnapshot>, LedgerError>> {
        Box::pin(async move {
            self.check_available()?;
            #[allow(clippy::cast_possible_wrap)]
            let snapshot = self.offers.lock().unwrap().get(&offer_id).map(|e| LedgerSnapshot {
                remaining: e.remaining,
                purchased: e.purchased.len() as i64,
            });
            Ok(snapshot)
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), LedgerError>> {
        Box::pin(async move { self.check_available() })
    }
}
