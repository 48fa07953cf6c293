//! In-memory order store and dead-letter sink.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use chrono::{DateTime, Utc};
use flashsale_core::{
    BoxFuture, BuyerId, DeadLetter, DeadLetterSink, FulfillmentError, FulfillmentOutcome,
    NewOffer, Offer, OfferId, OfferStock, Order, OrderId, OrderStatus, OrderStore,
    PurchaseIntent, StoreError,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct StoreState {
    offers: BTreeMap<OfferId, Offer>,
    orders: BTreeMap<(OfferId, BuyerId), Order>,
    next_offer_id: i64,
}

/// Consume one unit of an injected-failure budget.
fn take_failure(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// [`OrderStore`] with the transactional semantics of the relational store.
///
/// `fulfill` runs under one mutex: the idempotent insert, the conditional
/// stock decrement and the rollback on drift happen as one unit.
#[derive(Clone, Debug, Default)]
pub struct InMemoryOrderStore {
    state: Arc<Mutex<StoreState>>,
    fail_next_fulfills: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
    fulfill_calls: Arc<AtomicUsize>,
    fulfill_latency_ms: Arc<AtomicU64>,
}

impl InMemoryOrderStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` fulfillments with a transient error.
    pub fn fail_next_fulfills(&self, count: usize) {
        self.fail_next_fulfills.store(count, Ordering::SeqCst);
    }

    /// Make every operation fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every `fulfill` call, e.g. to keep a delivery in flight.
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_fulfill_latency(&self, latency: Duration) {
        self.fulfill_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of `fulfill` calls, including failed ones.
    #[must_use]
    pub fn fulfill_calls(&self) -> usize {
        self.fulfill_calls.load(Ordering::SeqCst)
    }

    /// All orders, by offer then buyer.
    #[must_use]
    pub fn orders(&self) -> Vec<Order> {
        self.state.lock().unwrap().orders.values().cloned().collect()
    }

    /// Orders of one offer.
    #[must_use]
    pub fn orders_for(&self, offer_id: OfferId) -> Vec<Order> {
        self.state
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|o| o.offer_id == offer_id)
            .cloned()
            .collect()
    }

    /// Durable remaining stock of an offer.
    #[must_use]
    pub fn stock(&self, offer_id: OfferId) -> Option<i64> {
        self.state.lock().unwrap().offers.get(&offer_id).map(|o| o.stock)
    }

    /// Insert an order directly, bypassing stock, e.g. to set up a restart.
    pub fn insert_order(&self, order: Order) {
        self.state
            .lock()
            .unwrap()
            .orders
            .insert((order.offer_id, order.buyer_id), order);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::ConnectionFailed(
                "in-memory store marked unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn stock_of(state: &StoreState, offer: &Offer) -> OfferStock {
        #[allow(clippy::cast_possible_wrap)]
        let orders = state
            .orders
            .keys()
            .filter(|(offer_id, _)| *offer_id == offer.id)
            .count() as i64;
        OfferStock {
            offer_id: offer.id,
            remaining: offer.stock,
            orders,
        }
    }
}

impl OrderStore for InMemoryOrderStore {
    fn fulfill(
        &self,
        intent: &PurchaseIntent,
        order_id: OrderId,
        created_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<FulfillmentOutcome, FulfillmentError>> {
        let intent = intent.clone();
        Box::pin(async move {
            self.fulfill_calls.fetch_add(1, Ordering::SeqCst);
            let latency = self.fulfill_latency_ms.load(Ordering::SeqCst);
            if latency > 0 {
                tokio::time::sleep(Duration::from_millis(latency)).await;
            }
            if take_failure(&self.fail_next_fulfills) {
                return Err(StoreError::ConnectionFailed("injected fulfill failure".to_string()).into());
            }
            self.check_available()?;

            let mut state = self.state.lock().unwrap();
            let key = (intent.offer_id, intent.buyer_id);
            if state.orders.contains_key(&key) {
                return Ok(FulfillmentOutcome::Duplicate);
            }

            let Some(offer) = state.offers.get_mut(&intent.offer_id) else {
                return Err(StoreError::NotFound(format!("offer {}", intent.offer_id)).into());
            };
            if offer.stock <= 0 {
                return Err(FulfillmentError::Drift {
                    offer_id: intent.offer_id,
                    buyer_id: intent.buyer_id,
                });
            }
            offer.stock -= 1;

            let order = Order {
                order_id,
                buyer_id: intent.buyer_id,
                offer_id: intent.offer_id,
                status: OrderStatus::Paid,
                created_at,
            };
            state.orders.insert(key, order.clone());
            Ok(FulfillmentOutcome::Created(order))
        })
    }

    fn create_offer(&self, offer: &NewOffer) -> BoxFuture<'_, Result<Offer, StoreError>> {
        let offer = offer.clone();
        Box::pin(async move {
            self.check_available()?;
            let mut state = self.state.lock().unwrap();
            state.next_offer_id += 1;

            let created = Offer {
                id: OfferId::new(state.next_offer_id),
                name: offer.name,
                stock: offer.stock,
                starts_at: offer.starts_at,
                ends_at: offer.ends_at,
            };
            state.offers.insert(created.id, created.clone());
            Ok(created)
        })
    }

    fn open_offer_stocks(
        &self,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<OfferStock>, StoreError>> {
        Box::pin(async move {
            self.check_available()?;
            let state = self.state.lock().unwrap();
            Ok(state
                .offers
                .values()
                .filter(|o| o.ends_at > now)
                .map(|o| Self::stock_of(&state, o))
                .collect())
        })
    }

    fn offer_stock(&self, offer_id: OfferId) -> BoxFuture<'_, Result<Option<OfferStock>, StoreError>> {
        Box::pin(async move {
            self.check_available()?;
            let state = self.state.lock().unwrap();
            Ok(state.offers.get(&offer_id).map(|o| Self::stock_of(&state, o)))
        })
    }

    fn buyers_for_offer(&self, offer_id: OfferId) -> BoxFuture<'_, Result<Vec<BuyerId>, StoreError>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self
                .state
                .lock()
                .unwrap()
                .orders
                .keys()
                .filter(|(o, _)| *o == offer_id)
                .map(|(_, buyer)| *buyer)
                .collect())
        })
    }

    fn find_order(
        &self,
        buyer_id: BuyerId,
        offer_id: OfferId,
    ) -> BoxFuture<'_, Result<Option<Order>, StoreError>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self
                .state
                .lock()
                .unwrap()
                .orders
                .get(&(offer_id, buyer_id))
                .cloned())
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move { self.check_available() })
    }
}

/// [`DeadLetterSink`] that keeps letters in a `Vec`.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDeadLetters {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
    fail_next_writes: Arc<AtomicUsize>,
}

impl InMemoryDeadLetters {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes.
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_next_writes.store(count, Ordering::SeqCst);
    }

    /// Letters written so far, oldest first.
    #[must_use]
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap().clone()
    }

    /// Number of letters written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.letters.lock().unwrap().len()
    }

    /// Whether nothing was dead-lettered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterSink for InMemoryDeadLetters {
    fn dead_letter(&self, letter: DeadLetter) -> BoxFuture<'_, Result<i64, StoreError>> {
        Box::pin(async move {
            if take_failure(&self.fail_next_writes) {
                return Err(StoreError::ConnectionFailed("injected dead-letter failure".to_string()));
            }
            let mut letters = self.letters.lock().unwrap();
            letters.push(letter);
            #[allow(clippy::cast_possible_wrap)]
            Ok(letters.len() as i64)
        })
    }

    fn pending_count(&self) -> BoxFuture<'_, Result<i64, StoreError>> {
        #[allow(clippy::cast_possible_wrap)]
        Box::pin(async move { Ok(self.len() as i64) })
    }
}
