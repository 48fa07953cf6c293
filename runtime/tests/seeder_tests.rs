//! Ledger seeding, reconciliation, outbox republishing and health.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod common;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::{Pipeline, eventually, fast_policy};
use flashsale_core::{
    AdmissionDecision, BoxFuture, BuyerId, DeadLetter, DeadLetterReason, DeadLetterSink,
    FulfillmentError, FulfillmentOutcome, NewOffer, Offer, OfferId, OfferStock, Order, OrderId,
    OrderStatus, OrderStore, PurchaseIntent, StoreError,
};
use flashsale_runtime::{
    HealthMonitor, HealthStatus, LedgerSeeder, Reconciler, RuntimeError, SeedReport,
};
use flashsale_testing::InMemoryOrderStore;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

fn reconciler(pipeline: &Pipeline) -> Reconciler {
    Reconciler::new(
        pipeline.seeder(),
        pipeline.queue.clone(),
        Arc::clone(&pipeline.outbox),
    )
    .with_retry_policy(fast_policy())
}

#[tokio::test]
async fn seed_all_restores_counter_and_purchased_buyers() {
    let pipeline = Pipeline::new();
    let offer = pipeline
        .store
        .create_offer(&pipeline.new_offer(4))
        .await
        .unwrap();
    pipeline.store.insert_order(Order {
        order_id: OrderId::new(77),
        buyer_id: BuyerId::new(1),
        offer_id: offer.id,
        status: OrderStatus::Paid,
        created_at: pipeline.now(),
    });

    let report = pipeline.seeder().seed_all().await.unwrap();
    assert_eq!(report, SeedReport { seeded: 1, present: 0 });
    assert_eq!(pipeline.ledger.remaining(offer.id), Some(4));
    assert_eq!(pipeline.ledger.purchased(offer.id), vec![BuyerId::new(1)]);

    let gate = pipeline.gate();
    assert_eq!(
        gate.try_admit(offer.id, BuyerId::new(1)).await,
        AdmissionDecision::AlreadyPurchased
    );
}

/// Commits one pending intent right before the buyers query, the way a
/// worker on another instance can between the seeder's two reads.
struct CommitsBetweenReads {
    inner: Arc<InMemoryOrderStore>,
    pending: Mutex<Option<PurchaseIntent>>,
}

impl OrderStore for CommitsBetweenReads {
    fn fulfill(
        &self,
        intent: &PurchaseIntent,
        order_id: OrderId,
        created_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<FulfillmentOutcome, FulfillmentError>> {
        self.inner.fulfill(intent, order_id, created_at)
    }

    fn create_offer(&self, offer: &NewOffer) -> BoxFuture<'_, Result<Offer, StoreError>> {
        self.inner.create_offer(offer)
    }

    fn open_offer_stocks(
        &self,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<OfferStock>, StoreError>> {
        self.inner.open_offer_stocks(now)
    }

    fn offer_stock(&self, offer_id: OfferId) -> BoxFuture<'_, Result<Option<OfferStock>, StoreError>> {
        self.inner.offer_stock(offer_id)
    }

    fn buyers_for_offer(&self, offer_id: OfferId) -> BoxFuture<'_, Result<Vec<BuyerId>, StoreError>> {
        Box::pin(async move {
            let pending = self.pending.lock().unwrap().take();
            if let Some(intent) = pending {
                self.inner
                    .fulfill(&intent, OrderId::new(99), Utc::now())
                    .await
                    .unwrap();
            }
            self.inner.buyers_for_offer(offer_id).await
        })
    }

    fn find_order(
        &self,
        buyer_id: BuyerId,
        offer_id: OfferId,
    ) -> BoxFuture<'_, Result<Option<Order>, StoreError>> {
        self.inner.find_order(buyer_id, offer_id)
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        self.inner.ping()
    }
}

#[tokio::test]
async fn seeding_counts_orders_committed_between_snapshot_and_buyer_reads() {
    let pipeline = Pipeline::new();
    let offer = pipeline
        .store
        .create_offer(&pipeline.new_offer(2))
        .await
        .unwrap();
    let store = Arc::new(CommitsBetweenReads {
        inner: pipeline.store.clone(),
        pending: Mutex::new(Some(PurchaseIntent::new(
            BuyerId::new(99),
            offer.id,
            pipeline.now(),
        ))),
    });
    let seeder = LedgerSeeder::new(pipeline.ledger.clone(), store, pipeline.clock.clone());

    let report = seeder.seed_all().await.unwrap();
    assert_eq!(report.seeded, 1);
    assert_eq!(pipeline.store.stock(offer.id), Some(1));
    assert_eq!(pipeline.ledger.remaining(offer.id), Some(1));
    assert_eq!(pipeline.ledger.purchased(offer.id), vec![BuyerId::new(99)]);

    let gate = pipeline.gate();
    assert_eq!(
        gate.try_admit(offer.id, BuyerId::new(1)).await,
        AdmissionDecision::Admitted
    );
    assert_eq!(
        gate.try_admit(offer.id, BuyerId::new(2)).await,
        AdmissionDecision::OutOfStock
    );

    // The one admitted buyer is covered by durable stock.
    let intent = PurchaseIntent::new(BuyerId::new(1), offer.id, pipeline.now());
    let outcome = pipeline
        .store
        .fulfill(&intent, OrderId::new(100), pipeline.now())
        .await
        .unwrap();
    assert!(outcome.is_created());
    assert_eq!(pipeline.store.stock(offer.id), Some(0));
}

#[tokio::test]
async fn seed_all_skips_closed_offers() {
    let pipeline = Pipeline::new();
    let now = pipeline.now();
    let closed = pipeline
        .store
        .create_offer(&NewOffer {
            name: "yesterday".to_string(),
            stock: 3,
            starts_at: now - ChronoDuration::days(1),
            ends_at: now - ChronoDuration::hours(1),
        })
        .await
        .unwrap();

    let report = pipeline.seeder().seed_all().await.unwrap();
    assert_eq!(report, SeedReport::default());
    assert_eq!(pipeline.ledger.remaining(closed.id), None);
}

#[tokio::test]
async fn seed_all_never_overwrites_live_entries() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(5).await;
    let gate = pipeline.gate();
    gate.try_admit(offer, BuyerId::new(1)).await;
    gate.try_admit(offer, BuyerId::new(2)).await;

    let report = pipeline.seeder().seed_all().await.unwrap();
    assert_eq!(report, SeedReport { seeded: 0, present: 1 });
    assert_eq!(pipeline.ledger.remaining(offer), Some(3));
    assert_eq!(pipeline.ledger.purchased(offer).len(), 2);
}

#[tokio::test]
async fn provision_offer_writes_store_then_ledger() {
    let pipeline = Pipeline::new();
    let offer = pipeline
        .seeder()
        .provision_offer(&pipeline.new_offer(12))
        .await
        .unwrap();

    assert_eq!(pipeline.store.stock(offer.id), Some(12));
    assert_eq!(pipeline.ledger.remaining(offer.id), Some(12));
    assert!(pipeline.ledger.purchased(offer.id).is_empty());
}

#[tokio::test]
async fn provision_offer_rejects_invalid_definitions() {
    let pipeline = Pipeline::new();
    let seeder = pipeline.seeder();

    let negative = seeder.provision_offer(&pipeline.new_offer(-1)).await;
    assert!(matches!(negative, Err(RuntimeError::InvalidOffer(_))));

    let mut empty_window = pipeline.new_offer(3);
    empty_window.ends_at = empty_window.starts_at;
    let empty = seeder.provision_offer(&empty_window).await;
    assert!(matches!(empty, Err(RuntimeError::InvalidOffer(_))));

    assert_eq!(pipeline.store.stock(OfferId::new(1)), None);
}

#[tokio::test]
async fn provision_offer_fails_when_store_is_down() {
    let pipeline = Pipeline::new();
    pipeline.store.set_unavailable(true);

    let result = pipeline.seeder().provision_offer(&pipeline.new_offer(3)).await;
    assert!(matches!(result, Err(RuntimeError::Store(_))));
    assert_eq!(pipeline.ledger.remaining(OfferId::new(1)), None);
}

#[tokio::test]
async fn reconcile_corrects_inflated_counter() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(5).await;
    let gate = pipeline.gate();
    gate.try_admit(offer, BuyerId::new(1)).await;
    gate.try_admit(offer, BuyerId::new(2)).await;
    pipeline.ledger.set_remaining(offer, 10);

    let reports = reconciler(&pipeline).reconcile_once().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].previous, 10);
    assert_eq!(reports[0].target, 3);
    assert_eq!(reports[0].drift(), -7);
    assert!(!reports[0].oversold);
    assert_eq!(pipeline.ledger.remaining(offer), Some(3));
}

#[tokio::test]
async fn reconcile_leaves_consistent_counter_alone() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(5).await;
    let gate = pipeline.gate();
    gate.try_admit(offer, BuyerId::new(1)).await;
    gate.try_admit(offer, BuyerId::new(2)).await;

    // Both reservations are fulfilled before reconciling.
    let handler = pipeline.handler(5);
    let mut pool = flashsale_runtime::WorkerPool::new(pipeline.queue.clone(), handler);
    pool.start(1);
    eventually(Duration::from_secs(2), || {
        pipeline.store.orders_for(offer).len() == 2
    })
    .await;
    pool.drain(Duration::from_secs(1)).await.unwrap();

    let reports = reconciler(&pipeline).reconcile_once().await.unwrap();
    assert_eq!(reports[0].target, 3);
    assert_eq!(reports[0].drift(), 0);
}

#[tokio::test]
async fn reconcile_caps_counter_at_durable_remaining() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(3).await;
    pipeline.gate().try_admit(offer, BuyerId::new(1)).await;

    // The ledger lost its purchased set but still holds a counter.
    pipeline.ledger.forget(offer);
    pipeline.ledger.set_remaining(offer, 3);
    assert_eq!(pipeline.queue.ready_intents().len(), 1);

    let handler = pipeline.handler(5);
    let mut pool = flashsale_runtime::WorkerPool::new(pipeline.queue.clone(), handler);
    pool.start(1);
    eventually(Duration::from_secs(2), || pipeline.queue.is_idle()).await;
    pool.drain(Duration::from_secs(1)).await.unwrap();

    let reports = reconciler(&pipeline).reconcile_once().await.unwrap();
    // allotment 3, purchased 0, durable remaining 2
    assert_eq!(reports[0].target, 2);
    assert_eq!(pipeline.ledger.remaining(offer), Some(2));
}

#[tokio::test]
async fn reconcile_seeds_offers_missing_from_ledger() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(6).await;
    pipeline.ledger.forget(offer);

    let reports = reconciler(&pipeline).reconcile_once().await.unwrap();
    assert!(reports.is_empty());
    assert_eq!(pipeline.ledger.remaining(offer), Some(6));
}

#[tokio::test]
async fn reconcile_flags_oversold_offer() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(1).await;
    pipeline.ledger.set_remaining(offer, 3);
    let gate = pipeline.gate();
    for buyer in 1..=3 {
        assert!(gate.try_admit(offer, BuyerId::new(buyer)).await.is_success());
    }

    let reports = reconciler(&pipeline).reconcile_once().await.unwrap();
    assert!(reports[0].oversold);
    assert_eq!(reports[0].purchased, 3);
    assert_eq!(reports[0].target, 0);
    assert_eq!(pipeline.ledger.remaining(offer), Some(0));
}

#[tokio::test]
async fn flush_republishes_parked_intents() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(2).await;
    pipeline.queue.fail_next_publishes(1);
    pipeline.gate().try_admit(offer, BuyerId::new(3)).await;
    assert_eq!(pipeline.outbox.len(), 1);

    let report = reconciler(&pipeline).flush_outbox().await;
    assert_eq!(report.published, 1);
    assert_eq!(report.failed, 0);
    assert!(pipeline.outbox.is_empty());

    let ready = pipeline.queue.ready_intents();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].buyer_id, BuyerId::new(3));
}

#[tokio::test]
async fn flush_parks_intents_that_keep_failing() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(2).await;
    pipeline.queue.fail_next_publishes(10);
    pipeline.gate().try_admit(offer, BuyerId::new(3)).await;

    let report = reconciler(&pipeline).flush_outbox().await;
    assert_eq!(report.published, 0);
    assert_eq!(report.failed, 1);

    let parked = pipeline.outbox.drain();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].attempts, 2);
}

#[tokio::test]
async fn spawned_reconciler_runs_until_shutdown() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(4).await;
    pipeline.queue.fail_next_publishes(1);
    pipeline.gate().try_admit(offer, BuyerId::new(1)).await;
    pipeline.ledger.set_remaining(offer, 40);

    let (shutdown, rx) = broadcast::channel(1);
    let handle = reconciler(&pipeline)
        .with_interval(Duration::from_millis(10))
        .spawn(rx);

    eventually(Duration::from_secs(2), || {
        pipeline.ledger.remaining(offer) == Some(3) && pipeline.queue.stats().published == 1
    })
    .await;
    assert!(pipeline.outbox.is_empty());

    shutdown.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("reconciler did not stop")
        .unwrap();
}

#[tokio::test]
async fn health_reports_component_status() {
    let pipeline = Pipeline::new();
    let monitor = HealthMonitor::new(
        pipeline.ledger.clone(),
        pipeline.store.clone(),
        pipeline.dead_letters.clone(),
    )
    .with_outbox(Arc::clone(&pipeline.outbox))
    .with_dead_letter_threshold(0);

    let report = monitor.check().await;
    assert!(report.is_healthy());
    assert_eq!(report.checks.len(), 4);

    pipeline
        .dead_letters
        .dead_letter(DeadLetter {
            payload: b"garbage".to_vec(),
            intent: None,
            reason: DeadLetterReason::Malformed,
            error_message: "bad json".to_string(),
            attempts: 1,
            failed_at: pipeline.now(),
        })
        .await
        .unwrap();
    let report = monitor.check().await;
    assert_eq!(report.status, HealthStatus::Degraded);
    let dead_letters = report.check("dead_letters").unwrap();
    assert_eq!(
        dead_letters.metadata,
        vec![("pending".to_string(), "1".to_string())]
    );

    pipeline.ledger.set_unavailable(true);
    let report = monitor.check().await;
    assert!(report.is_unhealthy());
    assert_eq!(
        report.check("stock_ledger").unwrap().status,
        HealthStatus::Unhealthy
    );
    assert!(report.check("order_store").unwrap().status.is_healthy());
}
