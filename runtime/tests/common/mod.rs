//! Shared wiring for the pipeline tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use chrono::{DateTime, Utc};
use flashsale_core::{Clock, NewOffer, OfferId, StockLedger};
use flashsale_runtime::fulfillment::FulfillmentHandler;
use flashsale_runtime::retry::RetryPolicy;
use flashsale_runtime::{AdmissionGate, LedgerSeeder, UnpublishedIntents, WorkerPool};
use flashsale_testing::helpers::open_offer;
use flashsale_testing::{
    FixedClock, InMemoryDeadLetters, InMemoryOrderQueue, InMemoryOrderStore, InMemoryStockLedger,
    SequentialIdGenerator, test_clock,
};
use std::sync::Arc;
use std::time::Duration;

/// Every collaborator of the pipeline, in memory.
pub struct Pipeline {
    pub ledger: Arc<InMemoryStockLedger>,
    pub store: Arc<InMemoryOrderStore>,
    pub queue: Arc<InMemoryOrderQueue>,
    pub dead_letters: Arc<InMemoryDeadLetters>,
    pub ids: Arc<SequentialIdGenerator>,
    pub clock: Arc<FixedClock>,
    pub outbox: Arc<UnpublishedIntents>,
}

impl Pipeline {
    pub fn new() -> Self {
        flashsale_testing::helpers::init_tracing();
        Self {
            ledger: Arc::new(InMemoryStockLedger::new()),
            store: Arc::new(InMemoryOrderStore::new()),
            queue: Arc::new(InMemoryOrderQueue::new()),
            dead_letters: Arc::new(InMemoryDeadLetters::new()),
            ids: Arc::new(SequentialIdGenerator::new()),
            clock: Arc::new(test_clock()),
            outbox: Arc::new(UnpublishedIntents::new(16)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn gate(&self) -> AdmissionGate {
        AdmissionGate::new(
            self.ledger.clone(),
            self.queue.clone(),
            self.clock.clone(),
            Arc::clone(&self.outbox),
        )
    }

    pub fn seeder(&self) -> LedgerSeeder {
        LedgerSeeder::new(self.ledger.clone(), self.store.clone(), self.clock.clone())
    }

    /// Handler with millisecond backoff.
    pub fn handler(&self, max_attempts: u32) -> FulfillmentHandler {
        FulfillmentHandler::new(
            self.store.clone(),
            self.dead_letters.clone(),
            self.ids.clone(),
            self.clock.clone(),
        )
        .with_max_attempts(max_attempts)
        .with_retry_policy(fast_policy())
    }

    pub fn pool(&self, max_attempts: u32) -> WorkerPool {
        WorkerPool::new(self.queue.clone(), self.handler(max_attempts))
            .with_resubscribe_delay(Duration::from_millis(10))
    }

    /// Provision an open offer through the seeder.
    pub async fn offer(&self, stock: i64) -> OfferId {
        self.seeder()
            .provision_offer(&self.new_offer(stock))
            .await
            .expect("provision offer")
            .id
    }

    pub fn new_offer(&self, stock: i64) -> NewOffer {
        open_offer("limited drop", stock, self.now())
    }

    pub async fn ledger_remaining(&self, offer: OfferId) -> i64 {
        self.ledger
            .snapshot(offer)
            .await
            .expect("snapshot")
            .expect("offer seeded")
            .remaining
    }
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(2)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .build()
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let start = std::time::Instant::now();
    while !condition() {
        assert!(
            start.elapsed() < timeout,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
