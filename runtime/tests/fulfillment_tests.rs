//! Fulfillment: exactly one order per admitted intent, whatever the broker does.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod common;

use common::{Pipeline, eventually};
use flashsale_core::{
    AdmissionDecision, BuyerId, DeadLetterReason, Delivery, DeliveryStream, IntentPublisher,
    IntentSubscriber, OrderStatus, PurchaseIntent,
};
use flashsale_runtime::{RuntimeError, Settlement};
use futures::StreamExt;
use std::time::Duration;

async fn next(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("timed out waiting for delivery")
        .expect("stream ended")
        .expect("delivery failed")
}

#[tokio::test]
async fn pool_turns_every_admission_into_one_order() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(5).await;
    let gate = pipeline.gate();

    for buyer in 1..=8 {
        gate.try_admit(offer, BuyerId::new(buyer)).await;
    }

    let mut pool = pipeline.pool(5);
    pool.start(3);

    eventually(Duration::from_secs(2), || {
        pipeline.store.orders_for(offer).len() == 5 && pipeline.queue.is_idle()
    })
    .await;
    pool.drain(Duration::from_secs(1)).await.unwrap();

    let orders = pipeline.store.orders_for(offer);
    let buyers: Vec<BuyerId> = orders.iter().map(|o| o.buyer_id).collect();
    assert_eq!(buyers, (1..=5).map(BuyerId::new).collect::<Vec<_>>());
    assert!(orders.iter().all(|o| o.status == OrderStatus::Paid));
    assert_eq!(pipeline.store.stock(offer), Some(0));
    assert_eq!(pipeline.queue.stats().acked, 5);
    assert!(pipeline.dead_letters.is_empty());
    assert_eq!(pool.running(), 0);
}

#[tokio::test]
async fn duplicate_publish_creates_one_order() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(3).await;
    let intent = PurchaseIntent::new(BuyerId::new(9), offer, pipeline.now());

    pipeline.queue.publish(&intent).await.unwrap();
    pipeline.queue.publish(&intent).await.unwrap();

    let handler = pipeline.handler(5);
    let mut stream = pipeline.queue.subscribe().await.unwrap();
    assert_eq!(
        handler.handle(next(&mut stream).await).await.unwrap(),
        Settlement::Committed
    );
    assert_eq!(
        handler.handle(next(&mut stream).await).await.unwrap(),
        Settlement::Absorbed
    );

    assert_eq!(pipeline.store.orders_for(offer).len(), 1);
    assert_eq!(pipeline.store.stock(offer), Some(2));
    assert_eq!(pipeline.queue.stats().acked, 2);
    assert!(pipeline.queue.is_idle());
}

#[tokio::test]
async fn crash_between_commit_and_ack_is_absorbed_on_redelivery() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(3).await;
    assert_eq!(
        pipeline.gate().try_admit(offer, BuyerId::new(1)).await,
        AdmissionDecision::Admitted
    );
    pipeline.queue.fail_next_acks(1);

    let mut pool = pipeline.pool(5);
    pool.start(1);

    eventually(Duration::from_secs(2), || {
        pipeline.queue.is_idle() && pipeline.store.fulfill_calls() == 2
    })
    .await;
    pool.drain(Duration::from_secs(1)).await.unwrap();

    assert_eq!(pipeline.store.orders_for(offer).len(), 1);
    assert_eq!(pipeline.store.stock(offer), Some(2));
    assert_eq!(pipeline.queue.stats().acked, 1);
    assert!(pipeline.dead_letters.is_empty());
}

#[tokio::test]
async fn drift_is_dead_lettered_without_an_order() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(1).await;
    // Ledger believes in more stock than the durable row holds.
    pipeline.ledger.set_remaining(offer, 2);

    let gate = pipeline.gate();
    assert!(gate.try_admit(offer, BuyerId::new(1)).await.is_success());
    assert!(gate.try_admit(offer, BuyerId::new(2)).await.is_success());

    let handler = pipeline.handler(5);
    let mut stream = pipeline.queue.subscribe().await.unwrap();
    assert_eq!(
        handler.handle(next(&mut stream).await).await.unwrap(),
        Settlement::Committed
    );
    assert_eq!(
        handler.handle(next(&mut stream).await).await.unwrap(),
        Settlement::DeadLettered
    );

    let letters = pipeline.dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, DeadLetterReason::Drift);
    assert_eq!(letters[0].intent.as_ref().unwrap().buyer_id, BuyerId::new(2));
    assert_eq!(pipeline.store.orders_for(offer).len(), 1);
    assert_eq!(pipeline.store.stock(offer), Some(0));
    assert_eq!(pipeline.queue.stats().rejected, 1);
}

#[tokio::test]
async fn exhausted_retries_are_dead_lettered() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(2).await;
    pipeline
        .queue
        .publish(&PurchaseIntent::new(BuyerId::new(4), offer, pipeline.now()))
        .await
        .unwrap();
    pipeline.store.set_unavailable(true);

    let handler = pipeline.handler(3);
    let mut stream = pipeline.queue.subscribe().await.unwrap();

    let mut settlements = Vec::new();
    for _ in 0..3 {
        settlements.push(handler.handle(next(&mut stream).await).await.unwrap());
    }
    assert_eq!(
        settlements,
        [
            Settlement::Requeued,
            Settlement::Requeued,
            Settlement::DeadLettered
        ]
    );

    let letters = pipeline.dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, DeadLetterReason::RetriesExhausted);
    assert_eq!(letters[0].attempts, 3);
    assert!(pipeline.queue.is_idle());
    assert_eq!(pipeline.queue.stats().requeued, 2);
}

#[tokio::test]
async fn transient_failure_then_success() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(2).await;
    pipeline
        .queue
        .publish(&PurchaseIntent::new(BuyerId::new(4), offer, pipeline.now()))
        .await
        .unwrap();
    pipeline.store.fail_next_fulfills(2);

    let handler = pipeline.handler(5);
    let mut stream = pipeline.queue.subscribe().await.unwrap();

    for expected in [Settlement::Requeued, Settlement::Requeued, Settlement::Committed] {
        let delivery = next(&mut stream).await;
        assert_eq!(handler.handle(delivery).await.unwrap(), expected);
    }

    assert_eq!(pipeline.store.orders_for(offer).len(), 1);
    assert!(pipeline.dead_letters.is_empty());
    assert_eq!(pipeline.store.fulfill_calls(), 3);
}

#[tokio::test]
async fn malformed_payload_is_dead_lettered() {
    let pipeline = Pipeline::new();
    pipeline.queue.publish_raw(b"{\"buyer_id\": \"nope\"".to_vec());

    let handler = pipeline.handler(5);
    let mut stream = pipeline.queue.subscribe().await.unwrap();
    assert_eq!(
        handler.handle(next(&mut stream).await).await.unwrap(),
        Settlement::DeadLettered
    );

    let letters = pipeline.dead_letters.letters();
    assert_eq!(letters[0].reason, DeadLetterReason::Malformed);
    assert!(letters[0].intent.is_none());
    assert_eq!(letters[0].payload, b"{\"buyer_id\": \"nope\"".to_vec());
    assert_eq!(pipeline.store.fulfill_calls(), 0);
    assert!(pipeline.queue.is_idle());
}

#[tokio::test]
async fn failed_dead_letter_write_keeps_message() {
    let pipeline = Pipeline::new();
    pipeline.queue.publish_raw(b"garbage".to_vec());
    pipeline.dead_letters.fail_next_writes(1);

    let handler = pipeline.handler(5);
    let mut stream = pipeline.queue.subscribe().await.unwrap();
    assert_eq!(
        handler.handle(next(&mut stream).await).await.unwrap(),
        Settlement::Requeued
    );
    assert!(pipeline.dead_letters.is_empty());

    assert_eq!(
        handler.handle(next(&mut stream).await).await.unwrap(),
        Settlement::DeadLettered
    );
    let letters = pipeline.dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, 2);
}

#[tokio::test]
async fn drain_waits_for_in_flight_delivery() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(1).await;
    pipeline.store.set_fulfill_latency(Duration::from_millis(200));
    pipeline.gate().try_admit(offer, BuyerId::new(1)).await;

    let mut pool = pipeline.pool(5);
    pool.start(1);
    eventually(Duration::from_secs(1), || pool.in_flight() == 1).await;

    pool.drain(Duration::from_secs(2)).await.unwrap();

    assert_eq!(pool.in_flight(), 0);
    assert_eq!(pipeline.store.orders_for(offer).len(), 1);
    assert!(pipeline.queue.is_idle());
}

#[tokio::test]
async fn drain_reports_deliveries_left_in_flight() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(1).await;
    pipeline.store.set_fulfill_latency(Duration::from_secs(2));
    pipeline.gate().try_admit(offer, BuyerId::new(1)).await;

    let mut pool = pipeline.pool(5);
    pool.start(1);
    eventually(Duration::from_secs(1), || pool.in_flight() == 1).await;

    let drained = pool.drain(Duration::from_millis(50)).await;
    assert!(matches!(drained, Err(RuntimeError::ShutdownTimeout(1))));
}

#[tokio::test]
async fn worker_retries_failed_subscription() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(1).await;
    pipeline.queue.fail_next_subscribes(2);
    pipeline.gate().try_admit(offer, BuyerId::new(1)).await;

    let mut pool = pipeline.pool(5);
    pool.start(1);

    eventually(Duration::from_secs(2), || {
        pipeline.store.orders_for(offer).len() == 1
    })
    .await;
    pool.drain(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn stopped_pool_leaves_queue_untouched() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(2).await;

    let mut pool = pipeline.pool(5);
    pool.start(2);
    pool.drain(Duration::from_secs(1)).await.unwrap();

    pipeline.gate().try_admit(offer, BuyerId::new(1)).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(pipeline.queue.stats().ready, 1);
    assert!(pipeline.store.orders_for(offer).is_empty());
}
