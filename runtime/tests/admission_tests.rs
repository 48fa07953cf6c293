//! Admission Gate: atomic decisions under concurrency and failure.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod common;

use common::Pipeline;
use flashsale_core::{AdmissionDecision, BuyerId, OfferId, StockLedger};
use flashsale_testing::properties::workload;
use futures::future::join_all;
use proptest::prelude::*;
use std::collections::HashSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_k_of_n_buyers_are_admitted() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(10).await;
    let gate = pipeline.gate();

    let calls = (1..=200).map(|buyer| {
        let gate = gate.clone();
        tokio::spawn(async move { gate.try_admit(offer, BuyerId::new(buyer)).await })
    });
    let decisions: Vec<AdmissionDecision> = join_all(calls)
        .await
        .into_iter()
        .map(|joined| joined.expect("admission task panicked"))
        .collect();

    let admitted = decisions.iter().filter(|d| d.is_success()).count();
    let sold_out = decisions
        .iter()
        .filter(|d| **d == AdmissionDecision::OutOfStock)
        .count();
    assert_eq!(admitted, 10);
    assert_eq!(sold_out, 190);
    assert_eq!(pipeline.ledger_remaining(offer).await, 0);
    assert_eq!(pipeline.ledger.purchased(offer).len(), 10);
    assert_eq!(pipeline.queue.stats().published, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_by_one_buyer_admit_once() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(5).await;
    let gate = pipeline.gate();

    let calls = (0..16).map(|_| {
        let gate = gate.clone();
        tokio::spawn(async move { gate.try_admit(offer, BuyerId::new(42)).await })
    });
    let decisions: Vec<AdmissionDecision> = join_all(calls)
        .await
        .into_iter()
        .map(|joined| joined.expect("admission task panicked"))
        .collect();

    assert_eq!(decisions.iter().filter(|d| d.is_success()).count(), 1);
    assert!(
        decisions
            .iter()
            .filter(|d| !d.is_success())
            .all(|d| *d == AdmissionDecision::AlreadyPurchased)
    );
    assert_eq!(pipeline.ledger_remaining(offer).await, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn last_unit_goes_to_exactly_one_of_two_buyers() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(1).await;
    let gate = pipeline.gate();

    let (a, b) = tokio::join!(
        gate.try_admit(offer, BuyerId::new(1)),
        gate.try_admit(offer, BuyerId::new(2))
    );

    let mut decisions = [a, b];
    decisions.sort_by_key(|d| d.as_str());
    assert_eq!(
        decisions,
        [AdmissionDecision::Admitted, AdmissionDecision::OutOfStock]
    );
}

#[tokio::test]
async fn repeat_buyer_is_rejected_while_stock_remains() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(100).await;
    let gate = pipeline.gate();

    assert_eq!(
        gate.try_admit(offer, BuyerId::new(7)).await,
        AdmissionDecision::Admitted
    );
    let second = gate.try_admit(offer, BuyerId::new(7)).await;
    assert_eq!(second, AdmissionDecision::AlreadyPurchased);
    assert!(second.is_rejection());
    assert_eq!(pipeline.ledger_remaining(offer).await, 99);
}

#[tokio::test]
async fn ledger_outage_fails_closed() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(3).await;
    let gate = pipeline.gate();

    pipeline.ledger.set_unavailable(true);
    let decision = gate.try_admit(offer, BuyerId::new(1)).await;
    assert_eq!(decision, AdmissionDecision::SystemError);
    assert!(decision.is_retryable());
    assert_eq!(pipeline.queue.stats().published, 0);

    pipeline.ledger.set_unavailable(false);
    assert_eq!(pipeline.ledger_remaining(offer).await, 3);
    assert!(pipeline.ledger.purchased(offer).is_empty());
}

#[tokio::test]
async fn unseeded_offer_is_out_of_stock() {
    let pipeline = Pipeline::new();
    let gate = pipeline.gate();

    let decision = gate.try_admit(OfferId::new(999), BuyerId::new(1)).await;
    assert_eq!(decision, AdmissionDecision::OutOfStock);
    assert_eq!(pipeline.ledger.snapshot(OfferId::new(999)).await.unwrap(), None);
}

#[tokio::test]
async fn publish_failure_keeps_reservation_and_parks_intent() {
    let pipeline = Pipeline::new();
    let offer = pipeline.offer(2).await;
    let gate = pipeline.gate();

    pipeline.queue.fail_next_publishes(1);
    let decision = gate.try_admit(offer, BuyerId::new(5)).await;

    assert_eq!(decision, AdmissionDecision::Admitted);
    assert_eq!(pipeline.ledger_remaining(offer).await, 1);
    assert_eq!(pipeline.queue.stats().published, 0);

    let parked = pipeline.outbox.drain();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].intent.buyer_id, BuyerId::new(5));
    assert_eq!(parked[0].intent.offer_id, offer);
    assert_eq!(parked[0].attempts, 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn admissions_never_oversell_or_double_sell((stock, buyers) in workload()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let pipeline = Pipeline::new();
            let offer = pipeline.offer(stock).await;
            let gate = pipeline.gate();

            let mut winners = HashSet::new();
            let mut seen = HashSet::new();
            for buyer in &buyers {
                let decision = gate.try_admit(offer, BuyerId::new(*buyer)).await;
                match decision {
                    AdmissionDecision::Admitted => {
                        prop_assert!(winners.insert(*buyer), "buyer {} admitted twice", buyer);
                    },
                    AdmissionDecision::AlreadyPurchased => {
                        prop_assert!(winners.contains(buyer));
                    },
                    AdmissionDecision::OutOfStock => {
                        prop_assert!(!winners.contains(buyer));
                        prop_assert_eq!(i64::try_from(winners.len()).unwrap(), stock);
                    },
                    AdmissionDecision::SystemError => prop_assert!(false, "unexpected system error"),
                }
                seen.insert(*buyer);
            }

            let expected = stock.min(i64::try_from(seen.len()).unwrap());
            prop_assert_eq!(i64::try_from(winners.len()).unwrap(), expected);

            let remaining = pipeline.ledger_remaining(offer).await;
            prop_assert!(remaining >= 0);
            prop_assert_eq!(remaining, stock - expected);
            prop_assert_eq!(i64::try_from(pipeline.queue.stats().published).unwrap(), expected);
            Ok(())
        })?;
    }
}
