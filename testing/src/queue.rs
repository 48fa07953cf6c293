//! In-memory order queue with at-least-once delivery.
//!
//! Deliveries handed to a subscription stay *unacked* until settled. When
//! the subscription's stream is dropped, its unacked deliveries return to
//! the front of the queue, the way a broker rewinds an uncommitted offset
//! when a consumer goes away.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use flashsale_core::{
    Acknowledger, BoxFuture, Delivery, DeliveryStream, IntentPublisher, IntentSubscriber,
    PurchaseIntent, QueueError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    attempt: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Message>,
    unacked: HashMap<u64, (u64, Message)>,
    published: usize,
    acked: usize,
    requeued: usize,
    rejected: usize,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    next_tag: AtomicU64,
    next_subscription: AtomicU64,
    fail_next_publishes: AtomicUsize,
    fail_next_acks: AtomicUsize,
    fail_next_subscribes: AtomicUsize,
    closed: AtomicBool,
}

impl Shared {
    fn push_back(&self, message: Message) {
        self.state.lock().unwrap().ready.push_back(message);
        self.notify.notify_waiters();
    }

    fn take_next(self: &Arc<Self>, subscription: u64) -> Option<Delivery> {
        let mut state = self.state.lock().unwrap();
        let message = state.ready.pop_front()?;
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        state.unacked.insert(tag, (subscription, message.clone()));

        Some(Delivery::new(
            message.payload,
            message.attempt,
            Box::new(InMemoryAcker {
                shared: Arc::clone(self),
                tag,
            }),
        ))
    }

    fn return_unacked(&self, subscription: Option<u64>) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, (sub, _))| subscription.is_none_or(|s| *sub == s))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        // Oldest delivery ends up first.
        for tag in tags.iter().rev() {
            if let Some((_, message)) = state.unacked.remove(tag) {
                state.ready.push_front(message);
            }
        }
        drop(state);

        if !tags.is_empty() {
            self.notify.notify_waiters();
        }
        tags.len()
    }
}

fn take_failure(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

struct InMemoryAcker {
    shared: Arc<Shared>,
    tag: u64,
}

impl Acknowledger for InMemoryAcker {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), QueueError>> {
        Box::pin(async move {
            if take_failure(&self.shared.fail_next_acks) {
                return Err(QueueError::AckFailed("injected ack failure".to_string()));
            }
            let mut state = self.shared.state.lock().unwrap();
            if state.unacked.remove(&self.tag).is_some() {
                state.acked += 1;
            }
            Ok(())
        })
    }

    fn requeue(self: Box<Self>) -> BoxFuture<'static, Result<(), QueueError>> {
        Box::pin(async move {
            let removed = self.shared.state.lock().unwrap().unacked.remove(&self.tag);
            if let Some((_, mut message)) = removed {
                message.attempt += 1;
                self.shared.state.lock().unwrap().requeued += 1;
                self.shared.push_back(message);
            }
            Ok(())
        })
    }

    fn reject(self: Box<Self>) -> BoxFuture<'static, Result<(), QueueError>> {
        Box::pin(async move {
            let mut state = self.shared.state.lock().unwrap();
            if state.unacked.remove(&self.tag).is_some() {
                state.rejected += 1;
            }
            Ok(())
        })
    }
}

/// Returns a subscription's unacked deliveries when its stream is dropped.
struct SubscriptionGuard {
    shared: Arc<Shared>,
    subscription: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.shared.return_unacked(Some(self.subscription));
    }
}

/// Counters of settled deliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages published
    pub published: usize,
    /// Deliveries acknowledged
    pub acked: usize,
    /// Deliveries requeued
    pub requeued: usize,
    /// Deliveries rejected after dead-lettering
    pub rejected: usize,
    /// Messages waiting for a subscriber
    pub ready: usize,
    /// Deliveries handed out but not settled
    pub unacked: usize,
}

/// In-memory [`IntentPublisher`] + [`IntentSubscriber`].
///
/// Subscribers compete for messages: each message goes to one
/// subscription at a time.
#[derive(Clone, Debug, Default)]
pub struct InMemoryOrderQueue {
    shared: Arc<Shared>,
}

impl InMemoryOrderQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a raw payload, e.g. a malformed one.
    pub fn publish_raw(&self, payload: Vec<u8>) {
        self.shared.state.lock().unwrap().published += 1;
        self.shared.push_back(Message {
            payload,
            attempt: 1,
        });
    }

    /// Fail the next `count` publishes.
    pub fn fail_next_publishes(&self, count: usize) {
        self.shared.fail_next_publishes.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` acknowledgements; the deliveries stay unacked.
    pub fn fail_next_acks(&self, count: usize) {
        self.shared.fail_next_acks.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` subscribe calls.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.shared.fail_next_subscribes.store(count, Ordering::SeqCst);
    }

    /// Close the queue, as on broker shutdown.
    ///
    /// Open subscriptions hand out what is still ready, then end.
    /// Subscriptions taken afterwards end as soon as nothing is ready.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Return every unacked delivery to the queue, as after a visibility timeout.
    pub fn redeliver_unacked(&self) -> usize {
        self.shared.return_unacked(None)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock().unwrap();
        QueueStats {
            published: state.published,
            acked: state.acked,
            requeued: state.requeued,
            rejected: state.rejected,
            ready: state.ready.len(),
            unacked: state.unacked.len(),
        }
    }

    /// Whether every message has been settled.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.ready.is_empty() && state.unacked.is_empty()
    }

    /// Payloads waiting for a subscriber, decoded where possible.
    #[must_use]
    pub fn ready_intents(&self) -> Vec<PurchaseIntent> {
        self.shared
            .state
            .lock()
            .unwrap()
            .ready
            .iter()
            .filter_map(|m| PurchaseIntent::from_bytes(&m.payload).ok())
            .collect()
    }
}

impl IntentPublisher for InMemoryOrderQueue {
    fn publish(&self, intent: &PurchaseIntent) -> BoxFuture<'_, Result<(), QueueError>> {
        let encoded = intent.to_bytes();
        Box::pin(async move {
            if take_failure(&self.shared.fail_next_publishes) {
                return Err(QueueError::PublishFailed {
                    topic: "in-memory".to_string(),
                    reason: "injected publish failure".to_string(),
                });
            }
            self.publish_raw(encoded?);
            Ok(())
        })
    }
}

impl IntentSubscriber for InMemoryOrderQueue {
    fn subscribe(&self) -> BoxFuture<'_, Result<DeliveryStream, QueueError>> {
        Box::pin(async move {
            if take_failure(&self.shared.fail_next_subscribes) {
                return Err(QueueError::SubscriptionFailed {
                    topic: "in-memory".to_string(),
                    reason: "injected subscribe failure".to_string(),
                });
            }

            let shared = Arc::clone(&self.shared);
            let subscription = shared.next_subscription.fetch_add(1, Ordering::SeqCst);
            let guard = SubscriptionGuard {
                shared: Arc::clone(&shared),
                subscription,
            };

            let stream = async_stream::stream! {
                let _guard = guard;
                loop {
                    let mut notified = std::pin::pin!(shared.notify.notified());
                    notified.as_mut().enable();

                    if let Some(delivery) = shared.take_next(subscription) {
                        yield Ok(delivery);
                        continue;
                    }
                    if shared.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    notified.await;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}
