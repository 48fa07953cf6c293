//! Order Queue abstraction.
//!
//! The queue carries [`PurchaseIntent`]s from the admission gate to the
//! fulfillment workers.
//!
//! # Delivery Semantics
//!
//! - **Durable**: a published intent survives a broker restart
//! - **At-least-once**: a delivery that is not acknowledged is delivered again
//! - **Unordered** across buyers and offers
//!
//! Each [`Delivery`] must be settled exactly once:
//!
//! - [`Delivery::ack`] after the durable transaction committed
//! - [`Delivery::requeue`] to have it delivered again with `attempt + 1`
//! - [`Delivery::reject`] to drop it (only after it was dead-lettered)
//!
//! Dropping a delivery without settling it leaves it unacknowledged; the
//! broker redelivers it once the consumer is gone.

use crate::BoxFuture;
use crate::error::QueueError;
use crate::intent::PurchaseIntent;
use futures::Stream;
use std::fmt;
use std::pin::Pin;

/// Broker-side settlement of one delivery.
///
/// Implemented by each queue backend; consumed by value so a delivery can be
/// settled only once.
pub trait Acknowledger: Send {
    /// Acknowledge: the broker forgets the message.
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), QueueError>>;

    /// Negative-acknowledge with redelivery.
    fn requeue(self: Box<Self>) -> BoxFuture<'static, Result<(), QueueError>>;

    /// Negative-acknowledge without redelivery.
    fn reject(self: Box<Self>) -> BoxFuture<'static, Result<(), QueueError>>;
}

/// One delivery of a queued payload.
pub struct Delivery {
    payload: Vec<u8>,
    attempt: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Wrap a raw payload received from the broker.
    ///
    /// `attempt` starts at 1 for the first delivery.
    #[must_use]
    pub fn new(payload: Vec<u8>, attempt: u32, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            payload,
            attempt: attempt.max(1),
            acker,
        }
    }

    /// Raw payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Delivery attempt, starting at 1.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Decode the payload as a purchase intent.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::DeserializationFailed`] for malformed payloads.
    pub fn intent(&self) -> Result<PurchaseIntent, QueueError> {
        PurchaseIntent::from_bytes(&self.payload)
    }

    /// Acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::AckFailed`] if the broker did not accept the ack;
    /// the message may then be delivered again.
    pub async fn ack(self) -> Result<(), QueueError> {
        self.acker.ack().await
    }

    /// Return the delivery to the queue for another attempt.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::AckFailed`] if the broker did not accept it.
    pub async fn requeue(self) -> Result<(), QueueError> {
        self.acker.requeue().await
    }

    /// Drop the delivery without redelivery.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::AckFailed`] if the broker did not accept it.
    pub async fn reject(self) -> Result<(), QueueError> {
        self.acker.reject().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, QueueError>> + Send>>;

/// Publishing half of the Order Queue, used by the admission gate.
pub trait IntentPublisher: Send + Sync {
    /// Durably publish one intent.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::PublishFailed`] if the broker did not confirm
    /// the write.
    fn publish(&self, intent: &PurchaseIntent) -> BoxFuture<'_, Result<(), QueueError>>;
}

/// Consuming half of the Order Queue, used by the fulfillment workers.
///
/// Every call to `subscribe` joins the same competing-consumer group: each
/// intent is delivered to one subscriber at a time.
pub trait IntentSubscriber: Send + Sync {
    /// Open a subscription.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::SubscriptionFailed`] if the broker refuses it.
    fn subscribe(&self) -> BoxFuture<'_, Result<DeliveryStream, QueueError>>;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    impl Acknowledger for Recorder {
        fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), QueueError>> {
            Box::pin(async move {
                self.0.lock().unwrap().push("ack");
                Ok(())
            })
        }

        fn requeue(self: Box<Self>) -> BoxFuture<'static, Result<(), QueueError>> {
            Box::pin(async move {
                self.0.lock().unwrap().push("requeue");
                Ok(())
            })
        }

        fn reject(self: Box<Self>) -> BoxFuture<'static, Result<(), QueueError>> {
            Box::pin(async move {
                self.0.lock().unwrap().push("reject");
                Ok(())
            })
        }
    }

    #[test]
    fn attempts_start_at_one() {
        let delivery = Delivery::new(b"{}".to_vec(), 0, Box::new(Recorder::default()));
        assert_eq!(delivery.attempt(), 1);
    }

    #[test]
    fn garbage_payload_is_malformed() {
        let delivery = Delivery::new(b"not json".to_vec(), 1, Box::new(Recorder::default()));
        let err = delivery.intent().unwrap_err();
        assert_eq!(err.class(), crate::ErrorClass::Malformed);
    }

    #[tokio::test]
    async fn settling_reaches_the_acknowledger() {
        let recorder = Recorder::default();
        for settle in 0..3 {
            let delivery = Delivery::new(Vec::new(), 1, Box::new(recorder.clone()));
            match settle {
                0 => delivery.ack().await.unwrap(),
                1 => delivery.requeue().await.unwrap(),
                _ => delivery.reject().await.unwrap(),
            }
        }
        assert_eq!(*recorder.0.lock().unwrap(), ["ack", "requeue", "reject"]);
    }
}
