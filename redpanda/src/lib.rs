//! Redpanda Order Queue for the flash-sale pipeline.
//!
//! This crate bridges the admission gate and the fulfillment workers over a
//! Kafka-compatible broker using rdkafka. It implements both halves of the
//! Order Queue: [`IntentPublisher`] and [`IntentSubscriber`].
//!
//! # Delivery Semantics
//!
//! **Durable publish**: the producer waits for `acks=all` with idempotence
//! enabled, so a confirmed publish survives a broker restart.
//!
//! **At-least-once delivery** with manual offset commits:
//! - Offsets are committed only when the worker settles a [`Delivery`]
//! - If the process crashes before commit, the intent is redelivered
//! - Intents are keyed by offer id; there is no ordering across offers
//!
//! **Retries**: Kafka has no negative acknowledgement. A requeued delivery is
//! republished to the same topic with a `delivery-attempt` header one higher
//! than the current attempt, then its original offset is committed.
//!
//! # Example
//!
//! ```no_run
//! use flashsale_core::{BuyerId, OfferId, PurchaseIntent};
//! use flashsale_core::queue::{IntentPublisher, IntentSubscriber};
//! use flashsale_redpanda::RedpandaOrderQueue;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = RedpandaOrderQueue::builder()
//!     .brokers("localhost:9092")
//!     .topic("flashsale-orders")
//!     .consumer_group("flashsale-fulfillment")
//!     .build()?;
//!
//! let intent = PurchaseIntent::new(BuyerId::new(7), OfferId::new(1), chrono::Utc::now());
//! queue.publish(&intent).await?;
//!
//! let mut deliveries = queue.subscribe().await?;
//! while let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     println!("attempt {}: {:?}", delivery.attempt(), delivery.intent());
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod acker;

pub use acker::ATTEMPT_HEADER;

use acker::{KafkaAcker, attempt_from_headers};
use flashsale_core::BoxFuture;
use flashsale_core::error::QueueError;
use flashsale_core::intent::PurchaseIntent;
use flashsale_core::queue::{Delivery, DeliveryStream, IntentPublisher, IntentSubscriber};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;

/// Default topic for purchase intents.
pub const DEFAULT_TOPIC: &str = "flashsale-orders";

/// Default consumer group of the fulfillment workers.
pub const DEFAULT_CONSUMER_GROUP: &str = "flashsale-fulfillment";

/// Redpanda-backed Order Queue.
///
/// # Example
///
/// ```no_run
/// use flashsale_redpanda::RedpandaOrderQueue;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let queue = RedpandaOrderQueue::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .timeout(std::time::Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaOrderQueue {
    /// Producer for publishing and requeueing intents
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Intent topic
    topic: String,
    /// Consumer group shared by all workers
    consumer_group: String,
    /// Producer timeout
    timeout: Duration,
    /// Deliveries read ahead per subscription
    buffer_size: usize,
    /// Auto offset reset policy
    auto_offset_reset: String,
}

impl RedpandaOrderQueue {
    /// Create a queue on the default topic and consumer group.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, QueueError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the queue.
    #[must_use]
    pub fn builder() -> RedpandaOrderQueueBuilder {
        RedpandaOrderQueueBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Intent topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consumer group of the subscriptions.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// Check that the brokers answer a metadata request for the intent topic.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if no broker answers within
    /// the producer timeout.
    pub async fn ping(&self) -> Result<(), QueueError> {
        let producer = self.producer.clone();
        let topic = self.topic.clone();
        let timeout = self.timeout;

        // Metadata requests block the calling thread.
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(Some(&topic), Timeout::After(timeout))
                .map(|_| ())
        })
        .await
        .map_err(|e| QueueError::ConnectionFailed(format!("Metadata request aborted: {e}")))?
        .map_err(|e| QueueError::ConnectionFailed(format!("Brokers unreachable: {e}")))
    }
}

/// Builder for configuring a [`RedpandaOrderQueue`].
#[derive(Default)]
pub struct RedpandaOrderQueueBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    consumer_group: Option<String>,
    producer_acks: Option<String>,
    timeout: Option<Duration>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaOrderQueueBuilder {
    /// Set the broker addresses.
    ///
    /// # Parameters
    ///
    /// - `brokers`: Comma-separated list of broker addresses (e.g., "localhost:9092")
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the intent topic (default: `flashsale-orders`).
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the consumer group (default: `flashsale-fulfillment`).
    ///
    /// Every subscription joins this group, so workers across processes
    /// compete for partitions.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set the producer acknowledgment mode.
    ///
    /// Default: "all". Anything weaker gives up publish durability.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set how many deliveries a subscription reads ahead of the worker.
    ///
    /// Default: 16. Values below 1 are raised to 1.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Set the auto offset reset policy for a group with no committed offset.
    ///
    /// Default: "earliest", so intents published before the first worker
    /// joined are not skipped.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaOrderQueue`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if:
    /// - Brokers not set
    /// - Cannot create producer
    /// - Invalid configuration
    pub fn build(self) -> Result<RedpandaOrderQueue, QueueError> {
        let brokers = self
            .brokers
            .ok_or_else(|| QueueError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("enable.idempotence", if acks == "all" { "true" } else { "false" })
            .create()
            .map_err(|e| {
                QueueError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        let queue = RedpandaOrderQueue {
            producer,
            brokers,
            topic: self.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
            consumer_group: self
                .consumer_group
                .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
            timeout,
            buffer_size: self.buffer_size.unwrap_or(16),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
        };

        tracing::info!(
            brokers = %queue.brokers,
            topic = %queue.topic,
            consumer_group = %queue.consumer_group,
            acks,
            buffer_size = queue.buffer_size,
            "RedpandaOrderQueue created"
        );

        Ok(queue)
    }
}

impl IntentPublisher for RedpandaOrderQueue {
    fn publish(&self, intent: &PurchaseIntent) -> BoxFuture<'_, Result<(), QueueError>> {
        let intent = intent.clone();

        Box::pin(async move {
            let payload = intent.to_bytes()?;
            let key = intent.partition_key();

            let record = FutureRecord::to(&self.topic).payload(&payload).key(&key);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %self.topic,
                        partition,
                        offset,
                        buyer_id = %intent.buyer_id,
                        offer_id = %intent.offer_id,
                        "Intent published"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => Err(QueueError::PublishFailed {
                    topic: self.topic.clone(),
                    reason: kafka_error.to_string(),
                }),
            }
        })
    }
}

impl IntentSubscriber for RedpandaOrderQueue {
    fn subscribe(&self) -> BoxFuture<'_, Result<DeliveryStream, QueueError>> {
        Box::pin(async move {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &self.consumer_group)
                .set("enable.auto.commit", "false") // Offsets move only when a worker settles
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| QueueError::SubscriptionFailed {
                    topic: self.topic.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            consumer
                .subscribe(&[self.topic.as_str()])
                .map_err(|e| QueueError::SubscriptionFailed {
                    topic: self.topic.clone(),
                    reason: format!("Failed to subscribe to topic: {e}"),
                })?;

            tracing::info!(
                topic = %self.topic,
                consumer_group = %self.consumer_group,
                buffer_size = self.buffer_size,
                manual_commit = true,
                "Subscribed to intent topic"
            );

            let consumer = Arc::new(consumer);
            let producer = self.producer.clone();
            let timeout = self.timeout;
            let (tx, rx) = tokio::sync::mpsc::channel(self.buffer_size);

            // The task owns the read loop; deliveries carry their own commit handle.
            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();

                while let Some(msg_result) = stream.next().await {
                    let delivery = match msg_result {
                        Ok(message) => {
                            let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
                            let attempt = attempt_from_headers(message.headers());

                            tracing::trace!(
                                topic = message.topic(),
                                partition = message.partition(),
                                offset = message.offset(),
                                attempt,
                                "Received intent"
                            );

                            let acker = KafkaAcker {
                                consumer: Arc::clone(&consumer),
                                producer: producer.clone(),
                                topic: message.topic().to_string(),
                                partition: message.partition(),
                                offset: message.offset(),
                                key: message.key().map(<[u8]>::to_vec),
                                payload: payload.clone(),
                                attempt,
                                timeout,
                            };

                            Ok(Delivery::new(payload, attempt, Box::new(acker)))
                        },
                        Err(e) => Err(QueueError::TransportError(format!(
                            "Failed to receive message: {e}"
                        ))),
                    };

                    if tx.send(delivery).await.is_err() {
                        // Unsettled deliveries stay uncommitted and are redelivered
                        tracing::debug!("Subscription dropped, exiting consumer task");
                        break;
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}
