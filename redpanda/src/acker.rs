//! Offset settlement for deliveries read from a Kafka partition.

use flashsale_core::BoxFuture;
use flashsale_core::error::QueueError;
use flashsale_core::queue::Acknowledger;
use rdkafka::Offset;
use rdkafka::TopicPartitionList;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedHeaders, Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;

/// Header carrying the delivery attempt of a requeued intent.
pub const ATTEMPT_HEADER: &str = "delivery-attempt";

/// Read the delivery attempt from message headers (1 when absent).
pub(crate) fn attempt_from_headers(headers: Option<&BorrowedHeaders>) -> u32 {
    headers
        .and_then(|headers| {
            headers
                .iter()
                .find(|header| header.key == ATTEMPT_HEADER)
                .and_then(|header| header.value)
                .and_then(|value| std::str::from_utf8(value).ok())
                .and_then(|value| value.parse::<u32>().ok())
        })
        .unwrap_or(1)
}

/// Settles one consumed message.
///
/// Kafka has no per-message nack, so:
///
/// - `ack` / `reject` commit the offset past the message
/// - `requeue` republishes the payload to the same topic with
///   [`ATTEMPT_HEADER`] incremented, then commits the original offset
///
/// Commits are cumulative per partition. Workers settle deliveries of a
/// subscription in order, so a commit never skips an unsettled message.
pub(crate) struct KafkaAcker {
    pub(crate) consumer: Arc<StreamConsumer>,
    pub(crate) producer: FutureProducer,
    pub(crate) topic: String,
    pub(crate) partition: i32,
    pub(crate) offset: i64,
    pub(crate) key: Option<Vec<u8>>,
    pub(crate) payload: Vec<u8>,
    pub(crate) attempt: u32,
    pub(crate) timeout: Duration,
}

impl KafkaAcker {
    fn commit(&self) -> Result<(), QueueError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, self.partition, Offset::Offset(self.offset + 1))
            .map_err(|e| QueueError::AckFailed(format!("Invalid commit position: {e}")))?;

        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| {
                tracing::warn!(
                    topic = %self.topic,
                    partition = self.partition,
                    offset = self.offset,
                    error = %e,
                    "Failed to commit offset (message may be redelivered)"
                );
                QueueError::AckFailed(e.to_string())
            })
    }

    async fn republish(&self) -> Result<(), QueueError> {
        let next_attempt = (self.attempt + 1).to_string();
        let headers = OwnedHeaders::new().insert(Header {
            key: ATTEMPT_HEADER,
            value: Some(next_attempt.as_str()),
        });

        let mut record = FutureRecord::to(&self.topic)
            .payload(&self.payload)
            .headers(headers);
        if let Some(key) = &self.key {
            record = record.key(key);
        }

        self.producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _)| {
                tracing::error!(
                    topic = %self.topic,
                    partition = self.partition,
                    offset = self.offset,
                    error = %e,
                    "Failed to republish intent for retry"
                );
                QueueError::AckFailed(format!("Requeue failed: {e}"))
            })
    }
}

impl Acknowledger for KafkaAcker {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), QueueError>> {
        Box::pin(async move { self.commit() })
    }

    fn requeue(self: Box<Self>) -> BoxFuture<'static, Result<(), QueueError>> {
        Box::pin(async move {
            self.republish().await?;

            tracing::debug!(
                topic = %self.topic,
                partition = self.partition,
                offset = self.offset,
                next_attempt = self.attempt + 1,
                "Intent requeued"
            );

            self.commit()
        })
    }

    fn reject(self: Box<Self>) -> BoxFuture<'static, Result<(), QueueError>> {
        Box::pin(async move { self.commit() })
    }
}
