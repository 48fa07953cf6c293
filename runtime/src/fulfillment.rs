//! Durable materialization of admitted reservations.
//!
//! Each delivery moves through
//!
//! ```text
//! Received ──► Processing ──┬──► Committed / Absorbed  (ack)
//!                           ├──► Requeued              (transient failure, attempt < max)
//!                           └──► DeadLettered          (malformed, drift, retries exhausted)
//! ```
//!
//! A delivery is acknowledged only after the order transaction has committed
//! or the dead-letter row is written. Anything else leaves it for the broker
//! to redeliver, and the `(buyer, offer)` uniqueness constraint turns every
//! redelivery of a committed intent into a no-op.
//!
//! [`FulfillmentWorker`] wraps [`FulfillmentHandler`] in the
//! subscribe-process-reconnect loop; [`WorkerPool`] runs several workers
//! with a start/stop/drain lifecycle. Stopping only interrupts a worker
//! while it waits for the next delivery, so an in-flight transaction always
//! finishes and settles.

use crate::error::RuntimeError;
use crate::metrics::FulfillmentMetrics;
use crate::retry::RetryPolicy;
use flashsale_core::{
    Clock, DeadLetter, DeadLetterReason, DeadLetterSink, Delivery, DeliveryStream,
    FulfillmentError, FulfillmentOutcome, IdGenerator, IntentSubscriber, OrderStore,
    PurchaseIntent, QueueError,
};
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Default delivery attempts before a transiently failing intent is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default pause before a worker resubscribes.
pub const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// How one delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// A new order was committed and the delivery acknowledged
    Committed,
    /// The order already existed; the delivery was acknowledged
    Absorbed,
    /// A transient failure sent the delivery back to the queue
    Requeued,
    /// The delivery was recorded as a dead letter and dropped
    DeadLettered,
}

/// Processes single deliveries against the order store.
#[derive(Clone)]
pub struct FulfillmentHandler {
    store: Arc<dyn OrderStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    retry_policy: RetryPolicy,
}

impl FulfillmentHandler {
    /// Create a handler with the default retry budget.
    #[must_use]
    pub fn new(
        store: Arc<dyn OrderStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            dead_letters,
            ids,
            clock,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_policy: RetryPolicy::builder()
                .initial_delay(Duration::from_millis(100))
                .max_delay(Duration::from_secs(5))
                .jitter(true)
                .build(),
        }
    }

    /// Set the delivery attempts allowed before dead-lettering (minimum 1).
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the backoff applied before requeueing a failed delivery.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Delivery attempts allowed before dead-lettering.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Fulfill and settle one delivery.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] when the delivery could not be acknowledged,
    /// requeued or rejected. The delivery is then unsettled and the broker
    /// will redeliver it once the subscription is dropped.
    pub async fn handle(&self, delivery: Delivery) -> Result<Settlement, QueueError> {
        let start = Instant::now();
        let attempt = delivery.attempt();

        let intent = match delivery.intent() {
            Ok(intent) => intent,
            Err(e) => {
                warn!(attempt, error = %e, "Malformed purchase intent");
                return self
                    .dead_letter(delivery, None, DeadLetterReason::Malformed, e.to_string())
                    .await;
            },
        };

        let order_id = self.ids.next_id();
        match self.store.fulfill(&intent, order_id, self.clock.now()).await {
            Ok(FulfillmentOutcome::Created(order)) => {
                delivery.ack().await?;
                FulfillmentMetrics::record_created(start.elapsed());
                info!(
                    order_id = %order.order_id,
                    offer_id = %order.offer_id,
                    buyer_id = %order.buyer_id,
                    attempt,
                    "Order committed"
                );
                Ok(Settlement::Committed)
            },
            Ok(FulfillmentOutcome::Duplicate) => {
                delivery.ack().await?;
                FulfillmentMetrics::record_duplicate();
                info!(
                    offer_id = %intent.offer_id,
                    buyer_id = %intent.buyer_id,
                    attempt,
                    "Order already exists, redelivery absorbed"
                );
                Ok(Settlement::Absorbed)
            },
            Err(e @ FulfillmentError::Drift { .. }) => {
                FulfillmentMetrics::record_drift();
                error!(
                    offer_id = %intent.offer_id,
                    buyer_id = %intent.buyer_id,
                    attempt,
                    "Stock drift: ledger admitted a buyer the durable stock cannot cover"
                );
                self.dead_letter(delivery, Some(intent), DeadLetterReason::Drift, e.to_string())
                    .await
            },
            Err(FulfillmentError::Store(e)) => {
                if attempt >= self.max_attempts {
                    error!(
                        offer_id = %intent.offer_id,
                        buyer_id = %intent.buyer_id,
                        attempt,
                        error = %e,
                        "Fulfillment retries exhausted"
                    );
                    return self
                        .dead_letter(
                            delivery,
                            Some(intent),
                            DeadLetterReason::RetriesExhausted,
                            e.to_string(),
                        )
                        .await;
                }

                let delay = self.retry_policy.delay_for_attempt(attempt - 1);
                warn!(
                    offer_id = %intent.offer_id,
                    buyer_id = %intent.buyer_id,
                    attempt,
                    max_attempts = self.max_attempts,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "Fulfillment failed, requeueing"
                );
                tokio::time::sleep(delay).await;
                delivery.requeue().await?;
                FulfillmentMetrics::record_retry();
                Ok(Settlement::Requeued)
            },
        }
    }

    async fn dead_letter(
        &self,
        delivery: Delivery,
        intent: Option<PurchaseIntent>,
        reason: DeadLetterReason,
        error_message: String,
    ) -> Result<Settlement, QueueError> {
        let letter = DeadLetter {
            payload: delivery.payload().to_vec(),
            intent,
            reason,
            error_message,
            attempts: delivery.attempt(),
            failed_at: self.clock.now(),
        };

        match self.dead_letters.dead_letter(letter).await {
            Ok(id) => {
                delivery.reject().await?;
                FulfillmentMetrics::record_dead_letter(reason);
                warn!(dead_letter_id = id, %reason, "Delivery dead-lettered");
                Ok(Settlement::DeadLettered)
            },
            Err(e) => {
                // Without the row the message must stay in the queue.
                error!(%reason, error = %e, "Failed to write dead letter, requeueing");
                delivery.requeue().await?;
                Ok(Settlement::Requeued)
            },
        }
    }
}

impl std::fmt::Debug for FulfillmentHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FulfillmentHandler")
            .field("max_attempts", &self.max_attempts)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

enum StreamEnd {
    Shutdown,
    Resubscribe,
}

/// One supervised consumer of the order queue.
///
/// Runs until the shutdown channel fires or closes. A failed subscription,
/// an ended stream or a delivery that could not be settled all lead to a
/// fresh subscription after `resubscribe_delay`.
pub struct FulfillmentWorker {
    name: String,
    subscriber: Arc<dyn IntentSubscriber>,
    handler: FulfillmentHandler,
    shutdown: broadcast::Receiver<()>,
    in_flight: Arc<AtomicUsize>,
    resubscribe_delay: Duration,
}

impl FulfillmentWorker {
    /// Create a worker.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        subscriber: Arc<dyn IntentSubscriber>,
        handler: FulfillmentHandler,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name: name.into(),
            subscriber,
            handler,
            shutdown,
            in_flight: Arc::new(AtomicUsize::new(0)),
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
        }
    }

    /// Set the pause before resubscribing.
    #[must_use]
    pub const fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Share an in-flight counter with the owner of this worker.
    #[must_use]
    pub fn with_in_flight(mut self, in_flight: Arc<AtomicUsize>) -> Self {
        self.in_flight = in_flight;
        self
    }

    /// Spawn the worker as a background task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the subscribe-process-reconnect loop until shutdown.
    pub async fn run(mut self) {
        info!(worker = %self.name, "Fulfillment worker started");

        loop {
            let subscribed = tokio::select! {
                _ = self.shutdown.recv() => break,
                subscribed = self.subscriber.subscribe() => subscribed,
            };

            match subscribed {
                Ok(stream) => {
                    info!(worker = %self.name, "Subscribed to order queue");
                    if let StreamEnd::Shutdown = self.process_stream(stream).await {
                        break;
                    }
                    warn!(
                        worker = %self.name,
                        "Order stream interrupted, resubscribing in {:?}",
                        self.resubscribe_delay
                    );
                },
                Err(e) => {
                    error!(
                        worker = %self.name,
                        error = %e,
                        "Failed to subscribe to order queue, retrying in {:?}",
                        self.resubscribe_delay
                    );
                },
            }

            FulfillmentMetrics::record_resubscription();
            tokio::select! {
                _ = self.shutdown.recv() => break,
                () = tokio::time::sleep(self.resubscribe_delay) => {},
            }
        }

        info!(worker = %self.name, "Fulfillment worker stopped");
    }

    async fn process_stream(&mut self, mut stream: DeliveryStream) -> StreamEnd {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.recv() => return StreamEnd::Shutdown,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.in_flight.fetch_add(1, Ordering::AcqRel);
                    let settled = self.handler.handle(delivery).await;
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);

                    if let Err(e) = settled {
                        // Later offsets must not be committed past an unsettled one.
                        FulfillmentMetrics::record_settle_failure();
                        error!(worker = %self.name, error = %e, "Failed to settle delivery");
                        return StreamEnd::Resubscribe;
                    }
                },
                Some(Err(e)) => {
                    warn!(worker = %self.name, error = %e, "Order stream error");
                },
                None => return StreamEnd::Resubscribe,
            }
        }
    }
}

/// A set of fulfillment workers sharing one shutdown channel.
///
/// ```rust,ignore
/// let mut pool = WorkerPool::new(subscriber, handler);
/// pool.start(4);
/// // ...
/// pool.drain(Duration::from_secs(30)).await?;
/// ```
pub struct WorkerPool {
    subscriber: Arc<dyn IntentSubscriber>,
    handler: FulfillmentHandler,
    shutdown: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
    resubscribe_delay: Duration,
}

impl WorkerPool {
    /// Create an idle pool.
    #[must_use]
    pub fn new(subscriber: Arc<dyn IntentSubscriber>, handler: FulfillmentHandler) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            subscriber,
            handler,
            shutdown,
            handles: Vec::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
        }
    }

    /// Set the pause workers take before resubscribing.
    #[must_use]
    pub const fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Spawn `count` workers.
    pub fn start(&mut self, count: usize) {
        let first = self.handles.len();
        for n in first..first + count {
            let worker = FulfillmentWorker::new(
                format!("fulfillment-{n}"),
                Arc::clone(&self.subscriber),
                self.handler.clone(),
                self.shutdown.subscribe(),
            )
            .with_resubscribe_delay(self.resubscribe_delay)
            .with_in_flight(Arc::clone(&self.in_flight));
            self.handles.push(worker.spawn());
        }
        info!(workers = self.handles.len(), "Worker pool started");
    }

    /// Stop pulling new deliveries. In-flight deliveries keep running.
    pub fn stop(&self) {
        // No receivers means no running workers.
        let _ = self.shutdown.send(());
    }

    /// Deliveries currently being processed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Workers whose task has not finished.
    #[must_use]
    pub fn running(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Stop intake and wait for every worker to settle its in-flight delivery.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ShutdownTimeout`] with the number of deliveries
    /// still in flight if the workers have not finished within `timeout`.
    pub async fn drain(&mut self, timeout: Duration) -> Result<(), RuntimeError> {
        info!(workers = self.handles.len(), "Draining worker pool");
        self.stop();

        let start = Instant::now();
        let poll_interval = Duration::from_millis(50);

        loop {
            let running = self.running();
            if running == 0 {
                break;
            }

            if start.elapsed() >= timeout {
                let in_flight = self.in_flight();
                error!(running, in_flight, "Drain timed out with deliveries in flight");
                return Err(RuntimeError::ShutdownTimeout(in_flight));
            }

            tokio::time::sleep(poll_interval).await;
        }

        for handle in self.handles.drain(..) {
            handle.await?;
        }

        info!("Worker pool drained");
        Ok(())
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.handles.len())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}
