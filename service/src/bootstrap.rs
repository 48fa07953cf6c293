//! Infrastructure setup for the fulfillment process.
//!
//! [`Services`] connects to the three backing systems, verifies each one
//! answers, runs migrations and wires the runtime components on top. Any
//! failure here is a [`BootstrapError`]: the process must not start serving
//! with a collaborator it cannot reach.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = Config::from_env()?;
//! let services = Services::connect(&config).await?;
//! services.seeder().seed_all().await?;
//!
//! let mut pool = services.worker_pool();
//! pool.start(config.workers.count);
//! ```

use crate::config::{Config, ConfigError};
use flashsale_core::{
    DeadLetterSink, ErrorClass, IdGeneratorError, LedgerError, OrderStore, QueueError,
    SnowflakeGenerator, StockLedger, StoreError, SystemClock,
};
use flashsale_postgres::{DeadLetterQueue, PostgresOrderStore};
use flashsale_redis::RedisStockLedger;
use flashsale_redpanda::RedpandaOrderQueue;
use flashsale_runtime::metrics::MetricsError;
use flashsale_runtime::outbox::DEFAULT_OUTBOX_CAPACITY;
use flashsale_runtime::retry::retry_with_backoff;
use flashsale_runtime::{
    AdmissionGate, FulfillmentHandler, HealthMonitor, LedgerSeeder, Reconciler, RetryPolicy,
    RuntimeError, UnpublishedIntents, WorkerPool,
};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

/// Startup failures. All of them are fatal.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// Configuration is unusable
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The stock ledger is unreachable
    #[error("Stock ledger unavailable: {0}")]
    Ledger(#[from] LedgerError),

    /// The order store is unreachable or could not be migrated
    #[error("Order store unavailable: {0}")]
    Store(#[from] StoreError),

    /// The order queue is unreachable
    #[error("Order queue unavailable: {0}")]
    Queue(#[from] QueueError),

    /// The order id generator rejected its node id
    #[error(transparent)]
    IdGenerator(#[from] IdGeneratorError),

    /// Startup seeding failed
    #[error("Startup seeding failed: {0}")]
    Seeding(#[from] RuntimeError),

    /// The metrics exporter could not start
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

impl BootstrapError {
    /// Handling class.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        ErrorClass::FatalConfig
    }
}

/// Connected collaborators and the components built on them.
pub struct Services {
    ledger: Arc<dyn StockLedger>,
    store: Arc<dyn OrderStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    queue: Arc<RedpandaOrderQueue>,
    ids: Arc<SnowflakeGenerator>,
    clock: Arc<SystemClock>,
    outbox: Arc<UnpublishedIntents>,
    max_delivery_attempts: u32,
    retry_policy: RetryPolicy,
    reconcile_interval: Option<Duration>,
}

impl Services {
    /// Connect to Postgres, Redis and Redpanda and check each one answers.
    ///
    /// Each connection is retried with exponential backoff up to
    /// `STARTUP_RETRIES` times, so the service can start alongside its
    /// collaborators. Runs the order store migrations before returning.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] if any collaborator is still unreachable
    /// once its retries are spent.
    pub async fn connect(config: &Config) -> Result<Self, BootstrapError> {
        let policy = startup_retry_policy(config.server.startup_retries);

        info!("Connecting to order store database...");
        let store = wait_for("order store", &policy, move || async move {
            let store = PostgresOrderStore::connect(
                &config.postgres.url,
                config.postgres.max_connections,
                config.connect_timeout(),
            )
            .await?;
            store.ping().await?;
            Ok::<_, StoreError>(store)
        })
        .await?;
        store.migrate().await?;
        info!("Order store connected and migrated");

        info!("Connecting to stock ledger...");
        let ledger = wait_for("stock ledger", &policy, move || async move {
            let ledger = RedisStockLedger::new(&config.redis.url).await?;
            ledger.ping().await?;
            Ok::<_, LedgerError>(ledger)
        })
        .await?;
        info!("Stock ledger connected");

        info!("Connecting to Redpanda order queue...");
        let queue = RedpandaOrderQueue::builder()
            .brokers(&config.redpanda.brokers)
            .topic(&config.redpanda.order_topic)
            .consumer_group(&config.redpanda.consumer_group)
            .build()?;
        let pinged = &queue;
        wait_for("order queue", &policy, move || pinged.ping()).await?;
        info!(topic = %queue.topic(), "Order queue connected");

        let ids = SnowflakeGenerator::new(config.workers.node_id)?;
        let dead_letters = DeadLetterQueue::new(store.pool().clone());

        Ok(Self {
            ledger: Arc::new(ledger),
            store: Arc::new(store),
            dead_letters: Arc::new(dead_letters),
            queue: Arc::new(queue),
            ids: Arc::new(ids),
            clock: Arc::new(SystemClock),
            outbox: Arc::new(UnpublishedIntents::new(DEFAULT_OUTBOX_CAPACITY)),
            max_delivery_attempts: config.workers.max_delivery_attempts,
            retry_policy: RetryPolicy::builder()
                .initial_delay(Duration::from_millis(config.workers.retry_initial_delay_ms))
                .max_delay(Duration::from_millis(config.workers.retry_max_delay_ms))
                .jitter(true)
                .build(),
            reconcile_interval: config.reconcile_interval(),
        })
    }

    /// Seeder over the connected ledger and store.
    #[must_use]
    pub fn seeder(&self) -> LedgerSeeder {
        LedgerSeeder::new(
            Arc::clone(&self.ledger),
            Arc::clone(&self.store),
            self.clock.clone(),
        )
    }

    /// Admission gate for the request layer.
    #[must_use]
    pub fn admission_gate(&self) -> AdmissionGate {
        AdmissionGate::new(
            Arc::clone(&self.ledger),
            self.queue.clone(),
            self.clock.clone(),
            Arc::clone(&self.outbox),
        )
    }

    /// An idle pool of fulfillment workers.
    #[must_use]
    pub fn worker_pool(&self) -> WorkerPool {
        let handler = FulfillmentHandler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.dead_letters),
            self.ids.clone(),
            self.clock.clone(),
        )
        .with_max_attempts(self.max_delivery_attempts)
        .with_retry_policy(self.retry_policy.clone());

        WorkerPool::new(self.queue.clone(), handler)
    }

    /// The reconciler, or `None` when reconciliation is disabled.
    #[must_use]
    pub fn reconciler(&self) -> Option<Reconciler> {
        self.reconcile_interval.map(|interval| {
            Reconciler::new(self.seeder(), self.queue.clone(), Arc::clone(&self.outbox))
                .with_interval(interval)
        })
    }

    /// Health monitor over every collaborator.
    #[must_use]
    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(
            Arc::clone(&self.ledger),
            Arc::clone(&self.store),
            Arc::clone(&self.dead_letters),
        )
        .with_outbox(Arc::clone(&self.outbox))
    }
}

/// Backoff for collaborators that may still be starting.
#[must_use]
pub fn startup_retry_policy(max_retries: usize) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(max_retries)
        .initial_delay(Duration::from_millis(500))
        .max_delay(Duration::from_secs(5))
        .jitter(true)
        .build()
}

/// Run `check` until it succeeds or `policy` gives up.
async fn wait_for<F, Fut, T, E>(component: &'static str, policy: &RetryPolicy, check: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let result = retry_with_backoff(policy, check).await;
    if let Err(e) = &result {
        error!(component, error = %e, "Collaborator unreachable, giving up");
    }
    result
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("topic", &self.queue.topic())
            .field("node_id", &self.ids.node_id())
            .field("max_delivery_attempts", &self.max_delivery_attempts)
            .field("reconcile_interval", &self.reconcile_interval)
            .finish_non_exhaustive()
    }
}
