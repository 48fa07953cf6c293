//! The only bridge between durable truth and the stock ledger.
//!
//! [`LedgerSeeder`] initializes ledger entries from the order store at
//! startup and when offers are provisioned. [`Reconciler`] periodically
//! corrects ledger counters and republishes parked intents.
//!
//! # Reconciliation
//!
//! For an open offer with durable snapshot `remaining` / `orders`:
//!
//! ```text
//! allotment = remaining + orders
//! target    = min(allotment - |purchased set|, remaining)
//! ```
//!
//! `allotment - |purchased set|` is durable remaining minus reservations
//! still in flight. The `min` keeps the counter from exceeding durable
//! stock when the purchased set lost members. The ledger evaluates the
//! formula atomically against its live set, so concurrent admissions
//! cannot slip between the read and the write.

use crate::error::RuntimeError;
use crate::metrics::SeederMetrics;
use crate::outbox::{FlushReport, UnpublishedIntents};
use crate::retry::RetryPolicy;
use flashsale_core::{
    Clock, IntentPublisher, NewOffer, Offer, OfferStock, OrderStore, ReconcileReport, StockLedger,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Result of seeding every open offer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    /// Offers written into the ledger
    pub seeded: usize,
    /// Offers the ledger already held
    pub present: usize,
}

/// Loads durable stock into the ledger.
#[derive(Clone)]
pub struct LedgerSeeder {
    ledger: Arc<dyn StockLedger>,
    store: Arc<dyn OrderStore>,
    clock: Arc<dyn Clock>,
}

impl LedgerSeeder {
    /// Create a seeder.
    #[must_use]
    pub fn new(ledger: Arc<dyn StockLedger>, store: Arc<dyn OrderStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger,
            store,
            clock,
        }
    }

    /// Seed every open offer the ledger does not already hold.
    ///
    /// # Errors
    ///
    /// Returns the first store or ledger error; offers seeded before it
    /// stay seeded.
    pub async fn seed_all(&self) -> Result<SeedReport, RuntimeError> {
        let stocks = self.store.open_offer_stocks(self.clock.now()).await?;

        let mut report = SeedReport::default();
        for stock in &stocks {
            if self.seed_offer(stock).await? {
                report.seeded += 1;
            } else {
                report.present += 1;
            }
        }

        SeederMetrics::record_seeded(report.seeded);
        info!(
            seeded = report.seeded,
            present = report.present,
            "Stock ledger seeded from durable store"
        );
        Ok(report)
    }

    /// Seed one offer from its durable snapshot.
    ///
    /// The purchased set starts at the buyers that already hold orders and
    /// the counter at `allotment - |buyers|`. Buyers are read after the
    /// snapshot, so orders committed in between are counted against the
    /// allotment, which does not change, rather than against a stale
    /// `remaining`. Returns `false` if the ledger already had an entry,
    /// which is left untouched.
    ///
    /// # Errors
    ///
    /// Returns a store error if buyers cannot be loaded, or a ledger error.
    pub async fn seed_offer(&self, stock: &OfferStock) -> Result<bool, RuntimeError> {
        let buyers = self.store.buyers_for_offer(stock.offer_id).await?;
        let remaining = seed_counter(stock, buyers.len());
        let seeded = self
            .ledger
            .seed_if_absent(stock.offer_id, remaining, &buyers)
            .await?;

        if seeded {
            info!(
                offer_id = %stock.offer_id,
                remaining,
                purchased = buyers.len(),
                "Offer seeded into stock ledger"
            );
        }
        Ok(seeded)
    }

    /// Define a new offer: durable row first, then the ledger entry.
    ///
    /// The offer is returned only once both writes succeeded, so no
    /// admission can reach it before the ledger knows its stock.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidOffer`] for negative stock or an empty
    /// sale window, otherwise the store or ledger error.
    pub async fn provision_offer(&self, offer: &NewOffer) -> Result<Offer, RuntimeError> {
        if offer.stock < 0 {
            return Err(RuntimeError::InvalidOffer(format!(
                "stock must be non-negative, got {}",
                offer.stock
            )));
        }
        if offer.ends_at <= offer.starts_at {
            return Err(RuntimeError::InvalidOffer(
                "sale window must end after it starts".to_string(),
            ));
        }

        let created = self.store.create_offer(offer).await?;
        let seeded = self.ledger.seed_if_absent(created.id, created.stock, &[]).await?;
        if !seeded {
            warn!(offer_id = %created.id, "Ledger already held an entry for a new offer");
        }

        SeederMetrics::record_seeded(1);
        info!(offer_id = %created.id, stock = created.stock, "Offer provisioned");
        Ok(created)
    }
}

/// Units still sellable once `purchased` buyers hold orders.
fn seed_counter(stock: &OfferStock, purchased: usize) -> i64 {
    let purchased = i64::try_from(purchased).unwrap_or(i64::MAX);
    stock.allotment().saturating_sub(purchased).max(0)
}

impl std::fmt::Debug for LedgerSeeder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerSeeder").finish_non_exhaustive()
    }
}

/// Default time between reconciliation passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Periodic ledger correction and outbox republishing.
pub struct Reconciler {
    seeder: LedgerSeeder,
    publisher: Arc<dyn IntentPublisher>,
    outbox: Arc<UnpublishedIntents>,
    retry_policy: RetryPolicy,
    interval: Duration,
}

impl Reconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(
        seeder: LedgerSeeder,
        publisher: Arc<dyn IntentPublisher>,
        outbox: Arc<UnpublishedIntents>,
    ) -> Self {
        Self {
            seeder,
            publisher,
            outbox,
            retry_policy: RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(200))
                .jitter(true)
                .build(),
            interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }

    /// Set the time between passes (at least one millisecond).
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Set the backoff used when republishing parked intents.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Correct the ledger counter of every open offer.
    ///
    /// Offers missing from the ledger are seeded instead. Returns a report
    /// for each offer the ledger held.
    ///
    /// # Errors
    ///
    /// Returns the first store or ledger error.
    pub async fn reconcile_once(&self) -> Result<Vec<ReconcileReport>, RuntimeError> {
        let now = self.seeder.clock.now();
        let stocks = self.seeder.store.open_offer_stocks(now).await?;

        let mut reports = Vec::with_capacity(stocks.len());
        for stock in &stocks {
            let reconciled = self
                .seeder
                .ledger
                .reconcile(stock.offer_id, stock.allotment(), stock.remaining)
                .await?;

            let Some(report) = reconciled else {
                info!(offer_id = %stock.offer_id, "Offer missing from ledger, seeding");
                self.seeder.seed_offer(stock).await?;
                continue;
            };

            if report.oversold {
                SeederMetrics::record_oversold();
                error!(
                    offer_id = %report.offer_id,
                    purchased = report.purchased,
                    allotment = stock.allotment(),
                    "Ledger admitted more buyers than the offer's allotment"
                );
            }
            if report.drift() != 0 {
                SeederMetrics::record_adjustment();
                warn!(
                    offer_id = %report.offer_id,
                    previous = report.previous,
                    target = report.target,
                    drift = report.drift(),
                    "Ledger counter corrected"
                );
            }
            reports.push(report);
        }

        Ok(reports)
    }

    /// Republish parked intents.
    pub async fn flush_outbox(&self) -> FlushReport {
        self.outbox
            .flush(self.publisher.as_ref(), &self.retry_policy)
            .await
    }

    /// One full pass: republish, then reconcile. Errors are logged.
    pub async fn run_once(&self) {
        self.flush_outbox().await;
        if let Err(e) = self.reconcile_once().await {
            error!(error = %e, "Reconciliation pass failed");
        }
    }

    /// Run passes every `interval` until shutdown.
    ///
    /// The first pass runs one interval after spawning; startup seeding
    /// covers the moment before it.
    #[must_use]
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            info!(interval = ?self.interval, "Reconciler started");
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => self.run_once().await,
                }
            }

            // Give parked intents a last chance before exit.
            self.flush_outbox().await;
            info!("Reconciler stopped");
        })
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("interval", &self.interval)
            .field("parked", &self.outbox.len())
            .finish_non_exhaustive()
    }
}
