//! # Flashsale Redis
//!
//! Redis implementation of the [`StockLedger`] trait.
//!
//! # Data Layout
//!
//! Per offer, two keys sharing a hash tag:
//!
//! ```text
//! flashsale:stock:{42}    STRING  remaining-stock counter
//! flashsale:bought:{42}   SET     admitted buyer ids
//! ```
//!
//! # Atomicity
//!
//! Reservation, seeding and reconciliation are Lua scripts: Redis runs a
//! script to completion before serving any other command, so the
//! check-dedup, check-stock, decrement-and-record sequence cannot interleave
//! with a concurrent reservation.
//!
//! # Example
//!
//! ```no_run
//! use flashsale_core::{BuyerId, OfferId, StockLedger};
//! use flashsale_redis::RedisStockLedger;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = RedisStockLedger::new("redis://127.0.0.1:6379").await?;
//! ledger.seed_if_absent(OfferId::new(1), 100, &[]).await?;
//! let outcome = ledger.try_reserve(OfferId::new(1), BuyerId::new(7)).await?;
//! # Ok(())
//! # }
//! ```

pub mod scripts;

use flashsale_core::BoxFuture;
use flashsale_core::error::LedgerError;
use flashsale_core::ids::{BuyerId, OfferId};
use flashsale_core::ledger::{LedgerSnapshot, ReconcileReport, ReserveOutcome, StockLedger};
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use scripts::admit_reply;

/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "flashsale";

/// Redis-backed Stock Ledger.
///
/// Cheap to clone: clones share the underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisStockLedger {
    conn_manager: ConnectionManager,
    namespace: String,
    admit: Script,
    seed: Script,
    reconcile: Script,
}

impl RedisStockLedger {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - `Redis` connection URL (e.g., "<redis://127.0.0.1:6379>")
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::ConnectionFailed`] if the URL is invalid or the
    /// server is unreachable.
    pub async fn new(redis_url: &str) -> Result<Self, LedgerError> {
        let client = Client::open(redis_url).map_err(|e| {
            LedgerError::ConnectionFailed(format!("Failed to create Redis client: {e}"))
        })?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            LedgerError::ConnectionFailed(format!(
                "Failed to create Redis connection manager: {e}"
            ))
        })?;

        Ok(Self::from_connection(conn_manager))
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub fn from_connection(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            namespace: DEFAULT_NAMESPACE.to_string(),
            admit: Script::new(scripts::ADMIT),
            seed: Script::new(scripts::SEED_IF_ABSENT),
            reconcile: Script::new(scripts::RECONCILE),
        }
    }

    /// Use a different key namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Key of an offer's remaining-stock counter.
    #[must_use]
    pub fn stock_key(&self, offer_id: OfferId) -> String {
        format!("{}:stock:{{{offer_id}}}", self.namespace)
    }

    /// Key of an offer's purchased-buyer set.
    #[must_use]
    pub fn bought_key(&self, offer_id: OfferId) -> String {
        format!("{}:bought:{{{offer_id}}}", self.namespace)
    }
}

fn script_error(script: &'static str, error: &RedisError) -> LedgerError {
    if error.is_io_error() || error.is_connection_dropped() || error.is_timeout() {
        LedgerError::ConnectionFailed(error.to_string())
    } else {
        LedgerError::ScriptFailed {
            script,
            reason: error.to_string(),
        }
    }
}

impl StockLedger for RedisStockLedger {
    fn try_reserve(
        &self,
        offer_id: OfferId,
        buyer_id: BuyerId,
    ) -> BoxFuture<'_, Result<ReserveOutcome, LedgerError>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();

            let reply: i64 = self
                .admit
                .key(self.stock_key(offer_id))
                .key(self.bought_key(offer_id))
                .arg(buyer_id.get())
                .invoke_async(&mut conn)
                .await
                .map_err(|e| script_error("admit", &e))?;

            match reply {
                admit_reply::RESERVED => Ok(ReserveOutcome::Reserved),
                admit_reply::ALREADY_PURCHASED => Ok(ReserveOutcome::AlreadyPurchased),
                admit_reply::OUT_OF_STOCK => Ok(ReserveOutcome::OutOfStock),
                admit_reply::UNKNOWN_OFFER => Ok(ReserveOutcome::UnknownOffer),
                other => Err(LedgerError::UnexpectedReply(format!(
                    "admit returned {other}"
                ))),
            }
        })
    }

    fn seed_if_absent(
        &self,
        offer_id: OfferId,
        remaining: i64,
        purchased: &[BuyerId],
    ) -> BoxFuture<'_, Result<bool, LedgerError>> {
        let buyers: Vec<i64> = purchased.iter().map(|b| b.get()).collect();

        Box::pin(async move {
            let mut conn = self.conn_manager.clone();

            let mut invocation = self.seed.key(self.stock_key(offer_id));
            invocation.key(self.bought_key(offer_id)).arg(remaining);
            for buyer in &buyers {
                invocation.arg(*buyer);
            }

            let seeded: i64 = invocation
                .invoke_async(&mut conn)
                .await
                .map_err(|e| script_error("seed_if_absent", &e))?;

            tracing::debug!(
                offer_id = %offer_id,
                remaining,
                purchased = buyers.len(),
                seeded = seeded == 1,
                "Ledger seed evaluated"
            );

            Ok(seeded == 1)
        })
    }

    fn reconcile(
        &self,
        offer_id: OfferId,
        allotment: i64,
        durable_remaining: i64,
    ) -> BoxFuture<'_, Result<Option<ReconcileReport>, LedgerError>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();

            let reply: Option<Vec<i64>> = self
                .reconcile
                .key(self.stock_key(offer_id))
                .key(self.bought_key(offer_id))
                .arg(allotment)
                .arg(durable_remaining)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| script_error("reconcile", &e))?;

            match reply.as_deref() {
                None => Ok(None),
                Some(&[previous, target, purchased, oversold]) => Ok(Some(ReconcileReport {
                    offer_id,
                    previous,
                    target,
                    purchased,
                    oversold: oversold == 1,
                })),
                Some(other) => Err(LedgerError::UnexpectedReply(format!(
                    "reconcile returned {other:?}"
                ))),
            }
        })
    }

    fn snapshot(
        &self,
        offer_id: OfferId,
    ) -> BoxFuture<'_, Result<Option<LedgerSnapshot>, LedgerError>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();

            let (remaining, purchased): (Option<i64>, i64) = redis::pipe()
                .atomic()
                .get(self.stock_key(offer_id))
                .scard(self.bought_key(offer_id))
                .query_async(&mut conn)
                .await
                .map_err(|e| script_error("snapshot", &e))?;

            Ok(remaining.map(|remaining| LedgerSnapshot {
                remaining,
                purchased,
            }))
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), LedgerError>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();

            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| LedgerError::ConnectionFailed(e.to_string()))?;

            Ok(())
        })
    }
}
