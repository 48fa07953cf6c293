//! `PostgreSQL` order store for the flash-sale pipeline.
//!
//! This crate implements the durable half of the pipeline:
//!
//! - [`PostgresOrderStore`]: the [`OrderStore`] trait. Owns the `offers`
//!   stock counters and the `orders` table.
//! - [`DeadLetterQueue`]: the [`DeadLetterSink`](flashsale_core::DeadLetterSink)
//!   trait over the `failed_intents` table.
//!
//! # Fulfillment Transaction
//!
//! ```text
//! BEGIN
//!   INSERT INTO orders ... ON CONFLICT (buyer_id, offer_id) DO NOTHING
//!   -- 0 rows: duplicate delivery, ROLLBACK, done
//!   UPDATE offers SET stock = stock - 1 WHERE id = $1 AND stock > 0
//!   -- 0 rows: drift, ROLLBACK
//! COMMIT
//! ```
//!
//! The insert runs first so a redelivered intent never touches stock.
//!
//! # Example
//!
//! ```ignore
//! use flashsale_postgres::PostgresOrderStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresOrderStore::new("postgres://localhost/flashsale").await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dead_letter_queue;

pub use dead_letter_queue::{DLQStatus, DeadLetterQueue, FailedIntent};

use chrono::{DateTime, Utc};
use flashsale_core::BoxFuture;
use flashsale_core::error::{FulfillmentError, StoreError};
use flashsale_core::ids::{BuyerId, OfferId, OrderId};
use flashsale_core::intent::PurchaseIntent;
use flashsale_core::offer::{NewOffer, Offer, OfferStock};
use flashsale_core::order::{FulfillmentOutcome, Order, OrderStatus};
use flashsale_core::store::OrderStore;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;

/// Map a sqlx error onto the store taxonomy.
pub(crate) fn store_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::ConnectionFailed(error.to_string())
        },
        other => StoreError::DatabaseError(other.to_string()),
    }
}

/// `PostgreSQL`-backed durable order store.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Connect with default pool settings.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConnectionFailed`] if the database is unreachable.
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        Self::connect(database_url, 10, Duration::from_secs(5)).await
    }

    /// Connect with an explicit pool size and acquire timeout.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConnectionFailed`] if the database is unreachable.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(format!("Failed to connect: {e}")))?;

        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    async fn fulfill_tx(
        &self,
        intent: &PurchaseIntent,
        order_id: OrderId,
        created_at: DateTime<Utc>,
    ) -> Result<FulfillmentOutcome, FulfillmentError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let inserted = sqlx::query(
            r"
            INSERT INTO orders (order_id, buyer_id, offer_id, status, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (buyer_id, offer_id) DO NOTHING
            ",
        )
        .bind(order_id.get())
        .bind(intent.buyer_id.get())
        .bind(intent.offer_id.get())
        .bind(OrderStatus::Paid.as_str())
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await.map_err(store_error)?;
            return Ok(FulfillmentOutcome::Duplicate);
        }

        let decremented = sqlx::query(
            r"
            UPDATE offers
            SET stock = stock - 1
            WHERE id = $1 AND stock > 0
            ",
        )
        .bind(intent.offer_id.get())
        .execute(&mut *tx)
        .await
        .map_err(store_error)?
        .rows_affected();

        if decremented == 0 {
            tx.rollback().await.map_err(store_error)?;
            return Err(FulfillmentError::Drift {
                offer_id: intent.offer_id,
                buyer_id: intent.buyer_id,
            });
        }

        tx.commit().await.map_err(store_error)?;

        Ok(FulfillmentOutcome::Created(Order {
            order_id,
            buyer_id: intent.buyer_id,
            offer_id: intent.offer_id,
            status: OrderStatus::Paid,
            created_at,
        }))
    }

    fn row_to_offer_stock(row: &sqlx::postgres::PgRow) -> OfferStock {
        OfferStock {
            offer_id: OfferId::new(row.get("id")),
            remaining: row.get("stock"),
            orders: row.get("orders"),
        }
    }

    fn row_to_order(row: &sqlx::postgres::PgRow) -> Result<Order, StoreError> {
        let status: String = row.get("status");
        let status = OrderStatus::parse(&status)
            .ok_or_else(|| StoreError::DatabaseError(format!("Invalid order status: {status}")))?;

        Ok(Order {
            order_id: OrderId::new(row.get("order_id")),
            buyer_id: BuyerId::new(row.get("buyer_id")),
            offer_id: OfferId::new(row.get("offer_id")),
            status,
            created_at: row.get("created_at"),
        })
    }
}

impl OrderStore for PostgresOrderStore {
    fn fulfill(
        &self,
        intent: &PurchaseIntent,
        order_id: OrderId,
        created_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<FulfillmentOutcome, FulfillmentError>> {
        let intent = intent.clone();
        Box::pin(async move { self.fulfill_tx(&intent, order_id, created_at).await })
    }

    fn create_offer(&self, offer: &NewOffer) -> BoxFuture<'_, Result<Offer, StoreError>> {
        let offer = offer.clone();
        Box::pin(async move {
            let (id,): (i64,) = sqlx::query_as(
                r"
                INSERT INTO offers (name, stock, starts_at, ends_at)
                VALUES ($1, $2, $3, $4)
                RETURNING id
                ",
            )
            .bind(&offer.name)
            .bind(offer.stock)
            .bind(offer.starts_at)
            .bind(offer.ends_at)
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;

            tracing::info!(offer_id = id, stock = offer.stock, "Offer created");

            Ok(Offer {
                id: OfferId::new(id),
                name: offer.name,
                stock: offer.stock,
                starts_at: offer.starts_at,
                ends_at: offer.ends_at,
            })
        })
    }

    fn open_offer_stocks(
        &self,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<OfferStock>, StoreError>> {
        Box::pin(async move {
            // One statement: stock and order count come from the same snapshot.
            let rows = sqlx::query(
                r"
                SELECT o.id, o.stock, COUNT(ord.order_id) AS orders
                FROM offers o
                LEFT JOIN orders ord ON ord.offer_id = o.id
                WHERE o.ends_at > $1
                GROUP BY o.id, o.stock
                ORDER BY o.id
                ",
            )
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

            Ok(rows.iter().map(Self::row_to_offer_stock).collect())
        })
    }

    fn offer_stock(
        &self,
        offer_id: OfferId,
    ) -> BoxFuture<'_, Result<Option<OfferStock>, StoreError>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT o.id, o.stock, COUNT(ord.order_id) AS orders
                FROM offers o
                LEFT JOIN orders ord ON ord.offer_id = o.id
                WHERE o.id = $1
                GROUP BY o.id, o.stock
                ",
            )
            .bind(offer_id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;

            Ok(row.as_ref().map(Self::row_to_offer_stock))
        })
    }

    fn buyers_for_offer(
        &self,
        offer_id: OfferId,
    ) -> BoxFuture<'_, Result<Vec<BuyerId>, StoreError>> {
        Box::pin(async move {
            let buyers: Vec<(i64,)> = sqlx::query_as(
                "SELECT buyer_id FROM orders WHERE offer_id = $1 ORDER BY buyer_id",
            )
            .bind(offer_id.get())
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

            Ok(buyers.into_iter().map(|(id,)| BuyerId::new(id)).collect())
        })
    }

    fn find_order(
        &self,
        buyer_id: BuyerId,
        offer_id: OfferId,
    ) -> BoxFuture<'_, Result<Option<Order>, StoreError>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT order_id, buyer_id, offer_id, status, created_at
                FROM orders
                WHERE buyer_id = $1 AND offer_id = $2
                ",
            )
            .bind(buyer_id.get())
            .bind(offer_id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;

            row.as_ref().map(Self::row_to_order).transpose()
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
            Ok(())
        })
    }
}
