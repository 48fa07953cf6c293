//! Dead Letter Queue (DLQ) for intents that could not be fulfilled.
//!
//! Fulfillment workers park a delivery here when the payload is malformed,
//! when fulfillment hit stock drift, or when transient failures exhausted the
//! retry budget. Entries move through
//! `pending → processing → resolved | discarded` as operators handle them.

use chrono::{DateTime, Utc};
use flashsale_core::BoxFuture;
use flashsale_core::error::StoreError;
use flashsale_core::ids::{BuyerId, OfferId};
use flashsale_core::store::{DeadLetter, DeadLetterReason, DeadLetterSink};
use sqlx::{PgPool, Row};

use crate::store_error;

/// Status of a failed intent in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Awaiting investigation
    Pending,
    /// An operator is handling it
    Processing,
    /// Handled (order written by hand, buyer compensated, ...)
    Resolved,
    /// Permanently dropped
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(StoreError::DatabaseError(format!(
                "Invalid DLQ status: {s}"
            ))),
        }
    }
}

/// An entry in the Dead Letter Queue.
#[derive(Debug, Clone)]
pub struct FailedIntent {
    /// Unique identifier for this DLQ entry
    pub id: i64,

    /// Raw payload as delivered
    pub payload: Vec<u8>,

    /// Buyer, when the payload decoded
    pub buyer_id: Option<BuyerId>,

    /// Offer, when the payload decoded
    pub offer_id: Option<OfferId>,

    /// Why the intent was parked
    pub reason: DeadLetterReason,

    /// Error message from the last failure
    pub error_message: String,

    /// Delivery attempts made
    pub attempts: i32,

    /// When the intent was parked
    pub failed_at: DateTime<Utc>,

    /// Current processing status
    pub status: DLQStatus,

    /// When the entry was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who resolved it
    pub resolved_by: Option<String>,

    /// Notes about the resolution
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-based Dead Letter Queue for failed intents.
///
/// # Example
///
/// ```no_run
/// use flashsale_postgres::{DLQStatus, DeadLetterQueue};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// let pending = dlq.list_pending(100).await?;
/// println!("Pending failures: {}", pending.len());
///
/// dlq.update_status(pending[0].id, DLQStatus::Processing).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add a failed intent to the DLQ.
    ///
    /// Returns the id of the created entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the insert fails.
    pub async fn add_entry(&self, letter: &DeadLetter) -> Result<i64, StoreError> {
        let buyer_id = letter.intent.as_ref().map(|i| i.buyer_id.get());
        let offer_id = letter.intent.as_ref().map(|i| i.offer_id.get());
        #[allow(clippy::cast_possible_wrap)] // attempts are bounded by the retry budget
        let attempts = letter.attempts as i32;

        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_intents (
                payload, buyer_id, offer_id, reason, error_message, attempts, failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            ",
        )
        .bind(&letter.payload)
        .bind(buyer_id)
        .bind(offer_id)
        .bind(letter.reason.as_str())
        .bind(&letter.error_message)
        .bind(attempts)
        .bind(letter.failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;

        tracing::warn!(
            dlq_id = id,
            buyer_id = ?buyer_id,
            offer_id = ?offer_id,
            reason = %letter.reason,
            error = %letter.error_message,
            attempts = letter.attempts,
            "Intent added to Dead Letter Queue"
        );

        Ok(id)
    }

    /// List pending failed intents, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedIntent>, StoreError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List failed intents by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedIntent>, StoreError> {
        #[allow(clippy::cast_possible_wrap)] // Limit is reasonable size, i64 is safe
        let rows = sqlx::query(
            r"
            SELECT
                id, payload, buyer_id, offer_id, reason, error_message, attempts,
                failed_at, status, resolved_at, resolved_by, resolution_notes
            FROM failed_intents
            WHERE status = $1
            ORDER BY failed_at ASC, id ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter().map(Self::row_to_failed_intent).collect()
    }

    /// Get a specific failed intent by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if there is no such entry.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedIntent, StoreError> {
        let row = sqlx::query(
            r"
            SELECT
                id, payload, buyer_id, offer_id, reason, error_message, attempts,
                failed_at, status, resolved_at, resolved_by, resolution_notes
            FROM failed_intents
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?
        .ok_or_else(|| StoreError::NotFound(format!("failed intent {id}")))?;

        Self::row_to_failed_intent(&row)
    }

    /// Update the status of a failed intent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE failed_intents SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");

        Ok(())
    }

    /// Mark a failed intent as resolved.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE failed_intents
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        tracing::info!(dlq_id = id, resolved_by = resolved_by, "DLQ entry marked as resolved");

        metrics::counter!("flashsale.dlq.resolved").increment(1);

        Ok(())
    }

    /// Mark a failed intent as discarded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE failed_intents
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        tracing::warn!(dlq_id = id, reason = reason, "DLQ entry marked as discarded");

        metrics::counter!("flashsale.dlq.discarded").increment(1);

        Ok(())
    }

    /// Get count of pending failures.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_intents WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(store_error)?;

        Ok(count)
    }

    fn row_to_failed_intent(row: &sqlx::postgres::PgRow) -> Result<FailedIntent, StoreError> {
        let status_str: String = row.get("status");
        let status = DLQStatus::parse(&status_str)?;

        let reason_str: String = row.get("reason");
        let reason = DeadLetterReason::parse(&reason_str).ok_or_else(|| {
            StoreError::DatabaseError(format!("Invalid dead letter reason: {reason_str}"))
        })?;

        let buyer_id: Option<i64> = row.get("buyer_id");
        let offer_id: Option<i64> = row.get("offer_id");

        Ok(FailedIntent {
            id: row.get("id"),
            payload: row.get("payload"),
            buyer_id: buyer_id.map(BuyerId::new),
            offer_id: offer_id.map(OfferId::new),
            reason,
            error_message: row.get("error_message"),
            attempts: row.get("attempts"),
            failed_at: row.get("failed_at"),
            status,
            resolved_at: row.get("resolved_at"),
            resolved_by: row.get("resolved_by"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn dead_letter(&self, letter: DeadLetter) -> BoxFuture<'_, Result<i64, StoreError>> {
        Box::pin(async move { self.add_entry(&letter).await })
    }

    fn pending_count(&self) -> BoxFuture<'_, Result<i64, StoreError>> {
        Box::pin(self.count_pending())
    }
}
