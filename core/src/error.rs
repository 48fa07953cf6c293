//! Error taxonomy for the pipeline.
//!
//! Every collaborator error reports an [`ErrorClass`], which decides what
//! the caller does with it:
//!
//! | Class | Source | Handling |
//! |-------|--------|----------|
//! | `AdmissionRejected` | already purchased / out of stock | returned verbatim, never retried |
//! | `TransientInfra` | ledger or queue unreachable | admission fails closed, client may retry |
//! | `DurableWriteConflict` | duplicate order insert on redelivery | absorbed, message acknowledged |
//! | `TransientWorker` | durable store unavailable during commit | left unacknowledged, redelivered, then dead-lettered |
//! | `Drift` | durable decrement affected zero rows | logged, alerted, dead-lettered |
//! | `FatalConfig` | no connectivity at startup | process does not serve |
//! | `Malformed` | delivered payload is not an intent | dead-lettered, never retried |

use crate::ids::{BuyerId, OfferId};
use thiserror::Error;

/// Handling class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Expected business rejection
    AdmissionRejected,
    /// Ledger or queue unreachable on the request path
    TransientInfra,
    /// Duplicate durable write caused by redelivery
    DurableWriteConflict,
    /// Durable store failure inside the worker
    TransientWorker,
    /// Ledger and durable truth disagree
    Drift,
    /// Startup connectivity or configuration failure
    FatalConfig,
    /// A queued payload that can never be processed
    Malformed,
}

impl ErrorClass {
    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::TransientInfra | Self::TransientWorker)
    }

    /// Metric label for the class.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AdmissionRejected => "admission_rejected",
            Self::TransientInfra => "transient_infra",
            Self::DurableWriteConflict => "durable_write_conflict",
            Self::TransientWorker => "transient_worker",
            Self::Drift => "drift",
            Self::FatalConfig => "fatal_config",
            Self::Malformed => "malformed",
        }
    }
}

/// Errors from the Stock Ledger.
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    /// The ledger could not be reached
    #[error("Ledger connection failed: {0}")]
    ConnectionFailed(String),

    /// The atomic script could not be evaluated
    #[error("Ledger script '{script}' failed: {reason}")]
    ScriptFailed {
        /// Script name
        script: &'static str,
        /// Failure reason
        reason: String,
    },

    /// The ledger replied with a value the script never returns
    #[error("Unexpected ledger reply: {0}")]
    UnexpectedReply(String),
}

impl LedgerError {
    /// Handling class.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        ErrorClass::TransientInfra
    }
}

/// Errors from the Order Queue.
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an intent
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed to subscribe
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to encode an intent
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// A delivered payload is not a purchase intent
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Failed to acknowledge or requeue a delivery
    #[error("Acknowledgement failed: {0}")]
    AckFailed(String),

    /// Network or transport error while consuming
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl QueueError {
    /// Handling class.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::DeserializationFailed(_) | Self::SerializationFailed(_) => ErrorClass::Malformed,
            _ => ErrorClass::TransientInfra,
        }
    }
}

/// Errors from the durable store.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Failed to connect to the database
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// A query or transaction failed
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// The requested row does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

impl StoreError {
    /// Handling class.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        ErrorClass::TransientWorker
    }
}

/// Errors from materializing a purchase intent.
#[derive(Error, Debug, Clone)]
pub enum FulfillmentError {
    /// The conditional durable decrement affected zero rows for a new order.
    ///
    /// The ledger admitted a reservation the durable store cannot honour.
    #[error("Stock drift: durable stock exhausted for offer {offer_id} while fulfilling buyer {buyer_id}")]
    Drift {
        /// Offer
        offer_id: OfferId,
        /// Buyer
        buyer_id: BuyerId,
    },

    /// The durable store failed; the transaction was rolled back
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FulfillmentError {
    /// Handling class.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Drift { .. } => ErrorClass::Drift,
            Self::Store(e) => e.class(),
        }
    }
}
