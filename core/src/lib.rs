//! # Flashsale Core
//!
//! Domain types and collaborator traits for the flash-sale admission and
//! fulfillment pipeline.
//!
//! The pipeline has two halves that never share a transaction:
//!
//! ```text
//!  buyer ──► Admission Gate ──► Stock Ledger (atomic script)
//!                 │
//!                 │ Admitted
//!                 ▼
//!           Order Queue  (durable, at-least-once)
//!                 │
//!                 ▼
//!        Fulfillment Worker ──► Order Store (transaction: insert order,
//!                                             decrement durable stock)
//! ```
//!
//! The fast path owns the [`ledger::StockLedger`]; the slow path owns the
//! [`store::OrderStore`]. The seeder is the only component that reads one to
//! write the other.
//!
//! ## Modules
//!
//! - [`ids`]: strongly typed offer, buyer and order identifiers
//! - [`offer`]: offers and durable stock snapshots
//! - [`intent`]: the purchase-intent message and its JSON wire form
//! - [`order`]: the durable order record
//! - [`ledger`]: the Stock Ledger trait and admission decisions
//! - [`queue`]: Order Queue publish/subscribe traits with explicit acknowledgement
//! - [`store`]: durable order store and dead-letter sink traits
//! - [`id_gen`]: time-ordered order id generation
//! - [`environment`]: clock abstraction
//! - [`error`]: error taxonomy shared by all collaborators

pub mod environment;
pub mod error;
pub mod id_gen;
pub mod ids;
pub mod intent;
pub mod ledger;
pub mod offer;
pub mod order;
pub mod queue;
pub mod store;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use error::{ErrorClass, FulfillmentError, LedgerError, QueueError, StoreError};
pub use environment::{Clock, SystemClock};
pub use id_gen::{IdGenerator, IdGeneratorError, SnowflakeGenerator};
pub use ids::{BuyerId, OfferId, OrderId};
pub use intent::PurchaseIntent;
pub use ledger::{AdmissionDecision, LedgerSnapshot, ReconcileReport, ReserveOutcome, StockLedger};
pub use offer::{NewOffer, Offer, OfferStock};
pub use order::{FulfillmentOutcome, Order, OrderStatus};
pub use queue::{Acknowledger, Delivery, DeliveryStream, IntentPublisher, IntentSubscriber};
pub use store::{DeadLetter, DeadLetterReason, DeadLetterSink, OrderStore};

/// Boxed future returned by the dyn-compatible collaborator traits.
///
/// The traits use explicit boxed futures instead of `async fn` so that the
/// admission gate and workers can hold them as `Arc<dyn Trait>`.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
