//! # Flashsale Service
//!
//! Process bootstrap for the flash-sale pipeline: configuration, tracing,
//! connectivity checks and wiring of the runtime components onto Redis,
//! `PostgreSQL` and Redpanda.
//!
//! The `flashsale` binary runs the fulfillment side (worker pool and
//! reconciler). The request layer embeds [`Services::admission_gate`].

pub mod bootstrap;
pub mod config;

pub use bootstrap::{BootstrapError, Services};
pub use config::{Config, ConfigError, LogFormat};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "flashsale=info";

/// Install the global tracing subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to [`DEFAULT_LOG_FILTER`].
/// Calling it twice leaves the first subscriber in place.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };

    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
