//! Loader Service - Loads wholesale market price reports into Postgres
//!
//! Responsibilities:
//! - Stream CSV price reports in fixed-size chunks
//! - Validate and normalise rows (Chilean number format, ISO dates)
//! - Resolve regions, markets, subsectors, products and varieties
//! - Insert price facts idempotently, one transaction per chunk
//! - Checkpoint committed chunks so an interrupted load resumes where it stopped
//!
//! Re-running a load over the same files never duplicates facts.

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod normalize;
pub mod progress;
pub mod resolver;
pub mod source;
pub mod store;

#[cfg(test)]
mod memory_store;

use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

/// Install the global fmt subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
