#![allow(
    clippy::float_cmp,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss
)]

pub mod aggregator;
pub mod alerts;
pub mod analytics;
pub mod backtest;
pub mod config;
pub mod data;
pub mod error;
pub mod orchestrator;
pub mod signals;
pub mod strategies;

pub use error::{Error, Result};

/// Opt-in console logging for thin wrappers and tests. Respects `RUST_LOG`;
/// calling it more than once is harmless.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
