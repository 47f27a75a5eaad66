use thiserror::Error;

/// Crate-wide error taxonomy. Recoverable conditions (insufficient data, zero
/// variance) are represented as `Option`/status values at the call site, not
/// as errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration record failed validation (weights not positive, unknown
    /// policy name, invalid thresholds, ...).
    #[error("invalid configuration: {0}")]
    BadConfig(String),

    /// Date-string parse failure or out-of-policy date range.
    #[error("invalid date: {0}")]
    BadDate(String),

    /// Non-finite input to an analytics primitive.
    #[error("invalid number: {0}")]
    BadNumber(String),

    /// Underlying persistence failure, surfaced with context.
    #[error("store error: {context}")]
    Store {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Alert transport failed after retries. Recorded on the alert row,
    /// never propagated out of the dispatcher.
    #[error("transport error: {0}")]
    Transport(String),

    /// A request-level deadline elapsed.
    #[error("timed out after {0} s")]
    Timeout(u64),
}

impl Error {
    pub fn store(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Store {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn bad_config(msg: impl Into<String>) -> Self {
        Error::BadConfig(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
