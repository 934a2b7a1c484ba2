//! Error taxonomy for the indicator pipeline.
//!
//! Every class aborts the current job; nothing is retried here. Retries,
//! if wanted, belong to the operator or the scheduler that invoked us.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network or HTTP failure while downloading a source.
    #[error("source fetch failed for {url}: {reason}")]
    SourceFetch { url: String, reason: String },

    /// The payload arrived but cannot be parsed in the declared format.
    #[error("source format error in {filename}: {reason}")]
    SourceFormat { filename: String, reason: String },

    /// Commune or EPCI reference tables could not be loaded.
    /// Fatal before any transform runs: no partial reference data.
    #[error("reference tables unavailable: {0}")]
    ReferenceUnavailable(String),

    /// Missing column, unresolvable join key, or any other per-indicator
    /// business-rule failure. Nothing computed so far is persisted.
    #[error("transform failed for indicator {indicator}: {reason}")]
    Transform { indicator: String, reason: String },

    /// Store write failure. The batch transaction is rolled back.
    #[error("persist failed: {0}")]
    Persist(#[from] sqlx::Error),
}

impl PipelineError {
    pub fn transform(indicator: &str, reason: impl Into<String>) -> Self {
        Self::Transform {
            indicator: indicator.to_string(),
            reason: reason.into(),
        }
    }

    pub fn format(filename: &str, reason: impl Into<String>) -> Self {
        Self::SourceFormat {
            filename: filename.to_string(),
            reason: reason.into(),
        }
    }
}
