//! Error taxonomy for the refresh pipeline and the persistent stores.

use thiserror::Error;

/// Terminal outcome of one refresh cycle. Transient upstream faults are
/// absorbed inside the clients and never reach this level.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("refresh cancelled")]
    Cancelled,

    #[error("another refresh is already running")]
    AlreadyRunning,

    #[error("both marketplaces returned no items")]
    UpstreamUnavailable,

    #[error("{marketplace} authentication rejected: {message}")]
    AuthFailed {
        marketplace: &'static str,
        message: String,
    },
}

/// Failure of a single upstream page request, after the retry budget.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request cancelled")]
    Cancelled,

    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("authentication rejected (HTTP {status})")]
    AuthFailed { status: u16 },

    #[error("HTTP {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("malformed response: {0}")]
    Decode(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

impl FetchError {
    pub fn is_auth(&self) -> bool {
        matches!(self, FetchError::AuthFailed { .. })
    }
}

/// Failures of the credential store and the interesting-key cache.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("failed to persist {path}")]
    PersistFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
