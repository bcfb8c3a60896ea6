//! Error types for the coordination layer.

use thiserror::Error;

use rsaccum_domain::DomainError;
use rsaccum_storage::StorageError;

/// Errors raised by the dispatcher, scheduler, memoize and flow handlers.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Callback answered outside 2xx. Carries the status and a truncated
    /// slice of the response body.
    #[error("callback returned status {status}: {body}")]
    DispatchRejected { status: u16, body: String },

    /// Callback POST failed at the transport layer (includes client timeout).
    #[error("callback dispatch failed: {0}")]
    DispatchTransport(#[source] reqwest::Error),

    /// External API answered outside 2xx.
    #[error("upstream returned status {status}")]
    UpstreamRejected { status: u16 },

    /// External API call failed at the transport layer.
    #[error("upstream call failed: {0}")]
    UpstreamTransport(#[source] reqwest::Error),

    /// The flow call outlived its per-call deadline.
    #[error("timeout awaiting upstream response")]
    UpstreamTimeout,

    /// The wait budget elapsed before the lease could be acquired.
    #[error("timeout awaiting lease for userNs: {user_ns}")]
    LockTimeout { user_ns: String },
}

/// Result type for coordination-layer operations.
pub type ServerResult<T> = Result<T, ServerError>;
