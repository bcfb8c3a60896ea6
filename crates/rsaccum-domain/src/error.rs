//! Domain error types.

use thiserror::Error;

/// Errors raised while interpreting producer payloads.
#[derive(Debug, Error)]
pub enum DomainError {
    /// The request body matched none of the accepted payload shapes
    /// (array of RequestData, single RequestData, array of BodyItem).
    #[error("request body is not a recognized payload shape or is empty")]
    InvalidPayload,

    /// No control item, or the control item lacks `userNs` or `url`.
    #[error("control item with userNs and url is missing from the payload")]
    MissingControlItem,
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
