//! rsaccum-api: HTTP ingress
//!
//! Thin axum layer mapping the producer-facing routes onto the coordination
//! handlers, plus the logging bootstrap used by the binary.

pub mod http;
pub mod observability;
