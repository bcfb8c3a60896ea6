//! Observability: structured logging bootstrap.

pub mod logging;

pub use logging::{init_logging, LoggingConfig};
