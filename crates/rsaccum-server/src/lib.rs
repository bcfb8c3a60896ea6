//! rsaccum-server: Coordination layer
//!
//! The pieces that sit between ingress and storage:
//! - [`config`] - layered server configuration
//! - [`dispatch`] - outbound callback POSTs with status classification
//! - [`debounce`] - per-key timer registry collapsing bursts into one flush
//! - [`memoize`] - composite-keyed merge cache in front of an external API
//! - [`flow`] - lease-serialized upstream calls with retry and failure log

pub mod config;
pub mod debounce;
pub mod dispatch;
pub mod error;
pub mod flow;
pub mod memoize;

pub use config::ServerConfig;
pub use debounce::DebounceScheduler;
pub use dispatch::Dispatcher;
pub use error::{ServerError, ServerResult};
pub use flow::{FlowConfig, FlowProcessor};
pub use memoize::{composite_key, MemoizeConfig, MemoizeHandler};
