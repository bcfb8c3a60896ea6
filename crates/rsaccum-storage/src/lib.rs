//! rsaccum-storage: Storage abstraction layer
//!
//! This crate provides the storage contracts for rsaccum, including:
//! - Per-concern traits (buffer, memoize cache, lease, counters, failure log,
//!   access tokens) and the `Backend` supertrait covering all of them
//! - In-memory implementation for testing and single-process use
//! - Redis implementation for production

pub mod error;
pub mod memory;
pub mod redis;
pub mod traits;

// Re-export commonly used types
pub use error::{StorageError, StorageResult};
pub use memory::{DayCounters, MemoryStore};
pub use redis::RedisStore;
pub use traits::{
    validate_user_ns, Backend, BufferStore, CounterField, CounterSink, FailureLogStore, LockStore,
    MemoEntry, MemoStore, TokenStore,
};
