//! Storage contract definitions.
//!
//! Each subsystem of the service talks to the backend through its own trait:
//! the debounce scheduler through [`BufferStore`], the memoize cache through
//! [`MemoStore`], the flow serializer through [`LockStore`] and
//! [`FailureLogStore`], the ingress counters through [`CounterSink`], and the
//! optional access-token check through [`TokenStore`]. A full backend
//! implements all of them and thereby the [`Backend`] supertrait.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use rsaccum_domain::{BodyItem, FailedRequestLog, UserBuffer};

use crate::error::{StorageError, StorageResult};

/// Validates a namespace key before it reaches the backend.
///
/// # Errors
/// Returns `StorageError::InvalidInput` if the namespace is empty.
pub fn validate_user_ns(user_ns: &str) -> StorageResult<()> {
    if user_ns.is_empty() {
        return Err(StorageError::InvalidInput {
            message: "userNs cannot be empty".to_string(),
        });
    }
    Ok(())
}

/// Ledger fields incremented by the counters sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterField {
    /// Requests accepted at ingress.
    RequestsReceived,
    /// Responses forwarded downstream, reported by an external caller.
    RequestsForwarded,
    /// Images reported by an external caller.
    ImagesReceived,
}

impl CounterField {
    /// The persisted field name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterField::RequestsReceived => "requestRecebidos",
            CounterField::RequestsForwarded => "requestEncaminhados",
            CounterField::ImagesReceived => "imagensRecebidas",
        }
    }
}

/// A memoize cache entry: the stored fields and when they were last written.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoEntry {
    pub dados: serde_json::Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Per-namespace accumulation buffer.
///
/// `append` must be serialized per key by the backend so concurrent appends
/// lose no items; across keys operations may run in parallel. The buffer
/// itself has no TTL - it is deleted only by the scheduler.
#[async_trait]
pub trait BufferStore: Send + Sync + 'static {
    /// Upserts the entry: appends `items` preserving arrival order and
    /// overwrites the callback `url` (last wins).
    async fn append(&self, user_ns: &str, items: Vec<BodyItem>, url: &str) -> StorageResult<()>;

    /// Returns the accumulated state, or `BufferNotFound`.
    async fn fetch(&self, user_ns: &str) -> StorageResult<UserBuffer>;

    /// Removes the entry. Idempotent.
    async fn delete(&self, user_ns: &str) -> StorageResult<()>;

    /// Namespaces with a surviving buffer, for the startup recovery scan.
    async fn list_namespaces(&self) -> StorageResult<Vec<String>>;
}

/// Composite-keyed TTL cache for the memoize subsystem.
#[async_trait]
pub trait MemoStore: Send + Sync + 'static {
    /// Loads the stored entry, or `None` when absent or expired.
    async fn load(&self, key: &str) -> StorageResult<Option<MemoEntry>>;

    /// Stores `dados` with a refreshed timestamp and (re)sets the expiry.
    /// All three writes must land atomically.
    async fn store(
        &self,
        key: &str,
        dados: serde_json::Map<String, Value>,
        ttl: Duration,
    ) -> StorageResult<()>;
}

/// Cross-process lease registry for the flow serializer.
#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    /// Atomic set-if-absent with expiry. Returns whether the lease was won.
    async fn try_lock(&self, user_ns: &str, ttl: Duration) -> StorageResult<bool>;

    /// Releases the lease. Best-effort; the TTL reclaims crashed holders.
    async fn unlock(&self, user_ns: &str) -> StorageResult<()>;
}

/// Opaque daily-counters ledger. Increment-only; duplicate day entries under
/// races are acceptable.
#[async_trait]
pub trait CounterSink: Send + Sync + 'static {
    async fn increment(
        &self,
        workspace: &str,
        date: &str,
        field: CounterField,
        amount: i64,
    ) -> StorageResult<()>;

    async fn add_minutes(&self, workspace: &str, date: &str, minutes: f64) -> StorageResult<()>;
}

/// Durable sink for terminal flow failures.
#[async_trait]
pub trait FailureLogStore: Send + Sync + 'static {
    async fn save_failed_request(&self, log: FailedRequestLog) -> StorageResult<()>;
}

/// Access-token lookup backing the optional ingress authentication.
#[async_trait]
pub trait TokenStore: Send + Sync + 'static {
    async fn is_token_valid(&self, token: &str) -> StorageResult<bool>;
}

/// A complete backend: everything the service needs from storage.
pub trait Backend:
    BufferStore + MemoStore + LockStore + CounterSink + FailureLogStore + TokenStore
{
}

impl<T> Backend for T where
    T: BufferStore + MemoStore + LockStore + CounterSink + FailureLogStore + TokenStore
{
}
