//! In-memory backend for testing and single-process deployments.
//!
//! DashMap shards give the per-key serialization the contracts ask for: an
//! `entry` holds the shard write lock for the whole read-merge-write, so
//! concurrent appends to the same namespace cannot lose items.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use rsaccum_domain::{BodyItem, FailedRequestLog, UserBuffer};

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    validate_user_ns, BufferStore, CounterField, CounterSink, FailureLogStore, LockStore,
    MemoEntry, MemoStore, TokenStore,
};

/// One day of ledger aggregates for a workspace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DayCounters {
    #[serde(rename = "requestRecebidos")]
    pub requests_received: i64,
    #[serde(rename = "requestEncaminhados")]
    pub requests_forwarded: i64,
    #[serde(rename = "imagensRecebidas")]
    pub images_received: i64,
    #[serde(rename = "minutos")]
    pub minutes: f64,
}

#[derive(Debug)]
struct MemoRecord {
    entry: MemoEntry,
    expires_at: Instant,
}

/// In-memory implementation of every storage contract.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buffers: DashMap<String, UserBuffer>,
    memo: DashMap<String, MemoRecord>,
    /// Lease expiry per namespace; an expired entry counts as absent.
    locks: DashMap<String, Instant>,
    counters: DashMap<(String, String), DayCounters>,
    failures: Mutex<Vec<FailedRequestLog>>,
    tokens: DashMap<String, ()>,
}

impl MemoryStore {
    /// Creates a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a valid access token (test/dev helper).
    pub fn insert_token(&self, token: &str) {
        self.tokens.insert(token.to_string(), ());
    }

    /// Current ledger values for a workspace/date, if any.
    pub fn counters(&self, workspace: &str, date: &str) -> Option<DayCounters> {
        self.counters
            .get(&(workspace.to_string(), date.to_string()))
            .map(|c| *c.value())
    }

    /// Snapshot of the failure log.
    pub fn failed_requests(&self) -> Vec<FailedRequestLog> {
        self.failures
            .lock()
            .expect("failure log mutex poisoned")
            .clone()
    }
}

#[async_trait]
impl BufferStore for MemoryStore {
    async fn append(&self, user_ns: &str, items: Vec<BodyItem>, url: &str) -> StorageResult<()> {
        validate_user_ns(user_ns)?;

        let mut entry = self
            .buffers
            .entry(user_ns.to_string())
            .or_insert_with(|| UserBuffer {
                user_ns: user_ns.to_string(),
                ..Default::default()
            });
        entry.url = url.to_string();
        entry.body.extend(items);
        Ok(())
    }

    async fn fetch(&self, user_ns: &str) -> StorageResult<UserBuffer> {
        self.buffers
            .get(user_ns)
            .map(|b| b.value().clone())
            .ok_or_else(|| StorageError::BufferNotFound {
                user_ns: user_ns.to_string(),
            })
    }

    async fn delete(&self, user_ns: &str) -> StorageResult<()> {
        self.buffers.remove(user_ns);
        Ok(())
    }

    async fn list_namespaces(&self) -> StorageResult<Vec<String>> {
        Ok(self.buffers.iter().map(|b| b.key().clone()).collect())
    }
}

#[async_trait]
impl MemoStore for MemoryStore {
    async fn load(&self, key: &str) -> StorageResult<Option<MemoEntry>> {
        let live = match self.memo.get(key) {
            Some(record) if record.expires_at > Instant::now() => Some(record.entry.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if live.is_none() {
            self.memo.remove(key);
        }
        Ok(live)
    }

    async fn store(
        &self,
        key: &str,
        dados: serde_json::Map<String, Value>,
        ttl: Duration,
    ) -> StorageResult<()> {
        self.memo.insert(
            key.to_string(),
            MemoRecord {
                entry: MemoEntry {
                    dados,
                    timestamp: Utc::now(),
                },
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn try_lock(&self, user_ns: &str, ttl: Duration) -> StorageResult<bool> {
        use dashmap::mapref::entry::Entry;

        let now = Instant::now();
        match self.locks.entry(user_ns.to_string()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() > now {
                    Ok(false)
                } else {
                    occupied.insert(now + ttl);
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now + ttl);
                Ok(true)
            }
        }
    }

    async fn unlock(&self, user_ns: &str) -> StorageResult<()> {
        self.locks.remove(user_ns);
        Ok(())
    }
}

#[async_trait]
impl CounterSink for MemoryStore {
    async fn increment(
        &self,
        workspace: &str,
        date: &str,
        field: CounterField,
        amount: i64,
    ) -> StorageResult<()> {
        let mut entry = self
            .counters
            .entry((workspace.to_string(), date.to_string()))
            .or_default();
        match field {
            CounterField::RequestsReceived => entry.requests_received += amount,
            CounterField::RequestsForwarded => entry.requests_forwarded += amount,
            CounterField::ImagesReceived => entry.images_received += amount,
        }
        Ok(())
    }

    async fn add_minutes(&self, workspace: &str, date: &str, minutes: f64) -> StorageResult<()> {
        let mut entry = self
            .counters
            .entry((workspace.to_string(), date.to_string()))
            .or_default();
        entry.minutes += minutes;
        Ok(())
    }
}

#[async_trait]
impl FailureLogStore for MemoryStore {
    async fn save_failed_request(&self, log: FailedRequestLog) -> StorageResult<()> {
        self.failures
            .lock()
            .expect("failure log mutex poisoned")
            .push(log);
        Ok(())
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn is_token_valid(&self, token: &str) -> StorageResult<bool> {
        Ok(self.tokens.contains_key(token))
    }
}
