//! Redis backend.
//!
//! Key layout:
//! - `user_data:{userNs}` - list of JSON-encoded BodyItem in arrival order
//! - `user_data:{userNs}:url` - callback URL (last wins)
//! - `{compositeKey}` - memoize hash with `dados` and `timestamp` fields
//! - `lock:{userNs}` - lease key, `SET NX EX`
//! - `counters:{workspace}:{date}` - ledger hash, `HINCRBY`/`HINCRBYFLOAT`
//! - `failed_requests` - failure-log list
//! - `security` - set of valid access tokens
//!
//! Buffer appends and memoize writes run inside `MULTI` pipelines so
//! concurrent producers cannot observe (or create) half-written state.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tracing::debug;

use rsaccum_domain::{BodyItem, FailedRequestLog, UserBuffer};

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    validate_user_ns, BufferStore, CounterField, CounterSink, FailureLogStore, LockStore,
    MemoEntry, MemoStore, TokenStore,
};

const BUFFER_PREFIX: &str = "user_data:";
const URL_SUFFIX: &str = ":url";
const LOCK_PREFIX: &str = "lock:";
const FAILURE_LOG_KEY: &str = "failed_requests";
const TOKEN_SET_KEY: &str = "security";
const SCAN_BATCH: usize = 100;

fn op_err(err: redis::RedisError) -> StorageError {
    StorageError::OperationError {
        message: err.to_string(),
    }
}

/// Redis implementation of every storage contract.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects and validates the server with a managed (auto-reconnecting)
    /// connection.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let client = redis::Client::open(url).map_err(|e| StorageError::ConnectionError {
            message: e.to_string(),
        })?;
        let conn =
            client
                .get_connection_manager()
                .await
                .map_err(|e| StorageError::ConnectionError {
                    message: e.to_string(),
                })?;
        debug!("redis connection manager ready");
        Ok(Self { conn })
    }

    fn buffer_key(user_ns: &str) -> String {
        format!("{BUFFER_PREFIX}{user_ns}")
    }

    fn buffer_url_key(user_ns: &str) -> String {
        format!("{BUFFER_PREFIX}{user_ns}{URL_SUFFIX}")
    }

    fn lock_key(user_ns: &str) -> String {
        format!("{LOCK_PREFIX}{user_ns}")
    }

    fn counter_key(workspace: &str, date: &str) -> String {
        format!("counters:{workspace}:{date}")
    }
}

#[async_trait]
impl BufferStore for RedisStore {
    async fn append(&self, user_ns: &str, items: Vec<BodyItem>, url: &str) -> StorageResult<()> {
        validate_user_ns(user_ns)?;

        let mut encoded = Vec::with_capacity(items.len());
        for item in &items {
            encoded.push(serde_json::to_string(item)?);
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        // RPUSH rejects an empty value list; an items-less append still
        // refreshes the callback URL.
        if !encoded.is_empty() {
            pipe.rpush(Self::buffer_key(user_ns), encoded).ignore();
        }
        pipe.set(Self::buffer_url_key(user_ns), url).ignore();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(op_err)?;
        Ok(())
    }

    async fn fetch(&self, user_ns: &str) -> StorageResult<UserBuffer> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .lrange(Self::buffer_key(user_ns), 0, -1)
            .await
            .map_err(op_err)?;
        if raw.is_empty() {
            return Err(StorageError::BufferNotFound {
                user_ns: user_ns.to_string(),
            });
        }

        let url: Option<String> = conn
            .get(Self::buffer_url_key(user_ns))
            .await
            .map_err(op_err)?;

        let mut body = Vec::with_capacity(raw.len());
        for encoded in &raw {
            body.push(serde_json::from_str(encoded)?);
        }

        Ok(UserBuffer {
            user_ns: user_ns.to_string(),
            url: url.unwrap_or_default(),
            body,
        })
    }

    async fn delete(&self, user_ns: &str) -> StorageResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(Self::buffer_key(user_ns))
            .arg(Self::buffer_url_key(user_ns))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(op_err)?;
        Ok(())
    }

    async fn list_namespaces(&self) -> StorageResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut namespaces = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{BUFFER_PREFIX}*"))
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(op_err)?;

            namespaces.extend(batch.into_iter().filter_map(|key| {
                if key.ends_with(URL_SUFFIX) {
                    return None;
                }
                key.strip_prefix(BUFFER_PREFIX).map(str::to_string)
            }));

            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(namespaces)
    }
}

#[async_trait]
impl MemoStore for RedisStore {
    async fn load(&self, key: &str) -> StorageResult<Option<MemoEntry>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await.map_err(op_err)?;
        if fields.is_empty() {
            return Ok(None);
        }

        let (Some(dados_json), Some(timestamp_raw)) =
            (fields.get("dados"), fields.get("timestamp"))
        else {
            return Ok(None);
        };

        let dados = serde_json::from_str(dados_json)?;
        let seconds: i64 =
            timestamp_raw
                .parse()
                .map_err(|_| StorageError::SerializationError {
                    message: format!("invalid memoize timestamp: {timestamp_raw}"),
                })?;
        let timestamp =
            DateTime::<Utc>::from_timestamp(seconds, 0).ok_or_else(|| {
                StorageError::SerializationError {
                    message: format!("memoize timestamp out of range: {seconds}"),
                }
            })?;

        Ok(Some(MemoEntry { dados, timestamp }))
    }

    async fn store(
        &self,
        key: &str,
        dados: serde_json::Map<String, Value>,
        ttl: Duration,
    ) -> StorageResult<()> {
        let encoded = serde_json::to_string(&Value::Object(dados))?;
        let timestamp = Utc::now().timestamp();

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset(key, "dados", encoded)
            .ignore()
            .hset(key, "timestamp", timestamp)
            .ignore()
            .expire(key, ttl.as_secs() as i64)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(op_err)?;
        Ok(())
    }
}

#[async_trait]
impl LockStore for RedisStore {
    async fn try_lock(&self, user_ns: &str, ttl: Duration) -> StorageResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::lock_key(user_ns))
            .arg("locked")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(op_err)?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, user_ns: &str) -> StorageResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::lock_key(user_ns))
            .await
            .map_err(op_err)?;
        Ok(())
    }
}

#[async_trait]
impl CounterSink for RedisStore {
    async fn increment(
        &self,
        workspace: &str,
        date: &str,
        field: CounterField,
        amount: i64,
    ) -> StorageResult<()> {
        let mut conn = self.conn.clone();
        conn.hincr::<_, _, _, i64>(Self::counter_key(workspace, date), field.as_str(), amount)
            .await
            .map_err(op_err)?;
        Ok(())
    }

    async fn add_minutes(&self, workspace: &str, date: &str, minutes: f64) -> StorageResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("HINCRBYFLOAT")
            .arg(Self::counter_key(workspace, date))
            .arg("minutos")
            .arg(minutes)
            .query_async::<_, f64>(&mut conn)
            .await
            .map_err(op_err)?;
        Ok(())
    }
}

#[async_trait]
impl FailureLogStore for RedisStore {
    async fn save_failed_request(&self, log: FailedRequestLog) -> StorageResult<()> {
        let encoded = serde_json::to_string(&log)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, i64>(FAILURE_LOG_KEY, encoded)
            .await
            .map_err(op_err)?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for RedisStore {
    async fn is_token_valid(&self, token: &str) -> StorageResult<bool> {
        let mut conn = self.conn.clone();
        conn.sismember(TOKEN_SET_KEY, token).await.map_err(op_err)
    }
}
