//! Memoize-and-merge proxy for an external API.
//!
//! Repeated calls with partial payloads converge on the full, most-recent
//! composite: fields accumulate in the shared store under a composite key and
//! each call forwards the merged map. Entries older than the default TTL are
//! treated as absent, so expired state starts fresh instead of drifting.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use rsaccum_storage::{MemoEntry, MemoStore};

use crate::error::{ServerError, ServerResult};

/// Cache key: `userNs + "-" + hex(sha256(apiUrl))`. Hashing the URL keeps
/// the key length bounded and safe for the keyspace.
pub fn composite_key(user_ns: &str, api_url: &str) -> String {
    let digest = Sha256::digest(api_url.as_bytes());
    format!("{user_ns}-{digest:x}")
}

/// Memoize handler settings.
#[derive(Debug, Clone)]
pub struct MemoizeConfig {
    /// Default TTL, doubling as the staleness horizon.
    pub default_ttl: Duration,
    /// Per-call timeout for the external API.
    pub upstream_timeout: Duration,
}

impl Default for MemoizeConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

/// Composite-keyed memoize cache in front of an external API.
pub struct MemoizeHandler<M: MemoStore> {
    store: Arc<M>,
    client: reqwest::Client,
    config: MemoizeConfig,
}

impl<M: MemoStore> MemoizeHandler<M> {
    pub fn new(store: Arc<M>, config: MemoizeConfig) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Merges `dados` into the cached composite, refreshes the entry and
    /// proxies the merged body to `api_url`.
    ///
    /// Only the new fields are persisted (previously stored fields survive in
    /// the hash); the entry's timestamp is always refreshed and the TTL is
    /// `ttl_secs` when positive, the default otherwise. The `id` field rides
    /// on the outbound map but is never persisted.
    pub async fn process(
        &self,
        user_ns: &str,
        api_url: &str,
        dados: serde_json::Map<String, Value>,
        ttl_secs: Option<u64>,
    ) -> ServerResult<Bytes> {
        let key = composite_key(user_ns, api_url);
        let previous = self.store.load(&key).await?;
        let now = Utc::now();

        let merged = match previous {
            Some(entry) if self.is_fresh(&entry, now) => {
                debug!(%user_ns, "merging cached fields with new body");
                let mut merged = entry.dados;
                merged.extend(dados.iter().map(|(k, v)| (k.clone(), v.clone())));
                merged
            }
            _ => {
                debug!(%user_ns, "no fresh cached fields, using new body only");
                dados.clone()
            }
        };

        let mut to_store = dados;
        to_store.remove("id");

        let ttl = match ttl_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => self.config.default_ttl,
        };
        self.store.store(&key, to_store, ttl).await?;

        let response = self
            .client
            .post(api_url)
            .timeout(self.config.upstream_timeout)
            .json(&merged)
            .send()
            .await
            .map_err(ServerError::UpstreamTransport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServerError::UpstreamRejected {
                status: status.as_u16(),
            });
        }

        response.bytes().await.map_err(ServerError::UpstreamTransport)
    }

    fn is_fresh(&self, entry: &MemoEntry, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.timestamp)
            .to_std()
            // A timestamp in the future only happens under clock skew; treat
            // it as fresh rather than discarding live fields.
            .map(|age| age <= self.config.default_ttl)
            .unwrap_or(true)
    }
}
