//! Application state for HTTP handlers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use rsaccum_server::{
    DebounceScheduler, Dispatcher, FlowConfig, FlowProcessor, MemoizeConfig, MemoizeHandler,
    ServerConfig,
};
use rsaccum_storage::{Backend, StorageResult, TokenStore};

/// Positive access-token results are cached in-process for this long before
/// the backend is consulted again.
const TOKEN_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Application state shared across all HTTP handlers.
///
/// Holds the storage backend and the coordination handlers built on it. The
/// whole struct is wrapped in an `Arc` by the router builder.
pub struct AppState<S: Backend> {
    /// The storage backend.
    pub storage: Arc<S>,
    /// Debounce scheduler for the accumulate route.
    pub scheduler: DebounceScheduler<S>,
    /// Memoize-and-merge proxy.
    pub memoize: MemoizeHandler<S>,
    /// Lease-serialized flow processor.
    pub flow: FlowProcessor<S, S>,
    /// Fallback external-API URL for memoize requests that name none.
    pub upstream_fallback: Option<String>,
    /// Whether the accumulate route requires an `access_token` header.
    pub require_access_token: bool,
    /// Positive token results with their validation time.
    token_cache: DashMap<String, Instant>,
}

impl<S: Backend> AppState<S> {
    /// Wires the coordination handlers onto one shared backend.
    pub fn new(storage: Arc<S>, config: &ServerConfig) -> Self {
        let scheduler = DebounceScheduler::new(Arc::clone(&storage), Dispatcher::new());

        let memoize = MemoizeHandler::new(
            Arc::clone(&storage),
            MemoizeConfig {
                default_ttl: Duration::from_secs(config.memoize.default_ttl_secs),
                upstream_timeout: Duration::from_secs(config.upstream.timeout_secs),
            },
        );

        let flow = FlowProcessor::new(
            Arc::clone(&storage),
            Arc::clone(&storage),
            FlowConfig {
                wait_budget: Duration::from_secs(config.flow.wait_budget_secs),
                lock_ttl: Duration::from_secs(config.flow.lock_ttl_secs),
                poll_interval: Duration::from_secs(config.flow.poll_interval_secs),
            },
        );

        Self {
            storage,
            scheduler,
            memoize,
            flow,
            upstream_fallback: config.upstream.api_externa_url.clone(),
            require_access_token: config.security.require_access_token,
            token_cache: DashMap::new(),
        }
    }

    /// Validates an access token, consulting the in-process cache first.
    /// Only positive results are cached.
    pub async fn check_access_token(&self, token: &str) -> StorageResult<bool> {
        if let Some(validated_at) = self.token_cache.get(token) {
            if validated_at.elapsed() < TOKEN_CACHE_TTL {
                return Ok(true);
            }
        }

        let valid = self.storage.is_token_valid(token).await?;
        if valid {
            self.token_cache.insert(token.to_string(), Instant::now());
        }
        Ok(valid)
    }
}
