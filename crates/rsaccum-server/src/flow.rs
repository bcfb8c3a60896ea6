//! Flow serializer: at-most-one in-flight upstream call per `userNs`.
//!
//! A cross-process lease (key with TTL) serializes outbound inference calls.
//! Acquisition polls on a fixed interval bounded by the wait budget; the
//! upstream call gets one retry, and a second failure is written to the
//! durable failure log before the error is returned. The lease is released on
//! every exit path, with the TTL reclaiming leases from crashed holders.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use rsaccum_domain::FailedRequestLog;
use rsaccum_storage::{FailureLogStore, LockStore};

use crate::error::{ServerError, ServerResult};

/// Pluggable transform applied to the body before dispatch.
pub type BodyTransform =
    dyn Fn(serde_json::Map<String, Value>) -> serde_json::Map<String, Value> + Send + Sync;

/// Flow serializer settings.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Bound on lease acquisition and on each upstream call.
    pub wait_budget: Duration,
    /// Lease TTL.
    pub lock_ttl: Duration,
    /// Interval between lease acquisition attempts.
    pub poll_interval: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            wait_budget: Duration::from_secs(600),
            lock_ttl: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Serializes upstream calls per namespace behind a distributed lease.
pub struct FlowProcessor<L: LockStore, F: FailureLogStore> {
    locks: Arc<L>,
    failures: Arc<F>,
    client: reqwest::Client,
    config: FlowConfig,
    transform: Box<BodyTransform>,
}

impl<L: LockStore, F: FailureLogStore> FlowProcessor<L, F> {
    /// Creates a processor with the identity body transform.
    pub fn new(locks: Arc<L>, failures: Arc<F>, config: FlowConfig) -> Self {
        Self {
            locks,
            failures,
            client: reqwest::Client::new(),
            config,
            transform: Box::new(|body| body),
        }
    }

    /// Replaces the body transform.
    pub fn with_transform(mut self, transform: Box<BodyTransform>) -> Self {
        self.transform = transform;
        self
    }

    /// Runs one serialized upstream call for `user_ns`.
    pub async fn run(
        &self,
        user_ns: &str,
        body: serde_json::Map<String, Value>,
        url: &str,
    ) -> ServerResult<Value> {
        let deadline = Instant::now() + self.config.wait_budget;
        self.acquire(user_ns, deadline).await?;
        debug!(%user_ns, "lease acquired");

        let result = self.dispatch_with_retry(user_ns, body, url).await;

        // Best-effort release; the TTL reclaims the lease if this fails.
        if let Err(err) = self.locks.unlock(user_ns).await {
            warn!(%user_ns, error = %err, "failed to release lease, TTL will reclaim it");
        }

        result
    }

    /// Polls for the lease until it is won or the deadline passes.
    async fn acquire(&self, user_ns: &str, deadline: Instant) -> ServerResult<()> {
        loop {
            if self.locks.try_lock(user_ns, self.config.lock_ttl).await? {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ServerError::LockTimeout {
                    user_ns: user_ns.to_string(),
                });
            }

            debug!(%user_ns, "lease busy, waiting before retry");
            let next_attempt = (now + self.config.poll_interval).min(deadline);
            tokio::time::sleep_until(next_attempt).await;
            if Instant::now() >= deadline {
                return Err(ServerError::LockTimeout {
                    user_ns: user_ns.to_string(),
                });
            }
        }
    }

    /// One upstream call with a single retry; a second failure lands in the
    /// failure log.
    async fn dispatch_with_retry(
        &self,
        user_ns: &str,
        body: serde_json::Map<String, Value>,
        url: &str,
    ) -> ServerResult<Value> {
        let transformed = (self.transform)(body.clone());

        match self.call_upstream(url, &transformed).await {
            Ok(response) => Ok(response),
            Err(first) => {
                warn!(%user_ns, error = %first, "upstream call failed, retrying once");
                match self.call_upstream(url, &transformed).await {
                    Ok(response) => Ok(response),
                    Err(second) => {
                        self.backup_failure(user_ns, body, &second).await;
                        Err(second)
                    }
                }
            }
        }
    }

    /// POSTs the body and decodes the JSON reply, all bounded by the wait
    /// budget so a stalled upstream is observable instead of hanging the
    /// lease holder.
    async fn call_upstream(
        &self,
        url: &str,
        body: &serde_json::Map<String, Value>,
    ) -> ServerResult<Value> {
        let call = async {
            let response = self
                .client
                .post(url)
                .json(body)
                .send()
                .await
                .map_err(ServerError::UpstreamTransport)?;

            let status = response.status();
            if !status.is_success() {
                return Err(ServerError::UpstreamRejected {
                    status: status.as_u16(),
                });
            }

            response
                .json::<Value>()
                .await
                .map_err(ServerError::UpstreamTransport)
        };

        match tokio::time::timeout(self.config.wait_budget, call).await {
            Ok(result) => result,
            Err(_) => Err(ServerError::UpstreamTimeout),
        }
    }

    async fn backup_failure(
        &self,
        user_ns: &str,
        request: serde_json::Map<String, Value>,
        err: &ServerError,
    ) {
        let log = FailedRequestLog {
            user_ns: user_ns.to_string(),
            request,
            response_data: None,
            error_msg: err.to_string(),
            timestamp: Utc::now(),
        };
        if let Err(save_err) = self.failures.save_failed_request(log).await {
            error!(%user_ns, error = %save_err, "failed to persist failure log entry");
        }
    }
}
