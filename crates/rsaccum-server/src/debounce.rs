//! Per-key debounce scheduler.
//!
//! Collapses bursts of writes for the same `userNs` into one outbound
//! dispatch. Each write appends to the shared buffer and re-arms a single
//! per-key timer for `window + 1` seconds (the extra second absorbs clock
//! jitter between producers and is part of the contract). When the timer
//! fires, the accumulated buffer is reordered, dispatched and deleted.
//!
//! The timer registry is process-local and guarded by one mutex; slots are
//! generation-tagged so a firing task only unregisters itself, never a timer
//! armed after it. Buffers live in the shared store, so a task that loses the
//! fetch race simply finds nothing and returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rsaccum_domain::{reorder_control_first, BodyItem};
use rsaccum_storage::BufferStore;

use crate::dispatch::Dispatcher;
use crate::error::ServerResult;

struct TimerSlot {
    generation: u64,
    handle: JoinHandle<()>,
}

struct SchedulerInner<B: BufferStore> {
    buffers: Arc<B>,
    dispatcher: Dispatcher,
    timers: Mutex<HashMap<String, TimerSlot>>,
}

impl<B: BufferStore> SchedulerInner<B> {
    /// Flushes the accumulated buffer for one namespace.
    ///
    /// A missing buffer means a competing flush already handled it: silent
    /// return. Dispatch failures keep the buffer in place so a later submit
    /// or an operator purge can deal with it.
    async fn flush(&self, user_ns: &str) {
        let buffer = match self.buffers.fetch(user_ns).await {
            Ok(buffer) => buffer,
            Err(err) if err.is_not_found() => {
                debug!(%user_ns, "buffer already flushed");
                return;
            }
            Err(err) => {
                error!(%user_ns, error = %err, "failed to fetch buffered data");
                return;
            }
        };

        let ordered = reorder_control_first(&buffer.body);
        if let Err(err) = self.dispatcher.dispatch(&buffer.url, &ordered).await {
            warn!(%user_ns, error = %err, "flush dispatch failed, keeping buffer");
            return;
        }

        if let Err(err) = self.buffers.delete(user_ns).await {
            error!(%user_ns, error = %err, "failed to delete flushed buffer");
        }
    }
}

/// Debounce scheduler over a shared buffer store.
pub struct DebounceScheduler<B: BufferStore> {
    inner: Arc<SchedulerInner<B>>,
}

impl<B: BufferStore> Clone for DebounceScheduler<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: BufferStore> DebounceScheduler<B> {
    pub fn new(buffers: Arc<B>, dispatcher: Dispatcher) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                buffers,
                dispatcher,
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Accepts one write for `user_ns`.
    ///
    /// With `window_secs == 0` the items are reordered and dispatched
    /// synchronously; errors propagate to the caller. Otherwise the items are
    /// appended to the shared buffer and the per-key timer is re-armed for
    /// `window_secs + 1` seconds.
    pub async fn submit(
        &self,
        user_ns: &str,
        items: Vec<BodyItem>,
        url: &str,
        window_secs: u64,
    ) -> ServerResult<()> {
        if window_secs == 0 {
            let ordered = reorder_control_first(&items);
            return self.inner.dispatcher.dispatch(url, &ordered).await;
        }

        self.inner.buffers.append(user_ns, items, url).await?;
        self.arm(user_ns, Duration::from_secs(window_secs + 1));
        Ok(())
    }

    /// Re-arms the flush timer for a namespace, cancelling any armed one.
    fn arm(&self, user_ns: &str, delay: Duration) {
        let mut timers = self.inner.timers.lock().expect("timer registry poisoned");

        let generation = match timers.remove(user_ns) {
            Some(previous) => {
                previous.handle.abort();
                previous.generation.wrapping_add(1)
            }
            None => 0,
        };

        let inner = Arc::clone(&self.inner);
        let ns = user_ns.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // Unregister, but only if this timer is still the armed one; a
            // newer generation means a re-arm superseded us mid-wakeup.
            let still_armed = {
                let mut timers = inner.timers.lock().expect("timer registry poisoned");
                match timers.get(&ns) {
                    Some(slot) if slot.generation == generation => {
                        timers.remove(&ns);
                        true
                    }
                    _ => false,
                }
            };

            if still_armed {
                inner.flush(&ns).await;
            }
        });

        timers.insert(
            user_ns.to_string(),
            TimerSlot { generation, handle },
        );
    }

    /// Re-arms a short flush for every buffer that survived a restart.
    /// Armed timers are process-local, so without this scan data written just
    /// before a crash would sit in the store until the next submit.
    pub async fn recover(&self, delay: Duration) -> ServerResult<usize> {
        let namespaces = self.inner.buffers.list_namespaces().await?;
        let count = namespaces.len();
        for user_ns in namespaces {
            self.arm(&user_ns, delay);
        }
        if count > 0 {
            info!(count, "re-armed flush timers for surviving buffers");
        }
        Ok(count)
    }

    /// Operator tool: cancel the armed timer and drop the buffer.
    pub async fn purge(&self, user_ns: &str) -> ServerResult<()> {
        {
            let mut timers = self.inner.timers.lock().expect("timer registry poisoned");
            if let Some(slot) = timers.remove(user_ns) {
                slot.handle.abort();
            }
        }
        self.inner.buffers.delete(user_ns).await?;
        Ok(())
    }

    /// Number of currently armed timers.
    pub fn armed_timers(&self) -> usize {
        self.inner
            .timers
            .lock()
            .expect("timer registry poisoned")
            .len()
    }
}
