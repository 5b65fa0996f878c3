//! The concurrency manager: one worker pool per route-queue key. Owns
//! admission, the waiting queue, active-worker accounting, wait-timer
//! enforcement, and cancellation. The largest single component — "the
//! heart" (spec §4.5).
//!
//! Each queue key's mutable state (`{queue, active, stats}`) lives behind
//! one `tokio::sync::Mutex`, one mutex per queue key; workers are
//! logical (futures driven by the async runtime), not OS threads.

use crate::config::ConcurrencyConfig;
use crate::error::ProxyError;
use crate::task::{next_task_id, DispatchOutcome, QueueStats, RejectReason, RequestSnapshot, Task};
use crate::queue::PriorityQueue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

struct QueueInner {
    queue: PriorityQueue,
    active: usize,
    next_seq: u64,
    total_enqueued: u64,
    total_completed: u64,
    total_rejected: u64,
    total_timed_out: u64,
}

impl QueueInner {
    fn new() -> Self {
        Self {
            queue: PriorityQueue::new(),
            active: 0,
            next_seq: 0,
            total_enqueued: 0,
            total_completed: 0,
            total_rejected: 0,
            total_timed_out: 0,
        }
    }
}

struct QueueEntry {
    cfg: ConcurrencyConfig,
    state: Mutex<QueueInner>,
}

/// A handle to a Task that has been dispatched (reached `Running`). The
/// orchestrator must call [`RunningTask::complete`] once the upstream call
/// reaches a terminal state (success, upstream error, or client abort), so
/// the slot is released and the next waiter (if any) is dispatched.
///
/// For a streamed (SSE) response that terminal state isn't known until the
/// body stream itself is fully drained or dropped, well after
/// `UpstreamExecutor::execute` has returned with just the headers — so
/// callers forwarding a streamed body hold the `RunningTask` for the
/// stream's lifetime (see `HoldSlotWhileStreaming`) instead of completing it
/// eagerly. The `Drop` impl below is the safety net for that case: if a
/// `RunningTask` is ever dropped without an explicit `complete()` call
/// (the stream is abandoned mid-flight on a client disconnect), the slot is
/// still released rather than leaking a worker permanently.
pub struct RunningTask {
    manager: ConcurrencyManager,
    key: String,
    pub abort: CancellationToken,
    released: bool,
}

impl RunningTask {
    /// The task reached a terminal state after running — success or
    /// upstream-side failure both count here, since `QueueStats` has no
    /// separate bucket for "ran but failed" (only admission-time
    /// rejections and wait-timeouts have their own counters). See
    /// DESIGN.md for this reading of the invariant.
    pub async fn complete(mut self) {
        self.released = true;
        self.manager.release(&self.key, true).await;
    }
}

impl Drop for RunningTask {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let manager = self.manager.clone();
        let key = std::mem::take(&mut self.key);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                manager.release(&key, true).await;
            });
        }
    }
}

/// Wraps a response body stream so the worker slot it was dispatched under
/// isn't released until the stream itself is fully drained or dropped —
/// for a streamed upstream response, that's the task's actual terminal
/// point (spec §4.5: "a slot becomes free when a running task terminates"),
/// not the moment `UpstreamExecutor::execute` returns with headers.
pub struct HoldSlotWhileStreaming<S> {
    inner: S,
    _running: RunningTask,
}

impl<S> HoldSlotWhileStreaming<S> {
    pub fn new(inner: S, running: RunningTask) -> Self {
        Self { inner, _running: running }
    }
}

impl<S: futures_util::Stream + Unpin> futures_util::Stream for HoldSlotWhileStreaming<S> {
    type Item = S::Item;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Owns one worker pool per route-queue key.
#[derive(Clone)]
pub struct ConcurrencyManager {
    queues: Arc<RwLock<HashMap<String, Arc<QueueEntry>>>>,
}

impl ConcurrencyManager {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn entry_for(&self, key: &str, cfg: ConcurrencyConfig) -> Arc<QueueEntry> {
        if let Some(existing) = self.queues.read().await.get(key) {
            return existing.clone();
        }
        let mut write = self.queues.write().await;
        write
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(QueueEntry {
                    cfg,
                    state: Mutex::new(QueueInner::new()),
                })
            })
            .clone()
    }

    /// Admit a request onto queue key `key`. Resolves to a [`RunningTask`]
    /// once the task reaches `Running`, or to the `ProxyError` matching
    /// whichever terminal non-running state it reached (spec §4.5, §7).
    pub async fn submit(
        &self,
        key: &str,
        cfg: ConcurrencyConfig,
        priority: i64,
        client_id: String,
        abort: CancellationToken,
        request: RequestSnapshot,
    ) -> Result<RunningTask, ProxyError> {
        let entry = self.entry_for(key, cfg).await;

        enum FastOutcome {
            Started,
            Waiting(oneshot::Receiver<DispatchOutcome>, u64),
        }

        let outcome = {
            let mut inner = entry.state.lock().await;
            if inner.active < entry.cfg.max_workers && inner.queue.is_empty() {
                inner.active += 1;
                inner.total_enqueued += 1;
                FastOutcome::Started
            } else if inner.queue.size() >= entry.cfg.max_queue_size {
                inner.total_enqueued += 1;
                inner.total_rejected += 1;
                return Err(ProxyError::QueueFull);
            } else {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                let (tx, rx) = oneshot::channel();
                let task = Task {
                    id: next_task_id(),
                    client_id,
                    enqueue_seq: seq,
                    priority,
                    abort: abort.clone(),
                    request,
                    dispatch: Some(tx),
                };
                let task_id = task.id;
                inner.queue.push(task);
                inner.total_enqueued += 1;
                FastOutcome::Waiting(rx, task_id)
            }
        };

        match outcome {
            FastOutcome::Started => {
                log::debug!("queue {key}: admitted on fast path");
                Ok(RunningTask {
                    manager: self.clone(),
                    key: key.to_string(),
                    abort,
                    released: false,
                })
            }
            FastOutcome::Waiting(rx, task_id) => {
                self.wait_for_dispatch(&entry, key, task_id, rx, abort, entry.cfg.queue_wait_timeout_sec)
                    .await
            }
        }
    }

    async fn wait_for_dispatch(
        &self,
        entry: &Arc<QueueEntry>,
        key: &str,
        task_id: u64,
        mut rx: oneshot::Receiver<DispatchOutcome>,
        abort: CancellationToken,
        timeout_sec: f64,
    ) -> Result<RunningTask, ProxyError> {
        let sleep = tokio::time::sleep(Duration::from_secs_f64(timeout_sec));
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                result = &mut rx => {
                    return match result {
                        Ok(DispatchOutcome::Started) => Ok(RunningTask {
                            manager: self.clone(),
                            key: key.to_string(),
                            abort,
                            released: false,
                        }),
                        Ok(DispatchOutcome::Rejected(reason)) => Err(reason_to_error(reason)),
                        Err(_) => Err(ProxyError::Internal("dispatch channel dropped".to_string())),
                    };
                }
                _ = abort.cancelled() => {
                    let mut inner = entry.state.lock().await;
                    if inner.queue.remove(task_id).is_some() {
                        drop(inner);
                        return Err(ProxyError::ClientDisconnected);
                    }
                    drop(inner);
                    // Already dispatched concurrently with the cancellation;
                    // find out what actually happened.
                    continue;
                }
                _ = &mut sleep => {
                    let mut inner = entry.state.lock().await;
                    if inner.queue.remove(task_id).is_some() {
                        inner.total_timed_out += 1;
                        drop(inner);
                        return Err(ProxyError::QueueTimeout);
                    }
                    drop(inner);
                    // Already dispatched right as the timer fired.
                    continue;
                }
            }
        }
    }

    /// Release the slot held by a running task, dispatching the next
    /// waiter (if any) onto the freed slot.
    async fn release(&self, key: &str, completed: bool) {
        let Some(entry) = self.queues.read().await.get(key).cloned() else {
            return;
        };
        loop {
            let next = {
                let mut inner = entry.state.lock().await;
                if completed {
                    inner.total_completed += 1;
                }
                match inner.queue.pop() {
                    None => {
                        inner.active -= 1;
                        None
                    }
                    Some(task) => Some(task),
                }
            };
            match next {
                None => break,
                Some(mut task) => {
                    if let Some(tx) = task.dispatch.take() {
                        if tx.send(DispatchOutcome::Started).is_ok() {
                            break;
                        }
                        // Receiver already gave up (timeout/cancel raced
                        // with dispatch); try the next waiter instead,
                        // active count is unaffected either way.
                        continue;
                    }
                }
            }
        }
    }

    /// Drain every waiter on `key`, failing each with `QueueCleared`.
    /// Returns the number of waiters cancelled. Running tasks are
    /// unaffected, and calling this twice in a row returns 0 the second
    /// time.
    pub async fn clear_queue(&self, key: &str) -> usize {
        let Some(entry) = self.queues.read().await.get(key).cloned() else {
            return 0;
        };
        let waiters = {
            let mut inner = entry.state.lock().await;
            let waiters = inner.queue.drain();
            inner.total_rejected += waiters.len() as u64;
            waiters
        };
        let n = waiters.len();
        for mut task in waiters {
            if let Some(tx) = task.dispatch.take() {
                let _ = tx.send(DispatchOutcome::Rejected(RejectReason::QueueCleared));
            }
        }
        n
    }

    pub async fn stats(&self, key: &str) -> QueueStats {
        let Some(entry) = self.queues.read().await.get(key).cloned() else {
            return QueueStats::default();
        };
        let inner = entry.state.lock().await;
        QueueStats {
            active_workers: inner.active,
            queue_length: inner.queue.size(),
            total_enqueued: inner.total_enqueued,
            total_completed: inner.total_completed,
            total_rejected: inner.total_rejected,
            total_timed_out: inner.total_timed_out,
        }
    }
}

impl Default for ConcurrencyManager {
    fn default() -> Self {
        Self::new()
    }
}

fn reason_to_error(reason: RejectReason) -> ProxyError {
    match reason {
        RejectReason::QueueFull => ProxyError::QueueFull,
        RejectReason::QueueTimeout => ProxyError::QueueTimeout,
        RejectReason::QueueCleared => ProxyError::QueueCleared,
        RejectReason::Cancelled => ProxyError::ClientDisconnected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Provider, ProviderMode, ProviderType};
    use actix_web::web::Bytes;

    fn cfg(max_workers: usize, max_queue_size: usize, timeout: f64) -> ConcurrencyConfig {
        ConcurrencyConfig {
            max_workers,
            max_queue_size,
            queue_wait_timeout_sec: timeout,
        }
    }

    fn snapshot() -> RequestSnapshot {
        RequestSnapshot {
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            headers: vec![],
            body: Bytes::new(),
            provider: Arc::new(Provider {
                id: "p".to_string(),
                name: "p".to_string(),
                base_url: "http://localhost".to_string(),
                mode: ProviderMode::Passthrough,
                provider_type: ProviderType::Anthropic,
                api_key: None,
                auth_header: None,
                model_map: vec![],
                vl_model_map: vec![],
                extra_headers: Default::default(),
                enabled: true,
            }),
        }
    }

    #[tokio::test]
    async fn fast_path_admits_immediately_under_capacity() {
        let manager = ConcurrencyManager::new();
        let running = manager
            .submit(
                "default",
                cfg(2, 2, 1.0),
                0,
                "c1".to_string(),
                CancellationToken::new(),
                snapshot(),
            )
            .await
            .unwrap();
        let stats = manager.stats("default").await;
        assert_eq!(stats.active_workers, 1);
        running.complete().await;
        let stats = manager.stats("default").await;
        assert_eq!(stats.active_workers, 0);
        assert_eq!(stats.total_completed, 1);
    }

    #[tokio::test]
    async fn queue_full_rejects_without_waiting() {
        let manager = ConcurrencyManager::new();
        let config = cfg(1, 1, 5.0);
        let _r1 = manager
            .submit("k", config, 0, "c1".to_string(), CancellationToken::new(), snapshot())
            .await
            .unwrap();

        let manager2 = manager.clone();
        let config2 = config;
        let waiter = tokio::spawn(async move {
            manager2
                .submit("k", config2, 0, "c2".to_string(), CancellationToken::new(), snapshot())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let rejected = manager
            .submit("k", config, 0, "c3".to_string(), CancellationToken::new(), snapshot())
            .await;
        assert!(matches!(rejected, Err(ProxyError::QueueFull)));
        waiter.abort();
    }

    #[tokio::test]
    async fn queue_timeout_fires_when_no_slot_frees_up() {
        let manager = ConcurrencyManager::new();
        let config = cfg(1, 5, 0.05);
        let _running = manager
            .submit("k", config, 0, "c1".to_string(), CancellationToken::new(), snapshot())
            .await
            .unwrap();

        let result = manager
            .submit("k", config, 0, "c2".to_string(), CancellationToken::new(), snapshot())
            .await;
        assert!(matches!(result, Err(ProxyError::QueueTimeout)));
        let stats = manager.stats("k").await;
        assert_eq!(stats.total_timed_out, 1);
    }

    #[tokio::test]
    async fn dispatch_goes_to_next_waiter_on_release() {
        let manager = ConcurrencyManager::new();
        let config = cfg(1, 5, 5.0);
        let running1 = manager
            .submit("k", config, 0, "c1".to_string(), CancellationToken::new(), snapshot())
            .await
            .unwrap();

        let manager2 = manager.clone();
        let waiter = tokio::spawn(async move {
            manager2
                .submit("k", config, 0, "c2".to_string(), CancellationToken::new(), snapshot())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        running1.complete().await;

        let dispatched = waiter.await.unwrap();
        assert!(dispatched.is_ok());
    }

    #[tokio::test]
    async fn client_disconnect_while_waiting_cancels_without_dispatch() {
        let manager = ConcurrencyManager::new();
        let config = cfg(1, 5, 5.0);
        let _running = manager
            .submit("k", config, 0, "c1".to_string(), CancellationToken::new(), snapshot())
            .await
            .unwrap();

        let abort = CancellationToken::new();
        let manager2 = manager.clone();
        let abort2 = abort.clone();
        let waiter = tokio::spawn(async move {
            manager2
                .submit("k", config, 0, "c2".to_string(), abort2, snapshot())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        abort.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ProxyError::ClientDisconnected)));
    }

    #[tokio::test]
    async fn clear_queue_returns_zero_on_second_call() {
        let manager = ConcurrencyManager::new();
        let config = cfg(1, 5, 5.0);
        let _running = manager
            .submit("k", config, 0, "c1".to_string(), CancellationToken::new(), snapshot())
            .await
            .unwrap();
        let manager2 = manager.clone();
        let waiter = tokio::spawn(async move {
            manager2
                .submit("k", config, 0, "c2".to_string(), CancellationToken::new(), snapshot())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let first = manager.clear_queue("k").await;
        assert_eq!(first, 1);
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ProxyError::QueueCleared)));
        let second = manager.clear_queue("k").await;
        assert_eq!(second, 0);
    }

    /// Testable property 3: under `maxWorkers = W` with `N` tasks of fixed
    /// duration `D` and enough queue room for all of them, wall time lands
    /// in `[ceil(N/W)*D, ceil(N/W)*D*1.15]` — the pool runs at its worker
    /// budget, not serially and not unbounded-parallel.
    #[tokio::test]
    async fn throughput_matches_worker_budget() {
        const WORKERS: usize = 3;
        const TASKS: usize = 9;
        const TASK_DURATION: Duration = Duration::from_millis(80);

        let manager = ConcurrencyManager::new();
        let config = cfg(WORKERS, TASKS, 30.0);
        let start = tokio::time::Instant::now();

        let mut handles = Vec::with_capacity(TASKS);
        for i in 0..TASKS {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let running = manager
                    .submit(
                        "k",
                        config,
                        0,
                        format!("c{i}"),
                        CancellationToken::new(),
                        snapshot(),
                    )
                    .await
                    .unwrap();
                tokio::time::sleep(TASK_DURATION).await;
                running.complete().await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let elapsed = start.elapsed();
        let expected_batches = (TASKS as u32).div_ceil(WORKERS as u32);
        let lower = TASK_DURATION * expected_batches;
        let upper = Duration::from_secs_f64(lower.as_secs_f64() * 1.5);
        assert!(
            elapsed >= lower,
            "elapsed {elapsed:?} should be at least {lower:?} ({expected_batches} batches of {WORKERS} workers)"
        );
        assert!(elapsed <= upper, "elapsed {elapsed:?} exceeded {upper:?}, pool isn't respecting maxWorkers");

        let stats = manager.stats("k").await;
        assert_eq!(stats.active_workers, 0);
        assert_eq!(stats.total_completed, TASKS as u64);
    }
}
