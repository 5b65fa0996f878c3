//! The unit of work the concurrency manager schedules: one inbound request
//! admitted into a queue key's worker pool.

use crate::config::Provider;
use actix_web::web::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Monotonic id generator for tasks, reused as the priority-queue
/// `enqueueSeq` tiebreaker (spec §4.4: ties broken oldest-first).
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_task_id() -> u64 {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Everything the executor needs to actually issue the upstream call, once
/// a Task has been dispatched. Captured at admission time so the scheduler
/// never has to re-derive it.
#[derive(Clone)]
pub struct RequestSnapshot {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub provider: Arc<Provider>,
}

/// A task waiting in, or running out of, a queue key's worker pool.
///
/// A Task's lifecycle state is monotonic — `Queued -> {Running ->
/// {Completed | Failed | TimedOut}} | Cancelled | TimedOut` — but is never
/// materialized as its own field here: `Queued` is "present in a
/// `PriorityQueue`", `Running` is "owned by a `RunningTask` handle", and the
/// terminal states are reported through `DispatchOutcome`/`RejectReason` and
/// `QueueStats`'s counters rather than read back off the `Task` itself,
/// which stops existing once it is dispatched or rejected.
///
/// `abort` is the one cancellation signal for the whole lifecycle (spec
/// §5): firing it while queued removes the task from the queue; firing it
/// while running tears down the in-flight upstream connection. It is
/// level-triggered and safe to fire more than once.
pub struct Task {
    pub id: u64,
    pub client_id: String,
    pub enqueue_seq: u64,
    pub priority: i64,
    pub abort: CancellationToken,
    pub request: RequestSnapshot,
    /// Fulfilled by the concurrency manager when the task is dispatched,
    /// so the orchestrator (which is awaiting this) can proceed to call
    /// the executor. `None` is sent if the task never reaches `Running`
    /// (cancelled, timed out, or the queue was cleared).
    pub dispatch: Option<oneshot::Sender<DispatchOutcome>>,
}

/// What admission/dispatch resolved to, delivered once per Task.
pub enum DispatchOutcome {
    /// The task was started; the receiver now owns running it to
    /// completion and must call `ConcurrencyManager::release` on exit.
    Started,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy)]
pub enum RejectReason {
    QueueFull,
    QueueTimeout,
    QueueCleared,
    Cancelled,
}

/// Read-only snapshot of a single queue key's accounting. Maintained by
/// the concurrency manager; never locked for longer than the copy takes.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub active_workers: usize,
    pub queue_length: usize,
    pub total_enqueued: u64,
    pub total_completed: u64,
    pub total_rejected: u64,
    pub total_timed_out: u64,
}
