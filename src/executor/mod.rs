//! Bounded-concurrency async executor (C2).
//!
//! As spec.md §4.C2: a fixed-size worker pool consuming a FIFO of
//! operation-states, with up to `max_concurrent_tasks` "in flight" at once.
//! Built on a `tokio::sync::Semaphore` (permit count == `maxConcurrentTasks`)
//! guarding a `tokio::sync::mpsc` ready queue, mirroring the teacher's
//! worker-pool-draining-a-channel shape rather than a raw OS thread pool,
//! since the rest of the crate is async-first throughout.

pub mod operation;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub use operation::{CommandId, OperationId, OperationState};

use crate::block::pool::SimplePool;
use crate::error::ServerError;

/// A handle to a submitted operation. Can be cancelled; must be released
/// back to the executor exactly once (mirrors spec.md's `releaseOperation`
/// contract).
pub struct OperationHandle {
    pub id: u64,
    cancel: CancellationToken,
    done: oneshot::Receiver<()>,
}

impl OperationHandle {
    /// Cooperative cancellation: sets the token; the running task observes
    /// it at its next checkpoint.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the operation to finish (successfully, cancelled, or
    /// failed) without requesting cancellation.
    pub async fn join(self) {
        let _ = self.done.await;
    }
}

type BoxedOp = Box<
    dyn FnOnce(CancellationToken) -> futures_util::future::BoxFuture<'static, ()> + Send,
>;

struct Submission {
    op: BoxedOp,
    cancel: CancellationToken,
    done: oneshot::Sender<()>,
}

/// Bounds concurrency over submitted operations and buffers the rest FIFO.
/// `dispose()` cancels everything outstanding and waits for in-flight work
/// to unwind.
pub struct Executor {
    tx: mpsc::UnboundedSender<Submission>,
    shutdown: CancellationToken,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    tasks: Arc<Mutex<JoinSet<()>>>,
    next_id: AtomicU64,
    operation_pool: Arc<SimplePool<OperationState>>,
}

impl Executor {
    /// `max_concurrent_tasks` is the semaphore's permit count; this is the
    /// "buffered" back-pressure spec.md §4.C2 describes — bounded memory
    /// regardless of ingress rate, since the ready queue itself is
    /// unbounded but only `max_concurrent_tasks` futures run at once.
    pub fn new(max_concurrent_tasks: usize) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Submission>();
        let shutdown = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(max_concurrent_tasks.max(1)));
        let tasks: Arc<Mutex<JoinSet<()>>> = Arc::new(Mutex::new(JoinSet::new()));

        let worker_shutdown = shutdown.clone();
        let worker_tasks = tasks.clone();
        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = worker_shutdown.cancelled() => break,
                    submission = rx.recv() => {
                        let Some(submission) = submission else { break };
                        let permit = match semaphore.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => break,
                        };
                        worker_tasks.lock().await.spawn(async move {
                            let _permit = permit;
                            (submission.op)(submission.cancel).await;
                            let _ = submission.done.send(());
                        });
                    }
                }
            }
        });

        Arc::new(Self {
            tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
            tasks,
            next_id: AtomicU64::new(0),
            operation_pool: Arc::new(SimplePool::new()),
        })
    }

    /// Enqueues a future-producing closure as one operation. The closure
    /// receives a `CancellationToken` it should observe at checkpoints. The
    /// token is a child of the executor's shutdown token, so `dispose()`
    /// cancels every outstanding operation, not just the dispatch loop.
    pub fn submit<F, Fut>(&self, op: F) -> Result<OperationHandle, ServerError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let (done_tx, done_rx) = oneshot::channel();

        let boxed: BoxedOp = Box::new(move |token| Box::pin(op(token)));

        self.tx
            .send(Submission {
                op: boxed,
                cancel: cancel.clone(),
                done: done_tx,
            })
            .map_err(|_| ServerError::ArgumentError("executor is disposed".into()))?;

        Ok(OperationHandle {
            id,
            cancel,
            done: done_rx,
        })
    }

    /// Takes a pooled `OperationState`, or allocates a fresh one if the pool
    /// is empty (spec.md §3: the pool is a performance optimization, never a
    /// correctness boundary).
    pub fn acquire_operation(&self) -> OperationState {
        self.operation_pool.try_get().unwrap_or_default()
    }

    /// Like `submit`, but threads a filled `OperationState` through the
    /// operation instead of relying on the closure's own captures. `op`
    /// hands the state back on completion so it can be cleared and released
    /// to the pool (spec.md §4.C2's `releaseOperation`), regardless of
    /// whether the operation ran to completion or observed cancellation.
    pub fn submit_operation<F, Fut>(&self, state: OperationState, op: F) -> Result<OperationHandle, ServerError>
    where
        F: FnOnce(CancellationToken, OperationState) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = OperationState> + Send + 'static,
    {
        let pool = self.operation_pool.clone();
        self.submit(move |cancel| async move {
            let mut state = op(cancel, state).await;
            state.clear();
            pool.put(state);
        })
    }

    /// Cancels all pending/in-flight work and stops accepting submissions.
    /// Waits for the dispatch loop to unwind and for every in-flight
    /// operation future to finish (spec.md §4.C2: "cancel all pending, wait
    /// for all executing, and release the backing thread pool").
    pub async fn dispose(self: &Arc<Self>) {
        self.shutdown.cancel();

        if let Some(worker) = self.worker.lock().await.take() {
            let _ = worker.await;
        }

        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }
}
