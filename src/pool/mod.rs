//! Bounded-concurrency worker pool
//!
//! Every concurrent unit of the pipeline runs on a [`WorkerPool`]: batch page
//! fetches in the orchestrator and prefetch workers in the cache manager.
//!
//! - `start(n)` spawns `n` workers pulling from a bounded queue (default
//!   `2 * n` slots)
//! - `submit` assigns the next sequential index once a queue slot is
//!   reserved, so a cancelled submission never consumes an index
//! - results arrive on an unbounded sink in completion order; the sink closes
//!   exactly once, when the last worker exits after [`WorkerPool::stop`]
//! - a task error is captured in its own [`TaskResult`] and never affects
//!   sibling tasks

use crate::cancel::{CancelReason, CancelToken};
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A unit of work: a zero-argument closure producing a future.
pub type Task<T, E> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, E>> + Send>;

/// Outcome of one task, tagged with the index assigned at submission.
#[derive(Debug)]
pub struct TaskResult<T, E> {
    /// Submission index
    pub index: usize,
    /// Task output
    pub outcome: Result<T, E>,
}

impl<T, E> TaskResult<T, E> {
    /// Whether the task failed.
    pub fn is_err(&self) -> bool {
        self.outcome.is_err()
    }
}

/// Worker pool errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The controlling token fired
    #[error("worker pool interrupted: {0}")]
    Cancelled(CancelReason),

    /// `stop()` was already called
    #[error("worker pool is closed")]
    Closed,

    /// Non-blocking submit found the queue full
    #[error("worker pool queue is full")]
    QueueFull,
}

/// Partial output of an interrupted [`execute_batch`].
#[derive(Debug)]
pub struct Interrupted<T, E> {
    /// Results that completed before the interruption, ordered by index
    pub partial: Vec<TaskResult<T, E>>,
    /// Why the batch stopped
    pub error: PoolError,
}

struct Job<T, E> {
    index: usize,
    task: Task<T, E>,
}

/// Fixed-size pool of tokio workers fed by a bounded queue.
pub struct WorkerPool<T, E> {
    sender: Option<mpsc::Sender<Job<T, E>>>,
    results: Option<mpsc::UnboundedReceiver<TaskResult<T, E>>>,
    workers: Vec<JoinHandle<()>>,
    next_index: AtomicUsize,
    cancel: CancelToken,
}

impl<T, E> WorkerPool<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Start `worker_count` workers with a queue of `2 * worker_count` slots.
    pub fn start(worker_count: usize, cancel: CancelToken) -> Self {
        let worker_count = worker_count.max(1);
        Self::with_queue_size(worker_count, worker_count * 2, cancel)
    }

    /// Start `worker_count` workers with an explicit queue size.
    pub fn with_queue_size(worker_count: usize, queue_size: usize, cancel: CancelToken) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = mpsc::channel::<Job<T, E>>(queue_size.max(1));
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..worker_count)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    receiver.clone(),
                    result_tx.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        debug!(worker_count, queue_size, "Worker pool started");

        Self {
            sender: Some(sender),
            results: Some(result_rx),
            workers,
            next_index: AtomicUsize::new(0),
            cancel,
        }
    }

    /// Enqueue a task, waiting for a free queue slot if necessary.
    ///
    /// Returns the index assigned to the task.
    pub async fn submit<F, Fut>(&self, task: F) -> Result<usize, PoolError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(PoolError::Closed)?;
        if let Some(reason) = self.cancel.reason() {
            return Err(PoolError::Cancelled(reason));
        }

        let permit = tokio::select! {
            biased;
            reason = self.cancel.cancelled() => return Err(PoolError::Cancelled(reason)),
            permit = sender.reserve() => permit.map_err(|_| PoolError::Closed)?,
        };

        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        permit.send(Job {
            index,
            task: box_task(task),
        });
        Ok(index)
    }

    /// Enqueue a task without waiting. Fails with [`PoolError::QueueFull`]
    /// when no slot is free.
    pub fn try_submit<F, Fut>(&self, task: F) -> Result<usize, PoolError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(PoolError::Closed)?;
        if let Some(reason) = self.cancel.reason() {
            return Err(PoolError::Cancelled(reason));
        }

        let permit = sender.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PoolError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PoolError::Closed,
        })?;

        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        permit.send(Job {
            index,
            task: box_task(task),
        });
        Ok(index)
    }

    /// Take the result sink. Results arrive in completion order.
    ///
    /// Returns `None` if the sink was already taken.
    pub fn take_results(&mut self) -> Option<mpsc::UnboundedReceiver<TaskResult<T, E>>> {
        self.results.take()
    }

    /// Number of tasks submitted so far.
    pub fn submitted(&self) -> usize {
        self.next_index.load(Ordering::SeqCst)
    }

    /// Token controlling this pool's workers.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Stop accepting tasks. Workers drain what is already queued and exit.
    pub fn stop(&mut self) {
        self.sender.take();
    }

    /// Stop accepting tasks and wait for every worker to exit. After this
    /// returns the result sink is closed.
    pub async fn wait(mut self) {
        self.stop();
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task panicked");
            }
        }
    }
}

fn box_task<T, E, F, Fut>(task: F) -> Task<T, E>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    Box::new(move || Box::pin(task()) as BoxFuture<'static, Result<T, E>>)
}

async fn run_worker<T, E>(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<Job<T, E>>>>,
    results: mpsc::UnboundedSender<TaskResult<T, E>>,
    cancel: CancelToken,
) {
    loop {
        let job = {
            let mut queue = queue.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                job = queue.recv() => job,
            }
        };

        let Some(Job { index, task }) = job else {
            break;
        };

        // Queued work is abandoned once the token fires; in-flight work is aborted.
        if cancel.is_cancelled() {
            break;
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = task() => Some(outcome),
        };

        match outcome {
            Some(outcome) => {
                // A dropped sink means nobody wants results; keep draining.
                let _ = results.send(TaskResult { index, outcome });
            }
            None => {
                debug!(worker_id, index, "Task aborted by cancellation");
                break;
            }
        }
    }

    debug!(worker_id, "Worker exiting");
}

/// Run a fixed list of tasks on a fresh pool and wait for every result.
///
/// On success the results are ordered by index (submission order). If the
/// token fires first, the results completed so far are returned inside
/// [`Interrupted`] together with the cancellation error.
pub async fn execute_batch<T, E>(
    tasks: Vec<Task<T, E>>,
    worker_count: usize,
    cancel: &CancelToken,
) -> Result<Vec<TaskResult<T, E>>, Interrupted<T, E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let expected = tasks.len();
    let mut pool = WorkerPool::start(worker_count.min(expected.max(1)), cancel.clone());
    let mut receiver = match pool.take_results() {
        Some(receiver) => receiver,
        None => {
            return Err(Interrupted {
                partial: Vec::new(),
                error: PoolError::Closed,
            })
        }
    };

    let mut collected = Vec::with_capacity(expected);
    let mut submit_error = None;

    for task in tasks {
        // Drain completed results so the unbounded sink stays small.
        while let Ok(result) = receiver.try_recv() {
            collected.push(result);
        }
        if let Err(e) = pool.submit(task).await {
            submit_error = Some(e);
            break;
        }
    }

    pool.wait().await;
    while let Some(result) = receiver.recv().await {
        collected.push(result);
    }
    collected.sort_by_key(|r| r.index);

    let error = submit_error.or_else(|| cancel.reason().map(PoolError::Cancelled));
    match error {
        Some(error) if collected.len() < expected => Err(Interrupted {
            partial: collected,
            error,
        }),
        _ => Ok(collected),
    }
}
