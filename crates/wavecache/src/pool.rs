//! Fixed-size pool of decimation worker threads
//!
//! Workers are spawned once and handed out to at most one holder at a time;
//! oversubscribed acquires queue FIFO. A released worker goes straight to the
//! oldest queued waiter, still claimed, so fairness does not depend on wakeup
//! order.
//!
//! A [`Worker`] is an owned value: acquiring moves it out of the pool and
//! releasing moves it back, so two callers can never hold the same worker.
//! Holders that can be cancelled mid-flight (a request future dropped at an
//! await) use [`WorkerPool::checkout`] instead, which returns the worker on
//! drop. The queue itself is unbounded; sustained oversubscription backs up
//! there and is logged rather than rejected.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::thread;

use tokio::sync::oneshot;

use crate::worker::{worker_loop, ReplyMessage, TaskMessage, WorkerJob};

/// Handle to one pool worker thread.
#[derive(Debug)]
pub struct Worker {
    id: usize,
    job_tx: crossbeam::channel::Sender<WorkerJob>,
}

impl Worker {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Queue a task on this worker and return the reply channel.
    ///
    /// If the worker thread has exited, the returned receiver errors on
    /// await; the caller maps that to a transport failure.
    pub fn submit(&self, task: TaskMessage) -> oneshot::Receiver<ReplyMessage> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.job_tx.send(WorkerJob {
            task,
            reply: reply_tx,
        });
        reply_rx
    }
}

struct PoolState {
    free: Vec<Worker>,
    waiters: VecDeque<oneshot::Sender<Worker>>,
}

/// Fixed pool of decimation workers with FIFO queuing of acquires.
pub struct WorkerPool {
    state: Mutex<PoolState>,
    num_workers: usize,
    _handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn a pool of `num_workers` worker threads (floored to 1).
    pub fn new(num_workers: usize) -> Self {
        let num_workers = num_workers.max(1);
        let mut free = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);

        for id in 0..num_workers {
            let (job_tx, job_rx) = crossbeam::channel::unbounded();
            let handle = thread::Builder::new()
                .name(format!("wave-worker-{}", id))
                .spawn(move || worker_loop(id, job_rx))
                .expect("Failed to spawn wavecache worker thread");
            handles.push(handle);
            free.push(Worker { id, job_tx });
        }

        log::info!("Worker pool started with {} workers", num_workers);

        WorkerPool {
            state: Mutex::new(PoolState {
                free,
                waiters: VecDeque::new(),
            }),
            num_workers,
            _handles: handles,
        }
    }

    /// Spawn one worker per available hardware thread.
    pub fn with_hardware_concurrency() -> Self {
        let n = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::new(n)
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Take a worker from the pool, waiting FIFO behind earlier acquires if
    /// none is free.
    pub async fn acquire(&self) -> Worker {
        let waiter = {
            let mut state = self.state.lock().unwrap();
            if let Some(worker) = state.free.pop() {
                return worker;
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            let depth = state.waiters.len();
            if depth > self.num_workers * 4 {
                log::warn!("worker pool oversubscribed: {} acquires queued", depth);
            } else {
                log::debug!("worker pool busy, queued acquire (depth {})", depth);
            }
            rx
        };

        // The sender sits in the pool's own queue and the pool outlives this
        // borrow, so the channel cannot close before release() serves it.
        waiter
            .await
            .expect("worker pool dropped while an acquire was queued")
    }

    /// Take a worker as a guard that releases itself when dropped.
    ///
    /// This is the cancellation-safe form of [`acquire`](Self::acquire):
    /// if the holding future is dropped at a suspension point, the worker
    /// still returns to the pool instead of taking its thread down with it.
    pub async fn checkout(&self) -> PooledWorker<'_> {
        let worker = self.acquire().await;
        PooledWorker {
            pool: self,
            worker: Some(worker),
        }
    }

    /// Return a worker to the pool.
    ///
    /// The oldest still-live waiter receives this exact worker directly;
    /// waiters whose futures were dropped are skipped.
    pub fn release(&self, worker: Worker) {
        let mut state = self.state.lock().unwrap();
        let mut worker = worker;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(worker) {
                Ok(()) => return,
                Err(returned) => worker = returned,
            }
        }
        state.free.push(worker);
    }
}

/// A worker checked out of the pool, released back on drop.
pub struct PooledWorker<'a> {
    pool: &'a WorkerPool,
    worker: Option<Worker>,
}

impl std::ops::Deref for PooledWorker<'_> {
    type Target = Worker;

    fn deref(&self) -> &Worker {
        // Only None after Drop has taken it
        self.worker.as_ref().expect("worker already released")
    }
}

impl Drop for PooledWorker<'_> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.release(worker);
        }
    }
}
