//! Worker Pool
//!
//! A fixed set of OS threads pulling tasks from one [`BoundedQueue`]. The
//! kernel only sees the [`ThreadPool`] trait so hosts can plug in their own
//! executor.
//!
//! Stopping is "stop accepting, drain what is queued": the queue is shut down,
//! workers finish the tasks already queued and are then joined.
//!
//! The first external `stop` joins the workers; later callers wait for that
//! join to finish. A task calling `stop` on its own pool only shuts the queue
//! and returns, since waiting there would hold up the join it waits for.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::config::PoolConfig;
use crate::error::{KernelError, KernelResult};
use crate::queue::BoundedQueue;

/// A unit of work executed on a worker thread
pub type Task = Box<dyn FnOnce() + Send + 'static>;

// ─────────────────────────────────────────────────────────────────────────────
// Thread Pool Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Executor used by the kernel to run plugin callbacks off the control thread
pub trait ThreadPool: Send + Sync {
    /// Queue a task for execution
    ///
    /// Returns `false` when the pool is shutting down and the task was dropped.
    fn submit(&self, task: Task) -> bool;

    /// Stop accepting tasks and join the workers
    ///
    /// Must be idempotent and safe to call concurrently.
    fn stop(&self);

    /// Whether the pool still accepts tasks
    fn is_running(&self) -> bool;

    /// Number of worker threads
    fn worker_count(&self) -> usize;
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker Pool
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed-size pool of worker threads fed by a bounded task queue
pub struct WorkerPool {
    queue: Arc<BoundedQueue<Task>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_ids: Vec<ThreadId>,
    /// Workers that have not returned yet
    live: Arc<AtomicUsize>,
    running: AtomicBool,
    /// Set by the caller that performs the join
    stop_started: AtomicBool,
    /// True once the join has completed
    stopped: Mutex<bool>,
    stopped_cv: Condvar,
    size: usize,
    #[cfg(test)]
    teardowns: AtomicUsize,
}

impl WorkerPool {
    /// Spawn `thread_count` workers sharing a queue of `task_limit` tasks
    pub fn new(task_limit: usize, thread_count: usize) -> KernelResult<Self> {
        if task_limit == 0 {
            return Err(KernelError::Construction(
                "task queue capacity must be greater than zero".to_string(),
            ));
        }
        if thread_count == 0 {
            return Err(KernelError::Construction(
                "worker pool needs at least one thread".to_string(),
            ));
        }

        let queue = Arc::new(BoundedQueue::new(task_limit));
        let live = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(thread_count);

        for id in 0..thread_count {
            let worker_queue = Arc::clone(&queue);
            let worker_live = Arc::clone(&live);
            live.fetch_add(1, Ordering::SeqCst);
            let spawned = thread::Builder::new()
                .name(format!("micro-kernel-worker-{}", id))
                .spawn(move || run_worker(id, worker_queue, worker_live));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    live.fetch_sub(1, Ordering::SeqCst);
                    queue.shutdown();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(KernelError::Construction(format!(
                        "failed to spawn worker {}: {}",
                        id, e
                    )));
                }
            }
        }

        tracing::info!(
            workers = thread_count,
            task_limit,
            "Worker pool started"
        );

        let worker_ids = workers.iter().map(|h| h.thread().id()).collect();

        Ok(Self {
            queue,
            workers: Mutex::new(workers),
            worker_ids,
            live,
            running: AtomicBool::new(true),
            stop_started: AtomicBool::new(false),
            stopped: Mutex::new(false),
            stopped_cv: Condvar::new(),
            size: thread_count,
            #[cfg(test)]
            teardowns: AtomicUsize::new(0),
        })
    }

    /// Build a pool from configuration
    pub fn with_config(config: &PoolConfig) -> KernelResult<Self> {
        config.validate()?;
        Self::new(config.task_queue_capacity, config.resolved_worker_threads())
    }

    /// Pool with a queue of 100 tasks and one worker per hardware thread
    pub fn with_defaults() -> KernelResult<Self> {
        Self::with_config(&PoolConfig::default())
    }

    /// Number of tasks waiting for a worker
    pub fn pending(&self) -> usize {
        self.queue.count()
    }

    /// Number of worker threads that have not exited yet
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn is_worker_thread(&self) -> bool {
        let current = thread::current().id();
        self.worker_ids.contains(&current)
    }

    fn refuse_tasks(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue.shutdown();
    }

    fn shutdown_workers(&self) {
        #[cfg(test)]
        self.teardowns.fetch_add(1, Ordering::SeqCst);

        self.refuse_tasks();

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                tracing::warn!("Worker thread terminated abnormally");
            }
        }

        *self.stopped.lock() = true;
        self.stopped_cv.notify_all();
        tracing::info!(workers = self.size, "Worker pool stopped");
    }
}

impl ThreadPool for WorkerPool {
    fn submit(&self, task: Task) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            tracing::trace!("Task dropped, pool is stopping");
            return false;
        }

        match self.queue.push(task) {
            Ok(()) => true,
            Err(_) => {
                tracing::trace!("Task dropped, queue shut down");
                false
            }
        }
    }

    fn stop(&self) {
        // A worker cannot wait for its own join; it exits once the queue drains.
        if self.is_worker_thread() {
            self.refuse_tasks();
            return;
        }

        if !self.stop_started.swap(true, Ordering::SeqCst) {
            self.shutdown_workers();
            return;
        }

        let mut stopped = self.stopped.lock();
        while !*stopped {
            self.stopped_cv.wait(&mut stopped);
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn worker_count(&self) -> usize {
        self.size
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.size)
            .field("running", &self.is_running())
            .field("queue", &self.queue)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker Thread
// ─────────────────────────────────────────────────────────────────────────────

fn run_worker(id: usize, queue: Arc<BoundedQueue<Task>>, live: Arc<AtomicUsize>) {
    tracing::debug!(worker = id, "Worker started");

    while let Some(task) = queue.pop() {
        tracing::trace!(worker = id, "Running task");
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            tracing::error!(
                worker = id,
                panic = %panic_message(payload.as_ref()),
                "Task panicked"
            );
        }
    }

    live.fetch_sub(1, Ordering::SeqCst);
    tracing::debug!(worker = id, "Worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
