//! # Work-Stealing Executor
//!
//! The executor owns the worker threads that drive fiber interpretation.
//! Work items are opaque jobs (a fiber continuation packaged as a closure).
//!
//! ## Design
//!
//! - A global injection queue receives all submissions.
//! - Each worker owns a local FIFO deque and steals batches from the
//!   injector, then from its siblings, when its own deque runs dry.
//! - Idle workers park on a condition variable with a bounded timeout, so
//!   a submission never waits longer than the park interval even if a
//!   wakeup is lost.
//!
//! The progress guarantee is the only hard requirement: every submitted
//! job eventually runs unless the executor is shut down first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use parking_lot::{Condvar, Mutex};

/// A unit of work: one fiber continuation.
pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// How long an idle worker parks before re-checking the queues.
const IDLE_PARK: Duration = Duration::from_millis(10);

/// Work-stealing executor.
pub(crate) struct Executor {
    shared: Arc<ExecutorShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct ExecutorShared {
    injector: Injector<Job>,
    stealers: Vec<Stealer<Job>>,
    shutdown: AtomicBool,
    idle_mutex: Mutex<()>,
    idle_cond: Condvar,
}

impl Executor {
    /// Start `num_workers` worker threads.
    pub(crate) fn start(num_workers: usize) -> Self {
        let mut locals = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let deque = Deque::new_fifo();
            stealers.push(deque.stealer());
            locals.push(deque);
        }

        let shared = Arc::new(ExecutorShared {
            injector: Injector::new(),
            stealers,
            shutdown: AtomicBool::new(false),
            idle_mutex: Mutex::new(()),
            idle_cond: Condvar::new(),
        });

        let threads = locals
            .into_iter()
            .enumerate()
            .map(|(id, local)| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("filament-worker-{}", id))
                    .spawn(move || worker_loop(id, local, shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            shared,
            threads: Mutex::new(threads),
        }
    }

    /// Submit a job. Returns false if the executor has shut down (the job
    /// is dropped).
    pub(crate) fn submit(&self, job: Job) -> bool {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return false;
        }
        self.shared.injector.push(job);
        // Pairs with the empty-check the worker performs under the idle
        // lock: either the worker sees the job, or it is already waiting
        // and the notification reaches it.
        drop(self.shared.idle_mutex.lock());
        self.shared.idle_cond.notify_all();
        true
    }

    /// Stop the workers and join their threads. Pending jobs are dropped.
    pub(crate) fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        drop(self.shared.idle_mutex.lock());
        self.shared.idle_cond.notify_all();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }

    /// Whether shutdown has been requested.
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

fn worker_loop(id: usize, local: Deque<Job>, shared: Arc<ExecutorShared>) {
    tracing::debug!(worker = id, "worker started");
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        if let Some(job) = find_work(&local, &shared) {
            job();
            continue;
        }

        let mut guard = shared.idle_mutex.lock();
        if shared.shutdown.load(Ordering::Acquire) || !shared.injector.is_empty() {
            continue;
        }
        shared.idle_cond.wait_for(&mut guard, IDLE_PARK);
    }
    tracing::debug!(worker = id, "worker stopped");
}

/// Search order: local deque, then a batch from the global injector, then
/// stealing from sibling workers.
fn find_work(local: &Deque<Job>, shared: &ExecutorShared) -> Option<Job> {
    if let Some(job) = local.pop() {
        return Some(job);
    }

    loop {
        match shared.injector.steal_batch_and_pop(local) {
            Steal::Success(job) => return Some(job),
            Steal::Empty => break,
            Steal::Retry => continue,
        }
    }

    for stealer in &shared.stealers {
        loop {
            match stealer.steal() {
                Steal::Success(job) => return Some(job),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }

    None
}
