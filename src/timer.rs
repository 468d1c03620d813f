//! # Sleep Timer
//!
//! One timer thread services every sleeping fiber: a min-heap of deadlines
//! guarded by a mutex, and a condition variable that sleeps exactly until
//! the earliest deadline (or until a new, earlier entry arrives).
//!
//! Entries are cancellable: interrupting a sleeping fiber cancels its
//! timer so the heap does not fire resumptions into dead gates.

use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Callback run on the timer thread when an entry fires. Kept tiny by
/// convention: resumptions immediately re-submit to the executor.
pub(crate) type TimerCallback = Box<dyn FnOnce() + Send>;

/// Handle for cancelling a scheduled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TimerKey(u64);

/// Shared handle to the timer thread.
#[derive(Clone)]
pub(crate) struct Timer {
    shared: Arc<TimerShared>,
}

struct TimerShared {
    queue: Mutex<TimerQueue>,
    cond: Condvar,
    shutdown: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    cancelled: HashSet<u64>,
    next_key: u64,
}

struct TimerEntry {
    deadline: Instant,
    key: u64,
    callback: Option<TimerCallback>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.key == other.key
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, the earliest deadline must
        // surface first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl Timer {
    /// Start the timer thread.
    pub(crate) fn start() -> Self {
        let shared = Arc::new(TimerShared {
            queue: Mutex::new(TimerQueue {
                heap: BinaryHeap::new(),
                cancelled: HashSet::new(),
                next_key: 1,
            }),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            thread: Mutex::new(None),
        });

        let loop_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("filament-timer".to_string())
            .spawn(move || timer_loop(loop_shared))
            .expect("failed to spawn timer thread");
        *shared.thread.lock() = Some(handle);

        Self { shared }
    }

    /// Schedule `callback` to run at `deadline`. A deadline in the past
    /// fires on the next timer-thread wakeup, which is immediate.
    pub(crate) fn schedule(&self, deadline: Instant, callback: TimerCallback) -> TimerKey {
        let key = {
            let mut queue = self.shared.queue.lock();
            let key = queue.next_key;
            queue.next_key += 1;
            queue.heap.push(TimerEntry {
                deadline,
                key,
                callback: Some(callback),
            });
            key
        };
        self.shared.cond.notify_one();
        TimerKey(key)
    }

    /// Cancel a scheduled entry. Safe to call after the entry has fired.
    pub(crate) fn cancel(&self, key: TimerKey) {
        self.shared.queue.lock().cancelled.insert(key.0);
        self.shared.cond.notify_one();
    }

    /// Stop the timer thread; remaining entries never fire.
    pub(crate) fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.cond.notify_one();
        if let Some(handle) = self.shared.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn timer_loop(shared: Arc<TimerShared>) {
    let mut queue = shared.queue.lock();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }

        let now = Instant::now();
        let mut due: Vec<TimerCallback> = Vec::new();
        while let Some(top) = queue.heap.peek() {
            if top.deadline > now {
                break;
            }
            let mut entry = queue.heap.pop().expect("peeked entry vanished");
            if queue.cancelled.remove(&entry.key) {
                continue;
            }
            if let Some(callback) = entry.callback.take() {
                due.push(callback);
            }
        }

        if !due.is_empty() {
            drop(queue);
            for callback in due {
                callback();
            }
            queue = shared.queue.lock();
            continue;
        }

        match queue.heap.peek() {
            Some(top) => {
                let wait = top.deadline.saturating_duration_since(Instant::now());
                self::wait_for(&shared.cond, &mut queue, wait);
            }
            None => shared.cond.wait(&mut queue),
        }
    }
}

fn wait_for(
    cond: &Condvar,
    guard: &mut parking_lot::MutexGuard<'_, TimerQueue>,
    duration: std::time::Duration,
) {
    if duration.is_zero() {
        return;
    }
    cond.wait_for(guard, duration);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[test]
    fn test_timer_fires() {
        let timer = Timer::start();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        timer.schedule(
            Instant::now() + Duration::from_millis(10),
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );

        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        timer.shutdown();
    }

    #[test]
    fn test_timer_fires_in_deadline_order() {
        let timer = Timer::start();
        let order: Arc<StdMutex<Vec<u32>>> = Arc::new(StdMutex::new(Vec::new()));

        let base = Instant::now();
        for (offset_ms, tag) in [(30_u64, 3_u32), (10, 1), (20, 2)] {
            let o = order.clone();
            timer.schedule(
                base + Duration::from_millis(offset_ms),
                Box::new(move || {
                    o.lock().unwrap().push(tag);
                }),
            );
        }

        thread::sleep(Duration::from_millis(150));
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        timer.shutdown();
    }

    #[test]
    fn test_past_deadline_fires_promptly() {
        let timer = Timer::start();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        timer.schedule(
            Instant::now(),
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );

        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        timer.shutdown();
    }

    #[test]
    fn test_cancelled_entry_does_not_fire() {
        let timer = Timer::start();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        let key = timer.schedule(
            Instant::now() + Duration::from_millis(30),
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        timer.cancel(key);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.shutdown();
    }
}
