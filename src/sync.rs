//! # Shared Cells
//!
//! The only two shared mutables fibers communicate through:
//!
//! - [`IORef`]: a mutable cell whose operations are effects; `modify` is
//!   atomic with respect to every other operation on the same ref.
//! - [`Promise`]: a write-once cell. `complete`/`fail`/`done` report
//!   whether the call won the race to fill it; `get` suspends until the
//!   cell is full and is interruptible while waiting.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::{Canceler, Effect};
use crate::exit::{ExitResult, UntypedExit};
use crate::fiber::Observer;

// ============================================================================
// IORef
// ============================================================================

/// A mutable cell operated on through effects.
///
/// All mutation is sequenced through the interpreter; each operation takes
/// the cell's lock for its whole closure, so `modify` is linearizable per
/// ref across fibers.
pub struct IORef<A> {
    id: u64,
    cell: Arc<Mutex<A>>,
}

impl<A> Clone for IORef<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cell: self.cell.clone(),
        }
    }
}

impl<A> fmt::Debug for IORef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IORef({})", self.id)
    }
}

/// Global IORef ID counter.
static NEXT_IOREF_ID: AtomicU64 = AtomicU64::new(1);

impl<A> IORef<A>
where
    A: Clone + Send + 'static,
{
    /// Create a cell directly, outside the effect layer.
    pub fn new(value: A) -> Self {
        Self {
            id: NEXT_IOREF_ID.fetch_add(1, Ordering::Relaxed),
            cell: Arc::new(Mutex::new(value)),
        }
    }

    /// Create a cell as an effect.
    pub fn make<E>(value: A) -> Effect<E, IORef<A>>
    where
        E: Clone + Send + 'static,
    {
        Effect::sync(move || IORef::new(value))
    }

    /// Read the current value.
    pub fn read<E>(&self) -> Effect<E, A>
    where
        E: Clone + Send + 'static,
    {
        let cell = self.cell.clone();
        Effect::sync(move || cell.lock().clone())
    }

    /// Replace the value.
    pub fn write<E>(&self, value: A) -> Effect<E, ()>
    where
        E: Clone + Send + 'static,
    {
        let cell = self.cell.clone();
        Effect::sync(move || {
            *cell.lock() = value;
        })
    }

    /// Apply a function to the value atomically; produces the new value.
    pub fn update<E, F>(&self, f: F) -> Effect<E, A>
    where
        E: Clone + Send + 'static,
        F: FnOnce(A) -> A + Send + 'static,
    {
        let cell = self.cell.clone();
        Effect::sync(move || {
            let mut guard = cell.lock();
            let next = f(guard.clone());
            *guard = next.clone();
            next
        })
    }

    /// Atomically compute a result and a new value from the current one.
    pub fn modify<E, B, F>(&self, f: F) -> Effect<E, B>
    where
        E: Clone + Send + 'static,
        B: Clone + Send + 'static,
        F: FnOnce(A) -> (B, A) + Send + 'static,
    {
        let cell = self.cell.clone();
        Effect::sync(move || {
            let mut guard = cell.lock();
            let (out, next) = f(guard.clone());
            *guard = next;
            out
        })
    }
}

// ============================================================================
// Promise
// ============================================================================

enum PromiseState {
    Empty {
        waiters: Vec<(u64, Observer)>,
        next_waiter: u64,
    },
    Full(UntypedExit),
}

struct PromiseCell {
    state: Mutex<PromiseState>,
}

impl PromiseCell {
    /// Fill the cell exactly once; waiters are notified outside the lock.
    /// Returns whether this call won.
    fn settle(&self, exit: UntypedExit) -> bool {
        let waiters = {
            let mut state = self.state.lock();
            match &mut *state {
                PromiseState::Full(_) => return false,
                PromiseState::Empty { waiters, .. } => {
                    let taken = std::mem::take(waiters);
                    *state = PromiseState::Full(exit.clone());
                    taken
                }
            }
        };
        for (_, waiter) in waiters {
            waiter(exit.clone());
        }
        true
    }

    fn remove_waiter(&self, key: u64) {
        if let PromiseState::Empty { waiters, .. } = &mut *self.state.lock() {
            waiters.retain(|(id, _)| *id != key);
        }
    }
}

/// A write-once cell carrying an [`ExitResult`].
pub struct Promise<E, A> {
    cell: Arc<PromiseCell>,
    _marker: PhantomData<fn(E) -> A>,
}

impl<E, A> Clone for Promise<E, A> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E, A> fmt::Debug for Promise<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.cell.state.lock() {
            PromiseState::Empty { waiters, .. } => format!("Empty({} waiters)", waiters.len()),
            PromiseState::Full(_) => "Full".to_string(),
        };
        write!(f, "Promise({})", state)
    }
}

impl<E, A> Promise<E, A>
where
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    /// Create an empty promise directly, outside the effect layer.
    pub fn new() -> Self {
        Self {
            cell: Arc::new(PromiseCell {
                state: Mutex::new(PromiseState::Empty {
                    waiters: Vec::new(),
                    next_waiter: 1,
                }),
            }),
            _marker: PhantomData,
        }
    }

    /// Create an empty promise as an effect.
    pub fn make() -> Effect<E, Promise<E, A>> {
        Effect::sync(Promise::new)
    }

    /// Fill the promise with a value. Produces whether this call won.
    pub fn complete(&self, value: A) -> Effect<E, bool> {
        self.done(ExitResult::Completed(value))
    }

    /// Fill the promise with a typed failure. Produces whether this call
    /// won.
    pub fn fail(&self, error: E) -> Effect<E, bool> {
        self.done(ExitResult::Failed(error))
    }

    /// Fill the promise with an arbitrary exit. Produces whether this call
    /// won.
    pub fn done(&self, exit: ExitResult<E, A>) -> Effect<E, bool> {
        let cell = self.cell.clone();
        Effect::sync(move || cell.settle(exit.into_untyped()))
    }

    /// Await the promise: produces the stored value, or propagates the
    /// stored failure/interruption. Interruptible while waiting.
    pub fn get(&self) -> Effect<E, A> {
        let cell = self.cell.clone();
        Effect::async_(move |resume: crate::fiber::Resume<E, A>| {
            let full = {
                let mut state = cell.state.lock();
                match &mut *state {
                    PromiseState::Full(exit) => Some(exit.clone()),
                    PromiseState::Empty {
                        waiters,
                        next_waiter,
                    } => {
                        let key = *next_waiter;
                        *next_waiter += 1;
                        let waiter_resume = resume.clone();
                        waiters.push((
                            key,
                            Box::new(move |exit| {
                                waiter_resume.resume(ExitResult::from_untyped(exit));
                            }),
                        ));
                        let cancel_cell = cell.clone();
                        let canceler: Canceler =
                            Box::new(move || cancel_cell.remove_waiter(key));
                        return Some(canceler);
                    }
                }
            };
            if let Some(exit) = full {
                resume.resume(ExitResult::from_untyped(exit));
            }
            None
        })
    }
}

impl<E, A> Default for Promise<E, A>
where
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
