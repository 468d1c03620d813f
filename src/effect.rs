//! # Effect Values
//!
//! An [`Effect<E, A>`] is an inert description of a computation that may
//! fail with a typed error `E` or produce a value `A`. Nothing happens when
//! an effect is constructed or combined; the runtime interprets the value
//! on a fiber when it is run or forked.
//!
//! ## Design
//!
//! The set of primitives is closed: every constructor lowers to one variant
//! of the crate-private [`Node`] sum, and the interpreter dispatches on that
//! tag. Data flowing between nodes is type-erased into clone-able `Any`
//! boxes; the typed `Effect` facade owns every downcast, so a mismatch is a
//! bug in this crate rather than in user code.
//!
//! ## Laziness contract
//!
//! - [`Effect::now`] is eager: its argument is evaluated at the call site.
//! - [`Effect::point`], [`Effect::sync`] and [`Effect::suspend`] defer their
//!   thunks until interpreted; `suspend` evaluates its thunk exactly once
//!   per interpretation.
//! - A panic inside a deferred thunk is a defect, not a typed failure;
//!   [`Effect::sync_catch`] opts into converting panics to typed failures.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::exit::{Defect, Interruption, Panic, UntypedExit};
use crate::fiber::{ErrorHandler, Fiber, FiberShared, Resume, ResumeHandle, UntypedFiber};

// ============================================================================
// Value erasure
// ============================================================================

/// A value that can cross the type-erased interpreter core: `Any` for the
/// witness downcast, `Send` to migrate between workers, and clone-able so a
/// fiber's exit can be delivered to every observer.
pub(crate) trait ErasedValue: Any + Send {
    fn clone_boxed(&self) -> BoxValue;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any + Send + Clone> ErasedValue for T {
    fn clone_boxed(&self) -> BoxValue {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// A boxed, erased value.
pub(crate) type BoxValue = Box<dyn ErasedValue>;

impl Clone for BoxValue {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

/// Erase a typed value.
pub(crate) fn erase<T: Any + Send + Clone>(value: T) -> BoxValue {
    Box::new(value)
}

/// Recover a typed value. The typed `Effect` facade guarantees the witness;
/// a mismatch here is a bug in this crate.
pub(crate) fn unerase<T: Any + Send + Clone>(value: BoxValue) -> T {
    *value
        .into_any()
        .downcast::<T>()
        .expect("erased value type mismatch")
}

// ============================================================================
// The effect node sum
// ============================================================================

pub(crate) type Thunk = Box<dyn FnOnce() -> BoxValue + Send>;
pub(crate) type CatchThunk = Box<dyn FnOnce() -> Result<BoxValue, BoxValue> + Send>;
pub(crate) type SuspendThunk = Box<dyn FnOnce() -> Node + Send>;
pub(crate) type Kleisli = Box<dyn FnOnce(BoxValue) -> Node + Send>;
pub(crate) type NoticeFn = Box<dyn FnOnce(Option<BoxValue>) -> Node + Send>;
pub(crate) type RegisterFn = Box<dyn FnOnce(ResumeHandle) -> Option<Canceler> + Send>;
pub(crate) type RegisterEffectFn = Box<dyn FnOnce(ResumeHandle) -> Node + Send>;

/// Cancels an in-flight asynchronous registration. Must be safe to call
/// after the operation has already completed.
pub type Canceler = Box<dyn FnOnce() + Send>;

/// The closed sum of effect primitives. One variant per constructor; the
/// interpreter dispatches on this tag.
pub(crate) enum Node {
    Now(BoxValue),
    Point(Thunk),
    Sync(Thunk),
    SyncCatch(CatchThunk),
    Suspend(SuspendThunk),
    Fail(BoxValue),
    Terminate(Defect),
    FlatMap(Box<Node>, Kleisli),
    /// Uniform recovery node: pushes a `Recover` frame for `err` and an
    /// `Apply` frame for `ok`. `attempt`, `redeem` and `map_error` all
    /// lower to this.
    Fold {
        child: Box<Node>,
        ok: Kleisli,
        err: Kleisli,
    },
    Ensuring(Box<Node>, Box<Node>),
    OnError(Box<Node>, NoticeFn),
    Async(RegisterFn),
    AsyncEffect(RegisterEffectFn),
    Fork {
        child: Box<Node>,
        handler: Option<ErrorHandler>,
    },
    Join(Arc<FiberShared>),
    Interrupt {
        target: Arc<FiberShared>,
        cause: Interruption,
    },
    Sleep(Duration),
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Node::Now(_) => "Now",
            Node::Point(_) => "Point",
            Node::Sync(_) => "Sync",
            Node::SyncCatch(_) => "SyncCatch",
            Node::Suspend(_) => "Suspend",
            Node::Fail(_) => "Fail",
            Node::Terminate(_) => "Terminate",
            Node::FlatMap(..) => "FlatMap",
            Node::Fold { .. } => "Fold",
            Node::Ensuring(..) => "Ensuring",
            Node::OnError(..) => "OnError",
            Node::Async(_) => "Async",
            Node::AsyncEffect(_) => "AsyncEffect",
            Node::Fork { .. } => "Fork",
            Node::Join(_) => "Join",
            Node::Interrupt { .. } => "Interrupt",
            Node::Sleep(_) => "Sleep",
        };
        f.write_str(tag)
    }
}

// ============================================================================
// Typed effects
// ============================================================================

/// A lazy, immutable description of a computation.
///
/// `E` is the typed error kind, `A` the success kind. Both must be
/// `Clone + Send + 'static` so results can cross workers and fan out to
/// every observer of a fiber. Running an effect consumes it; loops are
/// expressed by rebuilding (see [`Effect::suspend`]).
pub struct Effect<E, A> {
    node: Node,
    _marker: PhantomData<fn() -> (E, A)>,
}

impl<E, A> fmt::Debug for Effect<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Effect").field(&self.node).finish()
    }
}

impl<E, A> Effect<E, A>
where
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_node(self) -> Node {
        self.node
    }

    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    /// An effect that succeeds with an already-computed value.
    ///
    /// Eager on purpose: the argument is evaluated at the call site.
    pub fn now(value: A) -> Self {
        Self::from_node(Node::Now(erase(value)))
    }

    /// A lazy pure value; the thunk runs when the effect is interpreted.
    pub fn point<F>(thunk: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        Self::from_node(Node::Point(Box::new(move || erase(thunk()))))
    }

    /// A side-effecting thunk. A panic inside the thunk is a defect.
    pub fn sync<F>(thunk: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        Self::from_node(Node::Sync(Box::new(move || erase(thunk()))))
    }

    /// Like [`Effect::sync`], but a panic inside the thunk is caught and
    /// converted into the typed error channel.
    pub fn sync_catch<F>(thunk: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
        E: From<Panic>,
    {
        Self::from_node(Node::SyncCatch(Box::new(move || {
            match catch_unwind(AssertUnwindSafe(thunk)) {
                Ok(a) => Ok(erase(a)),
                Err(payload) => Err(erase(E::from(Panic::from_payload(payload)))),
            }
        })))
    }

    /// Defer the construction of an effect. The thunk runs exactly once per
    /// interpretation; a panic while producing the inner effect is a defect.
    pub fn suspend<F>(thunk: F) -> Self
    where
        F: FnOnce() -> Effect<E, A> + Send + 'static,
    {
        Self::from_node(Node::Suspend(Box::new(move || thunk().node)))
    }

    /// An effect that fails with a typed error.
    pub fn fail(error: E) -> Self {
        Self::from_node(Node::Fail(erase(error)))
    }

    /// An effect that terminates the fiber with a defect. Not recoverable
    /// by [`Effect::attempt`].
    pub fn terminate<T>(error: T) -> Self
    where
        T: std::error::Error + Send + Sync + 'static,
    {
        Self::from_node(Node::Terminate(Defect::Aborted(Arc::new(error))))
    }

    /// An effect that suspends forever; it can only end by interruption.
    pub fn never() -> Self {
        Self::from_node(Node::Async(Box::new(|_resume| None)))
    }

    /// Register an asynchronous operation.
    ///
    /// `register` receives a [`Resume`] handle and may return a canceler to
    /// invoke if the fiber is interrupted while suspended. The handle fires
    /// at most once; extra invocations are discarded.
    pub fn async_<F>(register: F) -> Self
    where
        F: FnOnce(Resume<E, A>) -> Option<Canceler> + Send + 'static,
    {
        Self::from_node(Node::Async(Box::new(move |handle| {
            register(Resume::new(handle))
        })))
    }

    /// Like [`Effect::async_`], but the registration step is itself an
    /// effect, executed on its own fiber while this fiber stays suspended.
    pub fn async_effect<F, E2, B>(register: F) -> Self
    where
        F: FnOnce(Resume<E, A>) -> Effect<E2, B> + Send + 'static,
        E2: Clone + Send + 'static,
        B: Clone + Send + 'static,
    {
        Self::from_node(Node::AsyncEffect(Box::new(move |handle| {
            register(Resume::new(handle)).node
        })))
    }

    // ------------------------------------------------------------------
    // Combinators
    // ------------------------------------------------------------------

    /// Sequence: run `self`, then the effect produced from its value.
    pub fn flat_map<B, F>(self, k: F) -> Effect<E, B>
    where
        B: Clone + Send + 'static,
        F: FnOnce(A) -> Effect<E, B> + Send + 'static,
    {
        Effect::from_node(Node::FlatMap(
            Box::new(self.node),
            Box::new(move |value| k(unerase::<A>(value)).node),
        ))
    }

    /// Map the success value.
    pub fn map<B, F>(self, f: F) -> Effect<E, B>
    where
        B: Clone + Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        self.flat_map(move |a| Effect::now(f(a)))
    }

    /// Replace the success value, discarding the current one.
    pub fn and_then<B>(self, next: Effect<E, B>) -> Effect<E, B>
    where
        B: Clone + Send + 'static,
    {
        self.flat_map(move |_| next)
    }

    /// Reify the typed error channel into the success channel.
    ///
    /// Defects are not caught; they keep unwinding.
    pub fn attempt<E2>(self) -> Effect<E2, Result<A, E>>
    where
        E2: Clone + Send + 'static,
    {
        Effect::from_node(Node::Fold {
            child: Box::new(self.node),
            ok: Box::new(|value| Node::Now(erase(Ok::<A, E>(unerase::<A>(value))))),
            err: Box::new(|error| Node::Now(erase(Err::<A, E>(unerase::<E>(error))))),
        })
    }

    /// Handle both channels at once: `on_err` for typed failures, `on_ok`
    /// for values. Defects are not caught.
    pub fn redeem<E2, B, F, G>(self, on_err: F, on_ok: G) -> Effect<E2, B>
    where
        E2: Clone + Send + 'static,
        B: Clone + Send + 'static,
        F: FnOnce(E) -> Effect<E2, B> + Send + 'static,
        G: FnOnce(A) -> Effect<E2, B> + Send + 'static,
    {
        Effect::from_node(Node::Fold {
            child: Box::new(self.node),
            ok: Box::new(move |value| on_ok(unerase::<A>(value)).node),
            err: Box::new(move |error| on_err(unerase::<E>(error)).node),
        })
    }

    /// Map the typed error channel.
    pub fn map_error<E2, F>(self, f: F) -> Effect<E2, A>
    where
        E2: Clone + Send + 'static,
        F: FnOnce(E) -> E2 + Send + 'static,
    {
        Effect::from_node(Node::Fold {
            child: Box::new(self.node),
            ok: Box::new(Node::Now),
            err: Box::new(move |error| Node::Fail(erase(f(unerase::<E>(error))))),
        })
    }

    /// Witness that the error kind fits into a wider one.
    pub fn widen_error<E2>(self) -> Effect<E2, A>
    where
        E2: From<E> + Clone + Send + 'static,
    {
        self.map_error(E2::from)
    }

    /// Run `finalizer` after `self` on every exit path: success, typed
    /// failure, defect, or interruption. The finalizer runs with
    /// interruption masked; its own failures are reported to the fiber's
    /// uncaught-error handler and never replace the propagating outcome.
    pub fn ensuring<E2, B>(self, finalizer: Effect<E2, B>) -> Effect<E, A>
    where
        E2: Clone + Send + 'static,
        B: Clone + Send + 'static,
    {
        Effect::from_node(Node::Ensuring(
            Box::new(self.node),
            Box::new(finalizer.node),
        ))
    }

    /// Run a handler when `self` settles: `Some(error)` on typed failure,
    /// `None` on success. Skipped on interruption and defects. Same masking
    /// and non-masking rules as [`Effect::ensuring`].
    pub fn on_error<E2, B, F>(self, handler: F) -> Effect<E, A>
    where
        E2: Clone + Send + 'static,
        B: Clone + Send + 'static,
        F: FnOnce(Option<E>) -> Effect<E2, B> + Send + 'static,
    {
        Effect::from_node(Node::OnError(
            Box::new(self.node),
            Box::new(move |error| handler(error.map(unerase::<E>)).node),
        ))
    }

    /// Start `self` on a new fiber and continue with its handle.
    ///
    /// Unobserved failures of the child are reported to the runtime's
    /// default uncaught-error handler.
    pub fn fork(self) -> Effect<E, Fiber<E, A>> {
        Effect::<E, UntypedFiber>::from_node(Node::Fork {
            child: Box::new(self.node),
            handler: None,
        })
        .map(Fiber::from_untyped)
    }

    /// Like [`Effect::fork`], but with a fiber-specific uncaught-error
    /// handler.
    pub fn fork_with<H>(self, handler: H) -> Effect<E, Fiber<E, A>>
    where
        H: Fn(crate::fiber::FiberError) + Send + Sync + 'static,
    {
        Effect::<E, UntypedFiber>::from_node(Node::Fork {
            child: Box::new(self.node),
            handler: Some(Arc::new(handler)),
        })
        .map(Fiber::from_untyped)
    }

    /// Race two effects: the first to settle decides the outcome, the loser
    /// is interrupted, and the loser's finalizers have run before the
    /// result is observed.
    pub fn race(self, that: Effect<E, A>) -> Effect<E, A> {
        self.fork().flat_map(move |left| {
            that.fork().flat_map(move |right| {
                Effect::from_node(Node::Async(Box::new(move |handle| {
                    let won = Arc::new(AtomicBool::new(false));
                    let l = left.shared();
                    let r = right.shared();

                    let arm = |loser: Arc<FiberShared>,
                               won: Arc<AtomicBool>,
                               handle: ResumeHandle| {
                        move |exit: UntypedExit| {
                            if won.swap(true, Ordering::SeqCst) {
                                return;
                            }
                            loser.interrupt(Interruption::with_reason("lost race"));
                            // Publish only once the loser has fully settled,
                            // finalizers included.
                            loser.add_observer(Box::new(move |_| {
                                handle.fire(exit);
                            }));
                        }
                    };

                    l.add_observer(Box::new(arm(r.clone(), won.clone(), handle.clone())));
                    r.add_observer(Box::new(arm(l.clone(), won, handle)));

                    let (cl, cr) = (left.shared(), right.shared());
                    let canceler: Canceler = Box::new(move || {
                        cl.interrupt(Interruption::with_reason("race interrupted"));
                        cr.interrupt(Interruption::with_reason("race interrupted"));
                    });
                    Some(canceler)
                })))
            })
        })
    }
}

impl<E> Effect<E, ()>
where
    E: Clone + Send + 'static,
{
    /// The unit effect.
    pub fn unit() -> Self {
        Self::now(())
    }

    /// Complete after `duration` has elapsed. A zero duration still yields
    /// through the scheduler, which keeps tight loops interruptible.
    pub fn sleep(duration: Duration) -> Self {
        Self::from_node(Node::Sleep(duration))
    }
}

impl<E, A> Effect<E, Result<A, E>>
where
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    /// Submerge a reified error back into the typed error channel; the
    /// inverse of [`Effect::attempt`].
    pub fn absolve(self) -> Effect<E, A> {
        self.flat_map(|result| match result {
            Ok(a) => Effect::now(a),
            Err(e) => Effect::fail(e),
        })
    }
}
