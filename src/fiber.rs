//! # Fibers
//!
//! Lightweight, cooperatively-scheduled tasks, each interpreting one effect
//! tree. This module holds the state shared between a fiber and the rest of
//! the world: its status, the observers awaiting its exit, and the pending
//! interruption slot. The single-owner interpreter state itself lives in
//! [`crate::interpreter`] and travels with whichever worker currently runs
//! the fiber.
//!
//! ## Suspension and resumption
//!
//! When a fiber suspends (async registration, sleep, join), its interpreter
//! state is parked inside a [`ResumeGate`]: a single-fire cell. Both the
//! asynchronous resumption callback and an interruption request race through
//! the same gate, so exactly one of them continues the fiber; the loser is
//! discarded silently.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::{Canceler, Effect, Node};
use crate::exit::{Cause, Defect, ExitResult, Interruption, UntypedExit};
use crate::interpreter::FiberRuntime;

/// Unique identifier for a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(pub(crate) u64);

impl FiberId {
    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.0)
    }
}

/// Global fiber ID counter.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique fiber ID.
pub(crate) fn next_fiber_id() -> FiberId {
    FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
}

// ============================================================================
// Uncaught-error reporting
// ============================================================================

/// Sink for errors that no observer will ever see: unobserved fiber
/// failures and failures raised by finalizers.
pub type ErrorHandler = Arc<dyn Fn(FiberError) + Send + Sync>;

/// Callback invoked with a fiber's exit once it terminates.
pub(crate) type Observer = Box<dyn FnOnce(UntypedExit) + Send>;

/// A type-erased typed-error payload delivered to an [`ErrorHandler`].
#[derive(Clone)]
pub struct ErrorPayload(pub(crate) crate::effect::BoxValue);

impl ErrorPayload {
    /// Downcast the payload to the concrete error type it was raised with.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref()
    }
}

impl fmt::Debug for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorPayload(..)")
    }
}

/// An error diverted to a fiber's uncaught-error handler.
#[derive(Debug, Clone)]
pub enum FiberError {
    /// A typed failure terminated a fiber that had no observers.
    Unobserved(ErrorPayload),
    /// A defect terminated a fiber that had no observers.
    Defect(Defect),
    /// A finalizer raised a typed failure while another outcome was
    /// propagating; the propagating outcome was kept.
    FinalizerFailed(ErrorPayload),
    /// A finalizer defected; the propagating outcome was kept.
    FinalizerDefect(Defect),
}

impl fmt::Display for FiberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberError::Unobserved(_) => f.write_str("unobserved fiber failure"),
            FiberError::Defect(d) => write!(f, "unobserved fiber defect: {}", d),
            FiberError::FinalizerFailed(_) => f.write_str("finalizer failed"),
            FiberError::FinalizerDefect(d) => write!(f, "finalizer defect: {}", d),
        }
    }
}

// ============================================================================
// Shared fiber state
// ============================================================================

/// Fiber status, guarded by the state mutex.
pub(crate) enum Status {
    /// Running (or queued to run) on a worker.
    Executing,
    /// Parked on a resume gate, waiting for an async event.
    Suspended {
        gate: Arc<ResumeGate>,
        canceler: Option<Canceler>,
        /// False while the fiber suspended inside a masked region
        /// (finalizers); interruption is then deferred, not delivered.
        interruptible: bool,
    },
    /// Terminated; the exit is retained for late joiners.
    Done(UntypedExit),
}

pub(crate) struct FiberState {
    pub(crate) status: Status,
    pub(crate) observers: Vec<Observer>,
    /// Pending interruption, consumed at the next preemption point.
    pub(crate) interrupt: Option<Interruption>,
}

/// State shared between a fiber and every party holding its handle.
pub(crate) struct FiberShared {
    id: FiberId,
    handler: ErrorHandler,
    /// Latch: set once interruption has ever been requested.
    interrupted: AtomicBool,
    state: Mutex<FiberState>,
}

impl FiberShared {
    pub(crate) fn new(handler: ErrorHandler) -> Arc<Self> {
        Arc::new(Self {
            id: next_fiber_id(),
            handler,
            interrupted: AtomicBool::new(false),
            state: Mutex::new(FiberState {
                status: Status::Executing,
                observers: Vec::new(),
                interrupt: None,
            }),
        })
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    /// Request interruption. Idempotent: the first cause wins, later
    /// requests are ignored. If the fiber is suspended and interruptible,
    /// delivery is immediate: the stored canceler runs and the resume gate
    /// fires with the interruption.
    pub(crate) fn interrupt(&self, cause: Interruption) {
        let mut st = self.state.lock();
        if self.interrupted.load(Ordering::SeqCst) || matches!(st.status, Status::Done(_)) {
            return;
        }
        self.interrupted.store(true, Ordering::SeqCst);
        st.interrupt = Some(cause.clone());
        tracing::trace!(fiber = %self.id, "interruption requested");

        if let Status::Suspended {
            gate,
            canceler,
            interruptible: true,
        } = &mut st.status
        {
            let gate = gate.clone();
            let canceler = canceler.take();
            gate.mark_interrupt();
            drop(st);
            if let Some(cancel) = canceler {
                cancel();
            }
            gate.fire(UntypedExit::Interrupted(Cause::Interrupt(cause)));
        }
    }

    /// Consume a pending interruption, if any. Fast path is a single
    /// atomic load.
    pub(crate) fn take_interrupt(&self) -> Option<Interruption> {
        if !self.interrupted.load(Ordering::SeqCst) {
            return None;
        }
        self.state.lock().interrupt.take()
    }

    /// Register an observer for this fiber's exit. Fires immediately if the
    /// fiber is already done.
    pub(crate) fn add_observer(&self, observer: Observer) {
        let mut st = self.state.lock();
        match &st.status {
            Status::Done(exit) => {
                let exit = exit.clone();
                drop(st);
                observer(exit);
            }
            _ => st.observers.push(observer),
        }
    }

    /// Park an interpreter state on a fresh resume gate.
    ///
    /// Fails (returning the state) when an interruption is already pending
    /// and the fiber is interruptible: the caller must halt instead of
    /// suspending. The pending-check and the status transition happen under
    /// one lock so an interruption cannot slip between them.
    pub(crate) fn try_park(
        &self,
        fiber: Box<FiberRuntime>,
        interruptible: bool,
    ) -> Result<Arc<ResumeGate>, (Box<FiberRuntime>, Interruption)> {
        let gate = ResumeGate::new();
        let mut st = self.state.lock();
        if interruptible {
            if let Some(cause) = st.interrupt.take() {
                drop(st);
                return Err((fiber, cause));
            }
        }
        st.status = Status::Suspended {
            gate: gate.clone(),
            canceler: None,
            interruptible,
        };
        *gate.parked.lock() = Some(fiber);
        Ok(gate)
    }

    /// Attach the canceler returned by an async registration to the current
    /// suspension. If the fiber already left that suspension through an
    /// interruption, the async operation is still in flight and the
    /// canceler runs right away.
    pub(crate) fn attach_canceler(&self, gate: &Arc<ResumeGate>, canceler: Canceler) {
        let mut st = self.state.lock();
        if let Status::Suspended {
            gate: current,
            canceler: slot,
            ..
        } = &mut st.status
        {
            if Arc::ptr_eq(current, gate) {
                *slot = Some(canceler);
                return;
            }
        }
        drop(st);
        if gate.interrupt_fired() {
            canceler();
        }
    }

    /// Transition to `Done`, report unobserved failures, and notify
    /// observers. The handler runs before observers so a joiner cannot
    /// observe the exit before the handler has seen it.
    pub(crate) fn finish(&self, exit: UntypedExit) {
        let observers = {
            let mut st = self.state.lock();
            st.status = Status::Done(exit.clone());
            std::mem::take(&mut st.observers)
        };
        if observers.is_empty() {
            match &exit {
                UntypedExit::Failed(error) => {
                    self.report(FiberError::Unobserved(ErrorPayload(error.clone())));
                }
                UntypedExit::Interrupted(Cause::Defect(defect)) => {
                    self.report(FiberError::Defect(defect.clone()));
                }
                _ => {}
            }
        }
        tracing::trace!(fiber = %self.id, "fiber done");
        for observer in observers {
            observer(exit.clone());
        }
    }

    /// Divert an error to the fiber's uncaught-error handler.
    pub(crate) fn report(&self, error: FiberError) {
        (self.handler)(error);
    }

    /// The fiber's exit, if it has terminated.
    pub(crate) fn poll_exit(&self) -> Option<UntypedExit> {
        match &self.state.lock().status {
            Status::Done(exit) => Some(exit.clone()),
            _ => None,
        }
    }
}

// ============================================================================
// Resume gates
// ============================================================================

/// Single-fire resume cell for a suspended fiber.
///
/// The parked interpreter state is stored here; whoever fires first
/// (async callback, timer, joined fiber's observer, or an interruption)
/// takes the state and reschedules it. Extra invocations are discarded.
pub(crate) struct ResumeGate {
    fired: AtomicBool,
    /// Set when an interruption won (or is about to win) the gate; lets a
    /// late-attached canceler know the async operation must be cancelled.
    interrupted: AtomicBool,
    parked: Mutex<Option<Box<FiberRuntime>>>,
}

impl ResumeGate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            fired: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            parked: Mutex::new(None),
        })
    }

    pub(crate) fn mark_interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn interrupt_fired(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Fire the gate with an exit: take the parked fiber, mark it
    /// executing, and reschedule it on its runtime. Returns whether this
    /// call won the gate.
    pub(crate) fn fire(&self, exit: UntypedExit) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        let fiber = self
            .parked
            .lock()
            .take()
            .expect("resume gate fired with no parked fiber");
        {
            let mut st = fiber.shared().state.lock();
            if matches!(st.status, Status::Suspended { .. }) {
                st.status = Status::Executing;
            }
        }
        fiber.reschedule(exit);
        true
    }
}

/// Crate-internal resumption handle handed to async registrations.
#[derive(Clone)]
pub(crate) struct ResumeHandle {
    gate: Arc<ResumeGate>,
}

impl ResumeHandle {
    pub(crate) fn new(gate: Arc<ResumeGate>) -> Self {
        Self { gate }
    }

    pub(crate) fn fire(&self, exit: UntypedExit) -> bool {
        self.gate.fire(exit)
    }
}

/// Typed resumption callback for [`Effect::async_`].
pub struct Resume<E, A> {
    handle: ResumeHandle,
    _marker: PhantomData<fn(E, A)>,
}

impl<E, A> Clone for Resume<E, A> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E, A> Resume<E, A>
where
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    pub(crate) fn new(handle: ResumeHandle) -> Self {
        Self {
            handle,
            _marker: PhantomData,
        }
    }

    /// Resume the suspended fiber with an exit. At most one invocation
    /// wins; returns whether this call did.
    pub fn resume(&self, result: ExitResult<E, A>) -> bool {
        self.handle.fire(result.into_untyped())
    }

    /// Resume with a value.
    pub fn succeed(&self, value: A) -> bool {
        self.resume(ExitResult::Completed(value))
    }

    /// Resume with a typed failure.
    pub fn fail(&self, error: E) -> bool {
        self.resume(ExitResult::Failed(error))
    }
}

// ============================================================================
// Fiber handles
// ============================================================================

/// Erased fiber handle, as produced by the interpreter's fork step.
#[derive(Clone)]
pub(crate) struct UntypedFiber(pub(crate) Arc<FiberShared>);

/// A handle to a running fiber.
///
/// Cheap to clone; holding a handle does not keep the fiber running or
/// prevent it from completing.
pub struct Fiber<E, A> {
    shared: Arc<FiberShared>,
    _marker: PhantomData<fn() -> (E, A)>,
}

impl<E, A> Clone for Fiber<E, A> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E, A> fmt::Debug for Fiber<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fiber").field(&self.shared.id).finish()
    }
}

impl<E, A> Fiber<E, A>
where
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    pub(crate) fn from_untyped(untyped: UntypedFiber) -> Self {
        Self {
            shared: untyped.0,
            _marker: PhantomData,
        }
    }

    pub(crate) fn shared(&self) -> Arc<FiberShared> {
        self.shared.clone()
    }

    /// The fiber's unique id.
    pub fn id(&self) -> FiberId {
        self.shared.id
    }

    /// Suspend until this fiber terminates, then propagate its outcome:
    /// its value, its typed failure, or its interruption/defect.
    pub fn join(&self) -> Effect<E, A> {
        Effect::from_node(Node::Join(self.shared.clone()))
    }

    /// Request interruption of this fiber. Completes once delivery is
    /// queued; it does not wait for the fiber to terminate.
    pub fn interrupt(&self) -> Effect<E, ()> {
        Effect::from_node(Node::Interrupt {
            target: self.shared.clone(),
            cause: Interruption::new(),
        })
    }

    /// Like [`Fiber::interrupt`], with a reason retained in the cause.
    pub fn interrupt_with(&self, reason: impl Into<String>) -> Effect<E, ()> {
        Effect::from_node(Node::Interrupt {
            target: self.shared.clone(),
            cause: Interruption::with_reason(reason),
        })
    }

    /// Suspend until this fiber terminates and produce its [`ExitResult`]
    /// without propagating it; interruption and defects of the target are
    /// reified into the result rather than terminating the caller.
    pub fn wait(&self) -> Effect<E, ExitResult<E, A>> {
        let shared = self.shared.clone();
        Effect::async_(move |resume: Resume<E, ExitResult<E, A>>| {
            shared.add_observer(Box::new(move |exit| {
                resume.succeed(ExitResult::from_untyped(exit));
            }));
            None
        })
    }

    /// Non-blocking check of the fiber's exit.
    pub fn poll(&self) -> Option<ExitResult<E, A>> {
        self.shared.poll_exit().map(ExitResult::from_untyped)
    }
}
