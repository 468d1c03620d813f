//! # The Trampolined Interpreter
//!
//! Each fiber owns one [`FiberRuntime`]: the effect interpreter state that
//! travels with whichever worker is currently running the fiber. The
//! interpreter is a trampoline: every step is one iteration of an explicit
//! loop, so arbitrarily deep effect trees consume heap, never host stack.
//!
//! ## Continuation frames
//!
//! The frame stack separates data flow from error recovery:
//!
//! - `Apply` continues with the produced value (`flat_map`).
//! - `Recover` consumes a typed failure (`attempt`/`redeem`); values pass
//!   it by, defects ignore it.
//! - `Finalize` runs on every exit path (`ensuring`).
//! - `ExitNotice` runs on success and typed failure, and is skipped on
//!   interruption and defects (`on_error`).
//! - `Restore` is interpreter-internal: it delimits a running finalizer and
//!   remembers the outcome to keep propagating afterwards.
//!
//! ## Unwinding
//!
//! A propagating value pops `Apply` frames; a typed failure skips `Apply`
//! and stops at the first `Recover`; interruption and defects run only
//! `Finalize` frames. Finalizers run innermost-first with the mask depth
//! raised, so interruption delivered mid-finalizer is deferred until the
//! mask returns to zero. A finalizer's own failure is reported to the
//! fiber's uncaught-error handler and never replaces the outcome that was
//! already propagating.
//!
//! ## Preemption
//!
//! Interruption is checked between any two trampoline iterations (so tight
//! `sync` rebuild loops stay interruptible), when parking for `Async`,
//! `Sleep` or `Join`, and on resumption. A yield budget re-submits
//! long-running fibers to the run queue for fairness.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::effect::{
    erase, BoxValue, CatchThunk, Kleisli, Node, NoticeFn, RegisterEffectFn, RegisterFn,
    SuspendThunk, Thunk,
};
use crate::exit::{Cause, Defect, Panic, UntypedExit};
use crate::fiber::{ErrorPayload, FiberError, FiberShared, ResumeHandle, UntypedFiber};
use crate::runtime::RuntimeCore;

/// What the trampoline does next.
pub(crate) enum Op {
    /// Evaluate an effect node.
    Continue(Node),
    /// Propagate a value down the frame stack.
    Produce(BoxValue),
    /// Propagate a typed failure down the frame stack.
    Raise(BoxValue),
    /// Propagate an interruption or defect down the frame stack.
    Halt(Cause),
}

/// A continuation frame.
enum Frame {
    Apply(Kleisli),
    Recover(Kleisli),
    Finalize(Node),
    ExitNotice(NoticeFn),
    /// Delimits a running finalizer; holds the outcome to restore once the
    /// finalizer settles.
    Restore(Pending),
}

/// The outcome suspended while a finalizer runs.
enum Pending {
    Value(BoxValue),
    Failure(BoxValue),
    Halted(Cause),
}

impl Pending {
    fn into_op(self) -> Op {
        match self {
            Pending::Value(value) => Op::Produce(value),
            Pending::Failure(error) => Op::Raise(error),
            Pending::Halted(cause) => Op::Halt(cause),
        }
    }
}

/// Single-owner interpreter state for one fiber.
pub(crate) struct FiberRuntime {
    shared: Arc<FiberShared>,
    runtime: Arc<RuntimeCore>,
    stack: Vec<Frame>,
    /// Non-zero while finalizers run; interruption is deferred.
    mask_depth: u32,
    yield_budget: u32,
}

impl FiberRuntime {
    pub(crate) fn new(shared: Arc<FiberShared>, runtime: Arc<RuntimeCore>) -> Box<Self> {
        let yield_budget = runtime.yield_budget();
        Box::new(Self {
            shared,
            runtime,
            stack: Vec::new(),
            mask_depth: 0,
            yield_budget,
        })
    }

    pub(crate) fn shared(&self) -> &Arc<FiberShared> {
        &self.shared
    }

    /// Begin interpreting an effect tree from the top.
    pub(crate) fn start(self: Box<Self>, node: Node) {
        self.run(Op::Continue(node))
    }

    /// Re-enter the trampoline after a suspension, with the exit the fiber
    /// was resumed with.
    pub(crate) fn resume_with(self: Box<Self>, exit: UntypedExit) {
        let op = match exit {
            UntypedExit::Completed(value) => Op::Produce(value),
            UntypedExit::Failed(error) => Op::Raise(error),
            UntypedExit::Interrupted(cause) => Op::Halt(cause),
        };
        self.run(op)
    }

    /// Submit this fiber back to the run queue to resume with `exit`.
    pub(crate) fn reschedule(self: Box<Self>, exit: UntypedExit) {
        let runtime = self.runtime.clone();
        runtime.submit(Box::new(move || self.resume_with(exit)));
    }

    /// The trampoline. Runs until the fiber terminates, suspends, or
    /// exhausts its yield budget.
    fn run(mut self: Box<Self>, mut op: Op) {
        let mut budget = self.yield_budget;
        loop {
            // Preemption point: deliver a pending interruption unless a
            // halt is already unwinding or a finalizer holds the mask.
            if self.mask_depth == 0 && !matches!(op, Op::Halt(_)) {
                if let Some(cause) = self.shared.take_interrupt() {
                    op = Op::Halt(Cause::Interrupt(cause));
                }
            }

            if budget == 0 {
                let runtime = self.runtime.clone();
                runtime.submit(Box::new(move || self.run(op)));
                return;
            }
            budget -= 1;

            op = match op {
                Op::Continue(node) => match node {
                    Node::Now(value) => Op::Produce(value),
                    Node::Point(thunk) | Node::Sync(thunk) => match eval_thunk(thunk) {
                        Ok(value) => Op::Produce(value),
                        Err(defect) => Op::Halt(Cause::Defect(defect)),
                    },
                    Node::SyncCatch(thunk) => match eval_catch(thunk) {
                        Ok(Ok(value)) => Op::Produce(value),
                        Ok(Err(error)) => Op::Raise(error),
                        Err(defect) => Op::Halt(Cause::Defect(defect)),
                    },
                    Node::Suspend(thunk) => match eval_suspend(thunk) {
                        Ok(inner) => Op::Continue(inner),
                        Err(defect) => Op::Halt(Cause::Defect(defect)),
                    },
                    Node::Fail(error) => Op::Raise(error),
                    Node::Terminate(defect) => Op::Halt(Cause::Defect(defect)),
                    Node::FlatMap(child, k) => {
                        self.stack.push(Frame::Apply(k));
                        Op::Continue(*child)
                    }
                    Node::Fold { child, ok, err } => {
                        self.stack.push(Frame::Recover(err));
                        self.stack.push(Frame::Apply(ok));
                        Op::Continue(*child)
                    }
                    Node::Ensuring(child, finalizer) => {
                        self.stack.push(Frame::Finalize(*finalizer));
                        Op::Continue(*child)
                    }
                    Node::OnError(child, notice) => {
                        self.stack.push(Frame::ExitNotice(notice));
                        Op::Continue(*child)
                    }
                    Node::Async(register) => return self.park_async(register),
                    Node::AsyncEffect(register) => return self.park_async_effect(register),
                    Node::Fork { child, handler } => {
                        let handler = handler.unwrap_or_else(|| self.runtime.default_handler());
                        let child_fiber = self.runtime.clone().spawn(*child, handler);
                        Op::Produce(erase(UntypedFiber(child_fiber)))
                    }
                    Node::Join(target) => return self.park_join(target),
                    Node::Interrupt { target, cause } => {
                        target.interrupt(cause);
                        Op::Produce(erase(()))
                    }
                    Node::Sleep(duration) => return self.park_sleep(duration),
                },

                Op::Produce(value) => match self.stack.pop() {
                    None => return self.shared.finish(UntypedExit::Completed(value)),
                    Some(Frame::Apply(k)) => match eval_apply(k, value) {
                        Ok(next) => Op::Continue(next),
                        Err(defect) => Op::Halt(Cause::Defect(defect)),
                    },
                    Some(Frame::Recover(_)) => Op::Produce(value),
                    Some(Frame::Finalize(finalizer)) => {
                        self.enter_finalizer(finalizer, Pending::Value(value))
                    }
                    Some(Frame::ExitNotice(notice)) => match eval_notice(notice, None) {
                        Ok(finalizer) => self.enter_finalizer(finalizer, Pending::Value(value)),
                        Err(defect) => {
                            self.shared.report(FiberError::FinalizerDefect(defect));
                            Op::Produce(value)
                        }
                    },
                    Some(Frame::Restore(pending)) => {
                        self.mask_depth -= 1;
                        pending.into_op()
                    }
                },

                Op::Raise(error) => match self.stack.pop() {
                    None => return self.shared.finish(UntypedExit::Failed(error)),
                    Some(Frame::Apply(_)) => Op::Raise(error),
                    Some(Frame::Recover(handler)) => match eval_apply(handler, error) {
                        Ok(next) => Op::Continue(next),
                        Err(defect) => Op::Halt(Cause::Defect(defect)),
                    },
                    Some(Frame::Finalize(finalizer)) => {
                        self.enter_finalizer(finalizer, Pending::Failure(error))
                    }
                    Some(Frame::ExitNotice(notice)) => {
                        match eval_notice(notice, Some(error.clone())) {
                            Ok(finalizer) => {
                                self.enter_finalizer(finalizer, Pending::Failure(error))
                            }
                            Err(defect) => {
                                self.shared.report(FiberError::FinalizerDefect(defect));
                                Op::Raise(error)
                            }
                        }
                    }
                    Some(Frame::Restore(pending)) => {
                        // The finalizer itself failed; keep the original
                        // outcome and divert the failure to the handler.
                        self.shared
                            .report(FiberError::FinalizerFailed(ErrorPayload(error)));
                        self.mask_depth -= 1;
                        pending.into_op()
                    }
                },

                Op::Halt(cause) => match self.stack.pop() {
                    None => return self.shared.finish(UntypedExit::Interrupted(cause)),
                    Some(Frame::Finalize(finalizer)) => {
                        self.enter_finalizer(finalizer, Pending::Halted(cause))
                    }
                    Some(Frame::Restore(pending)) => {
                        if let Cause::Defect(defect) = cause {
                            self.shared.report(FiberError::FinalizerDefect(defect));
                        }
                        self.mask_depth -= 1;
                        pending.into_op()
                    }
                    Some(_) => Op::Halt(cause),
                },
            };
        }
    }

    /// Raise the mask and run a finalizer, remembering the outcome to
    /// restore once it settles.
    fn enter_finalizer(&mut self, finalizer: Node, pending: Pending) -> Op {
        self.mask_depth += 1;
        self.stack.push(Frame::Restore(pending));
        Op::Continue(finalizer)
    }

    fn park_async(self: Box<Self>, register: RegisterFn) {
        let interruptible = self.mask_depth == 0;
        let shared = self.shared.clone();
        match shared.try_park(self, interruptible) {
            Err((fiber, cause)) => fiber.run(Op::Halt(Cause::Interrupt(cause))),
            Ok(gate) => {
                let handle = ResumeHandle::new(gate.clone());
                match catch_unwind(AssertUnwindSafe(move || register(handle))) {
                    Ok(Some(canceler)) => shared.attach_canceler(&gate, canceler),
                    Ok(None) => {}
                    Err(payload) => {
                        // The registration blew up while the fiber was
                        // already parked; terminate it through the gate.
                        gate.fire(UntypedExit::Interrupted(Cause::Defect(defect_of(payload))));
                    }
                }
            }
        }
    }

    fn park_async_effect(self: Box<Self>, register: RegisterEffectFn) {
        let interruptible = self.mask_depth == 0;
        let shared = self.shared.clone();
        let runtime = self.runtime.clone();
        match shared.try_park(self, interruptible) {
            Err((fiber, cause)) => fiber.run(Op::Halt(Cause::Interrupt(cause))),
            Ok(gate) => {
                let handle = ResumeHandle::new(gate.clone());
                match catch_unwind(AssertUnwindSafe(move || register(handle))) {
                    Ok(registration) => {
                        // The registration effect runs on its own fiber
                        // while this one stays suspended.
                        let handler = runtime.default_handler();
                        runtime.spawn(registration, handler);
                    }
                    Err(payload) => {
                        gate.fire(UntypedExit::Interrupted(Cause::Defect(defect_of(payload))));
                    }
                }
            }
        }
    }

    fn park_join(self: Box<Self>, target: Arc<FiberShared>) {
        let interruptible = self.mask_depth == 0;
        let shared = self.shared.clone();
        match shared.try_park(self, interruptible) {
            Err((fiber, cause)) => fiber.run(Op::Halt(Cause::Interrupt(cause))),
            Ok(gate) => {
                let handle = ResumeHandle::new(gate);
                target.add_observer(Box::new(move |exit| {
                    handle.fire(exit);
                }));
            }
        }
    }

    fn park_sleep(self: Box<Self>, duration: Duration) {
        let interruptible = self.mask_depth == 0;
        let shared = self.shared.clone();
        let timer = self.runtime.timer();
        match shared.try_park(self, interruptible) {
            Err((fiber, cause)) => fiber.run(Op::Halt(Cause::Interrupt(cause))),
            Ok(gate) => {
                let handle = ResumeHandle::new(gate.clone());
                let key = timer.schedule(
                    Instant::now() + duration,
                    Box::new(move || {
                        handle.fire(UntypedExit::Completed(erase(())));
                    }),
                );
                let canceler_timer = timer.clone();
                shared.attach_canceler(&gate, Box::new(move || canceler_timer.cancel(key)));
            }
        }
    }
}

// ============================================================================
// Panic capture at user-closure boundaries
// ============================================================================

fn defect_of(payload: Box<dyn Any + Send>) -> Defect {
    Defect::Panicked(Panic::from_payload(payload))
}

fn eval_thunk(thunk: Thunk) -> Result<BoxValue, Defect> {
    catch_unwind(AssertUnwindSafe(thunk)).map_err(defect_of)
}

fn eval_catch(thunk: CatchThunk) -> Result<Result<BoxValue, BoxValue>, Defect> {
    catch_unwind(AssertUnwindSafe(thunk)).map_err(defect_of)
}

fn eval_suspend(thunk: SuspendThunk) -> Result<Node, Defect> {
    catch_unwind(AssertUnwindSafe(thunk)).map_err(defect_of)
}

fn eval_apply(k: Kleisli, value: BoxValue) -> Result<Node, Defect> {
    catch_unwind(AssertUnwindSafe(move || k(value))).map_err(defect_of)
}

fn eval_notice(notice: NoticeFn, error: Option<BoxValue>) -> Result<Node, Defect> {
    catch_unwind(AssertUnwindSafe(move || notice(error))).map_err(defect_of)
}
