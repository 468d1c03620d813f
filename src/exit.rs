//! Fiber exit results and failure causes.
//!
//! Every fiber terminates in exactly one of three ways: it completed with a
//! value, it failed with a typed error, or it was cut short by a [`Cause`]
//! (an external interruption or a defect). [`ExitResult`] is the currency of
//! fiber completion: it is what `join` observes, what async resumption
//! callbacks deliver, and what [`crate::Promise`] stores.
//!
//! # Error channels
//!
//! - **Typed failures** (`E`) are recoverable with `attempt`/`redeem` and
//!   travel in [`ExitResult::Failed`].
//! - **Defects** are panics raised inside `sync` thunks or explicit
//!   `terminate` calls. They bypass typed recovery and surface as
//!   [`Cause::Defect`].
//! - **Interruption** is an external request that a fiber stop; it surfaces
//!   as [`Cause::Interrupt`] with the requester's reason attached.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::effect::{erase, unerase, BoxValue};

/// Terminal outcome of a fiber.
#[derive(Debug, Clone)]
pub enum ExitResult<E, A> {
    /// The fiber produced a value.
    Completed(A),
    /// The fiber failed with a typed error.
    Failed(E),
    /// The fiber was terminated by interruption or a defect.
    Interrupted(Cause),
}

impl<E, A> ExitResult<E, A> {
    /// Check whether this exit carries a value.
    pub fn is_completed(&self) -> bool {
        matches!(self, ExitResult::Completed(_))
    }

    /// Check whether this exit carries a typed failure.
    pub fn is_failed(&self) -> bool {
        matches!(self, ExitResult::Failed(_))
    }

    /// Check whether this exit was an interruption or defect.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ExitResult::Interrupted(_))
    }

    /// Extract the value, if any.
    pub fn completed(self) -> Option<A> {
        match self {
            ExitResult::Completed(a) => Some(a),
            _ => None,
        }
    }

    /// Extract the typed failure, if any.
    pub fn failed(self) -> Option<E> {
        match self {
            ExitResult::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Map the success channel.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> ExitResult<E, B> {
        match self {
            ExitResult::Completed(a) => ExitResult::Completed(f(a)),
            ExitResult::Failed(e) => ExitResult::Failed(e),
            ExitResult::Interrupted(c) => ExitResult::Interrupted(c),
        }
    }

    /// Map the typed failure channel.
    pub fn map_error<E2>(self, f: impl FnOnce(E) -> E2) -> ExitResult<E2, A> {
        match self {
            ExitResult::Completed(a) => ExitResult::Completed(a),
            ExitResult::Failed(e) => ExitResult::Failed(f(e)),
            ExitResult::Interrupted(c) => ExitResult::Interrupted(c),
        }
    }
}

impl<E, A> ExitResult<E, A>
where
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    pub(crate) fn into_untyped(self) -> UntypedExit {
        match self {
            ExitResult::Completed(a) => UntypedExit::Completed(erase(a)),
            ExitResult::Failed(e) => UntypedExit::Failed(erase(e)),
            ExitResult::Interrupted(c) => UntypedExit::Interrupted(c),
        }
    }

    pub(crate) fn from_untyped(exit: UntypedExit) -> Self {
        match exit {
            UntypedExit::Completed(v) => ExitResult::Completed(unerase(v)),
            UntypedExit::Failed(e) => ExitResult::Failed(unerase(e)),
            UntypedExit::Interrupted(c) => ExitResult::Interrupted(c),
        }
    }
}

/// Type-erased exit, as stored in fiber state and delivered to observers.
#[derive(Clone)]
pub(crate) enum UntypedExit {
    Completed(BoxValue),
    Failed(BoxValue),
    Interrupted(Cause),
}

impl fmt::Debug for UntypedExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UntypedExit::Completed(_) => f.write_str("Completed(..)"),
            UntypedExit::Failed(_) => f.write_str("Failed(..)"),
            UntypedExit::Interrupted(c) => f.debug_tuple("Interrupted").field(c).finish(),
        }
    }
}

/// Why a fiber was terminated outside its typed error channel.
#[derive(Debug, Clone)]
pub enum Cause {
    /// An external interruption request.
    Interrupt(Interruption),
    /// A defect: a panic inside user code, or an explicit `terminate`.
    Defect(Defect),
}

impl Cause {
    /// The interruption, if this cause is one.
    pub fn interruption(&self) -> Option<&Interruption> {
        match self {
            Cause::Interrupt(i) => Some(i),
            Cause::Defect(_) => None,
        }
    }

    /// The defect, if this cause is one.
    pub fn defect(&self) -> Option<&Defect> {
        match self {
            Cause::Interrupt(_) => None,
            Cause::Defect(d) => Some(d),
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Interrupt(i) => write!(f, "{}", i),
            Cause::Defect(d) => write!(f, "{}", d),
        }
    }
}

impl std::error::Error for Cause {}

/// An interruption request, with the requester's optional reason.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interruption {
    reason: Option<String>,
}

impl Interruption {
    /// An interruption with no stated reason.
    pub fn new() -> Self {
        Self { reason: None }
    }

    /// An interruption carrying a reason.
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }

    /// The reason, if one was given.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "fiber interrupted: {}", reason),
            None => write!(f, "fiber interrupted"),
        }
    }
}

impl std::error::Error for Interruption {}

/// A panic payload rendered to text.
///
/// Panic payloads are `Box<dyn Any>` and in the common case carry a `&str`
/// or `String` message; anything else is rendered opaquely. Rendering keeps
/// defects cloneable so they can fan out to every observer of a fiber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Panic {
    message: String,
}

impl Panic {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "opaque panic payload".to_string()
        };
        Self { message }
    }

    /// The rendered panic message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// A non-recoverable failure.
///
/// Defects are never caught by `attempt`/`redeem`; they unwind through
/// finalizers and terminate the fiber.
#[derive(Debug, Clone)]
pub enum Defect {
    /// User code panicked inside a `sync` thunk or continuation.
    Panicked(Panic),
    /// The fiber was terminated explicitly via `Effect::terminate`.
    Aborted(Arc<dyn std::error::Error + Send + Sync>),
}

impl Defect {
    /// Downcast an `Aborted` payload to a concrete error type.
    pub fn aborted_as<T: std::error::Error + 'static>(&self) -> Option<&T> {
        match self {
            Defect::Aborted(err) => err.downcast_ref(),
            Defect::Panicked(_) => None,
        }
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Defect::Panicked(p) => write!(f, "fiber panicked: {}", p),
            Defect::Aborted(err) => write!(f, "fiber aborted: {}", err),
        }
    }
}

impl std::error::Error for Defect {}

/// Error returned by the blocking [`crate::Runtime::run`] entry point.
#[derive(Debug)]
pub enum RunError<E> {
    /// The effect failed with a typed error that nothing recovered.
    Unhandled(E),
    /// The fiber was terminated by interruption or a defect.
    Terminated(Cause),
}

impl<E> RunError<E> {
    /// The typed error, if any.
    pub fn unhandled(self) -> Option<E> {
        match self {
            RunError::Unhandled(e) => Some(e),
            RunError::Terminated(_) => None,
        }
    }

    /// The terminating cause, if any.
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            RunError::Unhandled(_) => None,
            RunError::Terminated(c) => Some(c),
        }
    }
}

impl<E: fmt::Debug> fmt::Display for RunError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Unhandled(e) => write!(f, "unhandled error: {:?}", e),
            RunError::Terminated(c) => write!(f, "{}", c),
        }
    }
}

impl<E: fmt::Debug> std::error::Error for RunError<E> {}
