//! # Runtime Entry Points
//!
//! The [`Runtime`] owns the executor and the timer, carries the default
//! uncaught-error handler, and exposes the blocking [`Runtime::run`] entry
//! point. A process-wide instance is available through
//! [`Runtime::global`], initialized from the environment on first use;
//! embedders can construct private runtimes with [`Runtime::new`].

use std::sync::Arc;
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::effect::{Effect, Node};
use crate::exit::{Cause, ExitResult, Interruption, RunError, UntypedExit};
use crate::fiber::{ErrorHandler, FiberError, FiberShared};
use crate::interpreter::FiberRuntime;
use crate::scheduler::{Executor, Job};
use crate::timer::Timer;

/// Process-wide runtime, created on first use of [`Runtime::global`].
static GLOBAL: OnceLock<Runtime> = OnceLock::new();

/// A fiber runtime: worker pool, timer, and default error handler.
#[derive(Clone)]
pub struct Runtime {
    core: Arc<RuntimeCore>,
}

pub(crate) struct RuntimeCore {
    executor: Executor,
    timer: Timer,
    config: RuntimeConfig,
    default_handler: Mutex<ErrorHandler>,
}

impl Runtime {
    /// Start a runtime with the given configuration.
    pub fn new(config: RuntimeConfig) -> Self {
        tracing::debug!(workers = config.num_workers, "runtime starting");
        let executor = Executor::start(config.num_workers);
        let timer = Timer::start();
        Self {
            core: Arc::new(RuntimeCore {
                executor,
                timer,
                config,
                default_handler: Mutex::new(default_error_handler()),
            }),
        }
    }

    /// The process-wide runtime, initialized from `FILAMENT_*` environment
    /// variables on first use.
    pub fn global() -> &'static Runtime {
        GLOBAL.get_or_init(|| Runtime::new(RuntimeConfig::from_env()))
    }

    /// The configuration this runtime was started with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.core.config
    }

    /// Replace the default uncaught-error handler. Affects fibers forked
    /// after the call; `fork_with` overrides it per fiber.
    pub fn set_default_handler<H>(&self, handler: H)
    where
        H: Fn(FiberError) + Send + Sync + 'static,
    {
        *self.core.default_handler.lock() = Arc::new(handler);
    }

    /// Interpret an effect on a fresh root fiber and block the calling
    /// thread until it terminates.
    ///
    /// - `Completed(a)` returns `Ok(a)`.
    /// - `Failed(e)` returns `Err(RunError::Unhandled(e))`.
    /// - Interruption or a defect returns `Err(RunError::Terminated(_))`
    ///   with the cause retained.
    pub fn run<E, A>(&self, effect: Effect<E, A>) -> Result<A, RunError<E>>
    where
        E: Clone + Send + 'static,
        A: Clone + Send + 'static,
    {
        let (sender, receiver) = crossbeam_channel::bounded::<UntypedExit>(1);

        let shared = FiberShared::new(self.core.default_handler());
        shared.add_observer(Box::new(move |exit| {
            let _ = sender.send(exit);
        }));

        let fiber = FiberRuntime::new(shared, self.core.clone());
        let node = effect.into_node();
        let submitted = self.core.submit(Box::new(move || fiber.start(node)));
        if !submitted {
            return Err(shutdown_error());
        }

        match receiver.recv() {
            Ok(exit) => match ExitResult::<E, A>::from_untyped(exit) {
                ExitResult::Completed(value) => Ok(value),
                ExitResult::Failed(error) => Err(RunError::Unhandled(error)),
                ExitResult::Interrupted(cause) => Err(RunError::Terminated(cause)),
            },
            // The runtime shut down underneath the fiber.
            Err(_) => Err(shutdown_error()),
        }
    }

    /// Stop the workers and the timer. Suspended and queued fibers are
    /// dropped without running their finalizers; intended for process
    /// teardown and embedded runtimes, not as a cancellation mechanism.
    pub fn shutdown(&self) {
        tracing::debug!("runtime shutting down");
        self.core.executor.shutdown();
        self.core.timer.shutdown();
    }
}

fn shutdown_error<E>() -> RunError<E> {
    RunError::Terminated(Cause::Interrupt(Interruption::with_reason(
        "runtime shut down",
    )))
}

/// The default uncaught-error sink: structured log records.
fn default_error_handler() -> ErrorHandler {
    Arc::new(|error: FiberError| {
        tracing::error!(error = %error, "uncaught fiber error");
    })
}

impl RuntimeCore {
    pub(crate) fn submit(&self, job: Job) -> bool {
        self.executor.submit(job)
    }

    pub(crate) fn default_handler(&self) -> ErrorHandler {
        self.default_handler.lock().clone()
    }

    pub(crate) fn timer(&self) -> Timer {
        self.timer.clone()
    }

    pub(crate) fn yield_budget(&self) -> u32 {
        self.config.yield_budget
    }

    /// Allocate and schedule a new fiber interpreting `node`.
    pub(crate) fn spawn(self: Arc<Self>, node: Node, handler: ErrorHandler) -> Arc<FiberShared> {
        let shared = FiberShared::new(handler);
        tracing::trace!(fiber = %shared.id(), "fiber spawned");
        let fiber = FiberRuntime::new(shared.clone(), self.clone());
        self.submit(Box::new(move || fiber.start(node)));
        shared
    }
}

/// Run an effect on the process-wide runtime. See [`Runtime::run`].
pub fn run<E, A>(effect: Effect<E, A>) -> Result<A, RunError<E>>
where
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    Runtime::global().run(effect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, PartialEq)]
    struct TestErr(&'static str);

    fn small_runtime() -> Runtime {
        let config = RuntimeConfig::builder().num_workers(2).build().unwrap();
        Runtime::new(config)
    }

    #[test]
    fn test_run_returns_value() {
        let rt = small_runtime();
        assert_eq!(rt.run(Effect::<TestErr, i32>::now(7)).unwrap(), 7);
    }

    #[test]
    fn test_sleep_completes() {
        let rt = small_runtime();
        let start = Instant::now();
        rt.run(Effect::<TestErr, ()>::sleep(Duration::from_millis(20)))
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_zero_sleep_completes() {
        let rt = small_runtime();
        rt.run(Effect::<TestErr, ()>::sleep(Duration::ZERO)).unwrap();
    }

    #[test]
    fn test_fork_join_roundtrip() {
        let rt = small_runtime();
        let effect = Effect::<TestErr, i32>::point(|| 21)
            .fork()
            .flat_map(|fiber| fiber.join())
            .map(|n| n * 2);
        assert_eq!(rt.run(effect).unwrap(), 42);
    }

    #[test]
    fn test_join_propagates_failure() {
        let rt = small_runtime();
        let effect = Effect::<TestErr, i32>::fail(TestErr("child"))
            .fork()
            .flat_map(|fiber| fiber.join());
        assert!(matches!(
            rt.run(effect).unwrap_err(),
            RunError::Unhandled(TestErr("child"))
        ));
    }

    #[test]
    fn test_interrupting_never_terminates() {
        let rt = small_runtime();
        let effect = Effect::<TestErr, i32>::never()
            .fork()
            .flat_map(|fiber| fiber.interrupt().map(move |_| fiber))
            .map(|_| 42);
        assert_eq!(rt.run(effect).unwrap(), 42);
    }

    #[test]
    fn test_joining_interrupted_fiber_terminates_parent() {
        let rt = small_runtime();
        let effect = Effect::<TestErr, i32>::never()
            .fork()
            .flat_map(|fiber| fiber.interrupt_with("stop").and_then(fiber.join()));
        match rt.run(effect).unwrap_err() {
            RunError::Terminated(Cause::Interrupt(cause)) => {
                assert_eq!(cause.reason(), Some("stop"));
            }
            other => panic!("expected interruption, got {:?}", other),
        }
    }

    #[test]
    fn test_default_handler_sees_unobserved_failure() {
        let rt = small_runtime();
        let seen = Arc::new(AtomicUsize::new(0));

        let s = seen.clone();
        rt.set_default_handler(move |_err| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        // fork a failing fiber, never join it; wait on a flag instead
        let effect = Effect::<TestErr, i32>::fail(TestErr("lost"))
            .fork()
            .and_then(Effect::sleep(Duration::from_millis(50)));
        rt.run(effect).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_after_shutdown_reports_termination() {
        let rt = small_runtime();
        rt.shutdown();
        let err = rt.run(Effect::<TestErr, i32>::now(1)).unwrap_err();
        assert!(matches!(err, RunError::Terminated(Cause::Interrupt(_))));
    }

    #[test]
    fn test_global_runtime_runs() {
        assert_eq!(run(Effect::<TestErr, i32>::now(3)).unwrap(), 3);
    }
}
