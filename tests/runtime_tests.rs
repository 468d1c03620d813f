//! End-to-end runtime scenarios: error channels, finalizer guarantees,
//! fork/join, racing, and interruption.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use filament::{
    run, Cause, Effect, ExitResult, FiberError, IORef, Promise, RunError, Runtime, RuntimeConfig,
};

#[derive(Debug, Clone, PartialEq)]
struct Oh(&'static str);

/// Defect payload used by terminate-based scenarios.
#[derive(Debug)]
struct Boom(&'static str);

impl fmt::Display for Boom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "boom: {}", self.0)
    }
}

impl std::error::Error for Boom {}

fn private_runtime() -> Runtime {
    Runtime::new(RuntimeConfig::builder().num_workers(2).build().unwrap())
}

/// The classic bracket, derived from the core primitives.
fn bracket<E, A, B, U, R>(
    acquire: Effect<E, A>,
    release: R,
    use_fn: U,
) -> Effect<E, B>
where
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    U: FnOnce(A) -> Effect<E, B> + Send + 'static,
    R: FnOnce(A) -> Effect<E, ()> + Send + 'static,
{
    acquire.flat_map(move |a| use_fn(a.clone()).ensuring(release(a)))
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn point_evaluates_to_its_value() {
    assert_eq!(run(Effect::<Oh, i32>::point(|| 1)).unwrap(), 1);
}

#[test]
fn caught_panic_surfaces_on_the_typed_branch() {
    #[derive(Debug, Clone, PartialEq)]
    struct Caught(String);

    impl From<filament::Panic> for Caught {
        fn from(p: filament::Panic) -> Self {
            Caught(p.message().to_string())
        }
    }

    let effect = Effect::<Caught, i32>::sync_catch(|| panic!("Oh")).attempt::<Caught>();
    assert_eq!(run(effect).unwrap(), Err(Caught("Oh".to_string())));
}

#[test]
fn finalizer_runs_when_failure_escapes() {
    let flag = Arc::new(AtomicBool::new(false));

    let f = flag.clone();
    let effect = Effect::<Oh, i32>::fail(Oh("Oh")).ensuring(Effect::<Oh, ()>::sync(move || {
        f.store(true, Ordering::SeqCst);
    }));

    let err = run(effect).unwrap_err();
    assert!(matches!(err, RunError::Unhandled(Oh("Oh"))));
    assert!(flag.load(Ordering::SeqCst));
}

#[test]
fn defecting_finalizers_reach_the_handler_without_masking() {
    let rt = private_runtime();
    let seen: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    rt.set_default_handler(move |error| {
        if let FiberError::FinalizerDefect(defect) = error {
            if let Some(boom) = defect.aborted_as::<Boom>() {
                sink.lock().unwrap().push(boom.0);
            }
        }
    });

    let effect = Effect::<Oh, i32>::fail(Oh("Oh"))
        .ensuring(Effect::<Oh, ()>::terminate(Boom("E2")))
        .ensuring(Effect::<Oh, ()>::terminate(Boom("E3")));

    let err = rt.run(effect).unwrap_err();
    assert!(matches!(err, RunError::Unhandled(Oh("Oh"))));
    assert_eq!(*seen.lock().unwrap(), vec!["E2", "E3"]);
    rt.shutdown();
}

fn concurrent_fib(n: u64) -> Effect<Oh, u64> {
    if n <= 1 {
        return Effect::now(n);
    }
    Effect::<Oh, u64>::suspend(move || concurrent_fib(n - 1))
        .fork()
        .flat_map(move |left| {
            Effect::<Oh, u64>::suspend(move || concurrent_fib(n - 2))
                .fork()
                .flat_map(move |right| {
                    left.join()
                        .flat_map(move |a| right.join().map(move |b| a + b))
                })
        })
}

fn pure_fib(n: u64) -> u64 {
    if n <= 1 {
        n
    } else {
        pure_fib(n - 1) + pure_fib(n - 2)
    }
}

#[test]
fn concurrent_fibonacci_matches_the_pure_function() {
    assert_eq!(run(concurrent_fib(20)).unwrap(), pure_fib(20));
}

fn fib_effect(n: u64) -> Effect<Oh, u64> {
    if n <= 1 {
        return Effect::now(n);
    }
    Effect::<Oh, u64>::suspend(move || fib_effect(n - 1))
        .flat_map(move |a| Effect::<Oh, u64>::suspend(move || fib_effect(n - 2)).map(move |b| a + b))
}

#[test]
fn interpreted_fibonacci_matches_the_pure_function() {
    assert_eq!(run(fib_effect(10)).unwrap(), 55);
}

#[test]
fn bracket_releases_under_interruption() {
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let use_log = log.clone();
    let release_log = log.clone();
    let bracketed = bracket(
        Effect::<Oh, ()>::unit(),
        move |_| {
            Effect::sync(move || {
                release_log.lock().unwrap().push("r");
            })
        },
        move |_| {
            Effect::<Oh, ()>::sleep(Duration::from_millis(10))
                .and_then(Effect::sync(move || {
                    use_log.lock().unwrap().push("u");
                }))
                .and_then(Effect::<Oh, ()>::never())
        },
    );

    let check_log = log.clone();
    let program = bracketed.fork().flat_map(move |fiber| {
        // wait until "u" appears, then interrupt
        Effect::<Oh, ()>::async_(move |resume| {
            let waiter = std::thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(5);
                while Instant::now() < deadline {
                    if check_log.lock().unwrap().contains(&"u") {
                        resume.succeed(());
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                resume.succeed(());
            });
            drop(waiter);
            None
        })
        .and_then(fiber.interrupt())
        .and_then(fiber.wait())
    });

    let exit = run(program).unwrap();
    assert!(matches!(exit, ExitResult::Interrupted(Cause::Interrupt(_))));
    assert_eq!(*log.lock().unwrap(), vec!["u", "r"]);
}

// ============================================================================
// Interruption
// ============================================================================

#[test]
fn interrupting_never_completes_promptly() {
    let start = Instant::now();
    let program = Effect::<Oh, i32>::never()
        .fork()
        .flat_map(|fiber| fiber.interrupt().map(|_| 42));
    assert_eq!(run(program).unwrap(), 42);
    assert!(start.elapsed() < Duration::from_secs(5));
}

fn spin() -> Effect<Oh, ()> {
    Effect::<Oh, ()>::sync(|| ()).flat_map(|_| Effect::suspend(spin))
}

#[test]
fn tight_sync_loop_is_interruptible() {
    let program = spin()
        .fork()
        .flat_map(|fiber| Effect::<Oh, ()>::sleep(Duration::from_millis(5)).and_then(fiber.interrupt()));
    run(program).unwrap();
}

#[test]
fn sleeping_fiber_is_interruptible() {
    let start = Instant::now();
    let program = Effect::<Oh, ()>::sleep(Duration::from_secs(3600))
        .fork()
        .flat_map(|fiber| {
            Effect::<Oh, ()>::sleep(Duration::from_millis(10)).and_then(fiber.interrupt())
        });
    run(program).unwrap();
    assert!(start.elapsed() < Duration::from_secs(60));
}

#[test]
fn interruption_waits_for_finalizers() {
    let released = Arc::new(AtomicBool::new(false));

    let r = released.clone();
    let guarded = Effect::<Oh, i32>::never().ensuring(
        Effect::<Oh, ()>::sleep(Duration::from_millis(20)).and_then(Effect::sync(move || {
            r.store(true, Ordering::SeqCst);
        })),
    );

    let observed = released.clone();
    let program = guarded.fork().flat_map(move |fiber| {
        Effect::<Oh, ()>::sleep(Duration::from_millis(10))
            .and_then(fiber.interrupt())
            .and_then(fiber.wait())
            .map(move |exit| (exit, observed.load(Ordering::SeqCst)))
    });

    let (exit, released_when_settled) = run(program).unwrap();
    assert!(matches!(exit, ExitResult::Interrupted(Cause::Interrupt(_))));
    assert!(released_when_settled);
}

#[test]
fn on_error_is_skipped_on_interruption_but_ensuring_runs() {
    let notice_ran = Arc::new(AtomicBool::new(false));
    let finalizer_ran = Arc::new(AtomicBool::new(false));

    let n = notice_ran.clone();
    let f = finalizer_ran.clone();
    let guarded = Effect::<Oh, i32>::never()
        .on_error(move |_| {
            Effect::<Oh, ()>::sync(move || {
                n.store(true, Ordering::SeqCst);
            })
        })
        .ensuring(Effect::<Oh, ()>::sync(move || {
            f.store(true, Ordering::SeqCst);
        }));

    let program = guarded.fork().flat_map(|fiber| {
        Effect::<Oh, ()>::sleep(Duration::from_millis(10))
            .and_then(fiber.interrupt())
            .and_then(fiber.wait())
            .map(|_| ())
    });
    run(program).unwrap();

    assert!(finalizer_ran.load(Ordering::SeqCst));
    assert!(!notice_ran.load(Ordering::SeqCst));
}

// ============================================================================
// Racing
// ============================================================================

#[test]
fn race_prefers_the_faster_side() {
    let fast = Effect::<Oh, i32>::now(2);
    let slow = Effect::<Oh, ()>::sleep(Duration::from_millis(100)).map(|_| 1);
    assert_eq!(run(slow.race(fast)).unwrap(), 2);
}

#[test]
fn race_runs_loser_finalizers_before_observing_the_result() {
    let loser_cleaned = Arc::new(AtomicBool::new(false));

    let flag = loser_cleaned.clone();
    let slow = Effect::<Oh, ()>::sleep(Duration::from_secs(3600))
        .map(|_| 1)
        .ensuring(Effect::<Oh, ()>::sync(move || {
            flag.store(true, Ordering::SeqCst);
        }));
    let fast = Effect::<Oh, ()>::sleep(Duration::from_millis(10)).map(|_| 2);

    let observed = loser_cleaned.clone();
    let program = slow
        .race(fast)
        .map(move |winner| (winner, observed.load(Ordering::SeqCst)));

    assert_eq!(run(program).unwrap(), (2, true));
}

// ============================================================================
// Async registration
// ============================================================================

#[test]
fn async_resumes_from_another_thread() {
    let effect = Effect::<Oh, i32>::async_(|resume| {
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            resume.succeed(5);
        });
        None
    });
    assert_eq!(run(effect).unwrap(), 5);
}

#[test]
fn async_extra_resumptions_are_discarded() {
    let effect = Effect::<Oh, i32>::async_(|resume| {
        assert!(resume.succeed(1));
        assert!(!resume.succeed(2));
        assert!(!resume.fail(Oh("late")));
        None
    });
    assert_eq!(run(effect).unwrap(), 1);
}

#[test]
fn async_effect_registration_runs_as_an_effect() {
    let registered = Arc::new(AtomicBool::new(false));

    let r = registered.clone();
    let effect = Effect::<Oh, i32>::async_effect(move |resume| {
        Effect::<Oh, ()>::sync(move || {
            r.store(true, Ordering::SeqCst);
            resume.succeed(8);
        })
    });

    assert_eq!(run(effect).unwrap(), 8);
    assert!(registered.load(Ordering::SeqCst));
}

// ============================================================================
// Shared cells under concurrency
// ============================================================================

#[test]
fn ioref_updates_are_linearizable_across_fibers() {
    const FIBERS: usize = 16;
    const INCREMENTS: usize = 100;

    fn increments(counter: IORef<usize>, left: usize) -> Effect<Oh, ()> {
        if left == 0 {
            return Effect::unit();
        }
        counter
            .update(|n| n + 1)
            .flat_map(move |_| Effect::suspend(move || increments(counter.clone(), left - 1)))
    }

    let program = IORef::make::<Oh>(0_usize).flat_map(|counter| {
        fn spawn_all(counter: IORef<usize>, n: usize) -> Effect<Oh, Vec<u64>> {
            if n == 0 {
                return Effect::now(Vec::new());
            }
            increments(counter.clone(), INCREMENTS)
                .fork()
                .flat_map(move |fiber| {
                    spawn_all(counter.clone(), n - 1).flat_map(move |mut ids| {
                        fiber.join().map(move |_| {
                            ids.push(fiber.id().as_u64());
                            ids
                        })
                    })
                })
        }
        let c = counter.clone();
        spawn_all(counter, FIBERS).flat_map(move |_| c.read())
    });

    assert_eq!(run(program).unwrap(), FIBERS * INCREMENTS);
}

#[test]
fn promise_completion_happens_before_every_get() {
    let program = Promise::<Oh, usize>::make().flat_map(|promise| {
        let completer = Effect::<Oh, ()>::sleep(Duration::from_millis(10))
            .and_then(promise.complete(123).map(|_| ()));
        promise.get().fork().flat_map(move |waiter| {
            completer
                .fork()
                .and_then(waiter.join())
        })
    });
    assert_eq!(run(program).unwrap(), 123);
}

#[test]
fn fibers_observe_terminal_exits_through_poll() {
    let program = Effect::<Oh, i32>::now(30).fork().flat_map(|fiber| {
        fiber.join().map(move |value| (value, fiber.poll()))
    });
    let (value, poll) = run(program).unwrap();
    assert_eq!(value, 30);
    assert!(matches!(poll, Some(ExitResult::Completed(30))));
}

#[test]
fn many_sleeping_fibers_make_progress() {
    const SLEEPERS: usize = 64;

    fn spawn_sleepers(n: usize, counter: Arc<AtomicUsize>) -> Effect<Oh, ()> {
        if n == 0 {
            return Effect::unit();
        }
        let c = counter.clone();
        Effect::<Oh, ()>::sleep(Duration::from_millis((n % 7) as u64))
            .and_then(Effect::sync(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .fork()
            .flat_map(move |fiber| {
                spawn_sleepers(n - 1, counter).and_then(fiber.join())
            })
    }

    let done = Arc::new(AtomicUsize::new(0));
    run(spawn_sleepers(SLEEPERS, done.clone())).unwrap();
    assert_eq!(done.load(Ordering::SeqCst), SLEEPERS);
}
