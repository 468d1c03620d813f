//! # Filament
//!
//! A fiber-based effect runtime:
//!
//! - **Effect values**: lazy, immutable descriptions of computations with
//!   a typed error channel ([`Effect`])
//! - **Fibers**: cooperative lightweight tasks interpreting effect trees,
//!   with fork, join, racing and interruption ([`Fiber`])
//! - **Trampolined interpreter**: stack-safe evaluation of arbitrarily
//!   deep effect trees, with finalizer guarantees across success, failure,
//!   defects and interruption
//! - **Work-stealing scheduler**: a worker pool and a timer driving the
//!   fibers
//! - **Shared cells**: [`IORef`] and [`Promise`] for cross-fiber
//!   communication
//!
//! ## Example
//!
//! ```rust,ignore
//! use filament::{run, Effect};
//!
//! #[derive(Debug, Clone)]
//! struct Error(String);
//!
//! let program = Effect::<Error, i32>::point(|| 20)
//!     .flat_map(|n| Effect::now(n + 1))
//!     .map(|n| n * 2);
//!
//! assert_eq!(run(program).unwrap(), 42);
//! ```
//!
//! ## Error channels
//!
//! Typed failures travel in `E` and are recoverable (`attempt`, `redeem`);
//! defects (panics inside thunks, or [`Effect::terminate`]) are not;
//! interruption is an external request honored at preemption points while
//! still running every finalizer on the way out. See [`ExitResult`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod effect;
pub mod exit;
pub mod fiber;
mod interpreter;
mod scheduler;
mod timer;
pub mod runtime;
pub mod sync;

pub use config::{ConfigError, RuntimeConfig, RuntimeConfigBuilder};
pub use effect::{Canceler, Effect};
pub use exit::{Cause, Defect, ExitResult, Interruption, Panic, RunError};
pub use fiber::{ErrorHandler, ErrorPayload, Fiber, FiberError, FiberId, Resume};
pub use runtime::{run, Runtime};
pub use sync::{IORef, Promise};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Start a runtime with default configuration.
pub fn init() -> Runtime {
    Runtime::new(RuntimeConfig::default())
}

/// Start a runtime with a custom configuration.
pub fn init_with(config: RuntimeConfig) -> Runtime {
    Runtime::new(config)
}

/// Start a runtime configured from `FILAMENT_*` environment variables.
pub fn init_from_env() -> Runtime {
    Runtime::new(RuntimeConfig::from_env())
}
