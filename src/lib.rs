//! # effluent
//!
//! Algebraic effect coroutines with cooperative structured concurrency.
//!
//! ## Overview
//!
//! effluent lets sequential, effectful logic — fallible operations, requests
//! for contextual dependencies, optional context, asynchronous waits — be
//! written as ordinary-looking sequential code, while ancestor scopes
//! intercept, answer, or recover from any of those requests without the
//! callee knowing who is listening. On top of the effect core, a
//! structured-concurrency scheduler runs many effectful computations with
//! bounded parallelism, deterministic result attribution, and guaranteed
//! cleanup even when execution is cancelled mid-flight.
//!
//! - [`effect`]: the effect algebra — [`effect::Program`] descriptions,
//!   the [`effect::Coroutine`] suspension interface, and the
//!   handle/finally interpreter layer ([`effect::scoped`]).
//! - [`run`]: root drivers that answer the residual effects —
//!   [`run::run_sync`], [`run::run_async`], cancellation tokens, and a
//!   cancellable delay.
//! - [`schedule`]: the concurrency scheduler — [`schedule::Concurrent`]
//!   plus the stock `series`/`all`/`all_settled`/`race`/`parallel` forms.
//!
//! ## Example
//!
//! ```rust
//! use effluent::prelude::*;
//!
//! let program = ask::<i32>("answer").fmap(|n| n * 2);
//! let scope = scoped(program.into_coroutine())
//!     .handle(Handlers::new().provide("answer", || 21_i32));
//!
//! let completion = run_sync(scope);
//! assert_eq!(completion.downcast::<i32>().unwrap(), 42);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Prelude module for convenient imports.
///
/// Re-exports commonly used types and functions.
///
/// # Usage
///
/// ```rust
/// use effluent::prelude::*;
/// ```
pub mod prelude {
    pub use crate::effect::{
        Answer, BoxCoroutine, BoxedValue, Coroutine, CoroutineExt, Effect, Failure, FailureKind,
        FinalPhase, Handlers, Outcome, Program, Scope, Step, ask, ask_optional, ask_with,
        await_future, raise, scoped,
    };
    pub use crate::run::{
        CancelSource, CancelToken, Completion, RunError, delay, run_async, run_sync,
    };
    pub use crate::schedule::{
        Concurrent, ScheduleError, TaskResult, TaskSource, all, all_settled, parallel, race,
        series,
    };
}

pub mod effect;

pub mod run;

pub mod schedule;
