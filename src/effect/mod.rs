//! The effect algebra: programs, coroutines, and interpreters.
//!
//! An *effect* is an inert, data-only description of one pending request:
//! a declared error, a context fetch, an optional context fetch, or an
//! asynchronous wait. A [`Program`] describes a sequential computation that
//! performs effects; a [`Coroutine`] is the suspension interface that steps
//! such a computation between its effect-yield points; [`scoped`] builds the
//! handle/finally interpreter layer that answers effects locally and
//! brackets cleanup across suspension.
//!
//! # Core Concepts
//!
//! - [`Effect`]: the value yielded at a suspension point
//! - [`Program`]: a composable description of an effectful computation
//! - [`Coroutine`]: `resume`/`cancel` stepping over suspension points
//! - [`Handlers`] + [`scoped`]: local interpretation and cleanup bracketing
//!
//! # Example
//!
//! ```rust
//! use effluent::effect::{Handlers, ask, scoped};
//! use effluent::run::run_sync;
//!
//! let program = ask::<String>("greeting").fmap(|g| format!("{g}, world"));
//! let scope = scoped(program.into_coroutine())
//!     .handle(Handlers::new().provide("greeting", || "hello".to_string()));
//!
//! let completion = run_sync(scope);
//! assert_eq!(completion.downcast::<String>().unwrap(), "hello, world");
//! ```

mod coroutine;
mod failure;
mod program;
mod queue;
mod scope;
mod value;

pub mod context;

pub use coroutine::{BoxCoroutine, Coroutine, CoroutineExt, ProgramCoroutine};
pub use failure::{Failure, FailureKind};
pub use program::{Program, ask, ask_optional, ask_with, await_future, raise};
pub use scope::{Handlers, Scope, scoped};
pub use value::{Answer, BoxedValue, Effect, FinalPhase, Outcome, Pending, Step, unit};
