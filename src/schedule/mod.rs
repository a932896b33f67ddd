//! Cooperative structured concurrency over effect coroutines.
//!
//! [`Concurrent`] runs tasks pulled from a [`TaskSource`] with bounded
//! parallelism, attributing every settlement to its launch index and
//! feeding them to a reducer program through the [`pull`] effects. The
//! derived forms cover the common consumption patterns:
//!
//! - [`series`]: one task at a time, in order, under a caller-supplied
//!   reducer
//! - [`all`]: bounded parallelism, fail-fast, values in launch order
//! - [`parallel`]: [`all`] without a bound
//! - [`all_settled`]: every settlement, failures included
//! - [`race`]: first success wins, losers are torn down
//!
//! The scheduler is itself a [`Coroutine`](crate::effect::Coroutine):
//! tasks' unhandled effects propagate to the scopes enclosing it, and
//! cancelling it abandons every outstanding task through its own cleanup
//! before the scheduler completes.

mod concurrent;
mod reducers;
mod task;

pub use concurrent::Concurrent;
pub use reducers::{all, all_settled, parallel, pull, race, series};
pub use task::{ScheduleError, TaskResult, TaskSource};
