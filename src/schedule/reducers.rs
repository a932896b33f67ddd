//! Reducer programs and the derived scheduling forms.
//!
//! A reducer is an ordinary [`Program`] consuming the scheduler's
//! settlement stream through the [`pull`] effects; the scheduler answers
//! them as results become available and with `None` once every task has
//! settled. The derived forms below pair a [`Concurrent`] scheduler with
//! a stock reducer.

use crate::effect::{BoxedValue, Coroutine, CoroutineExt, Failure, Program};

use super::concurrent::Concurrent;
use super::task::{ScheduleError, TaskResult, TaskSource};

/// The effects a reducer uses to consume the settlement stream.
pub mod pull {
    use crate::effect::{BoxedValue, Program, ask};
    use crate::schedule::TaskResult;

    /// Requests the next successful value; a failed task settles this
    /// request with its attributed failure instead.
    pub const NEXT: &str = "effluent/pull-next";

    /// Requests the next settlement, success or failure.
    pub const RESULT: &str = "effluent/pull-result";

    /// The next successful value, or `None` at end of stream.
    pub fn next() -> Program<Option<BoxedValue>> {
        ask(NEXT)
    }

    /// The next settlement, or `None` at end of stream.
    pub fn result() -> Program<Option<TaskResult>> {
        ask(RESULT)
    }
}

/// Collects every successful value, failing fast on the first failure;
/// values come out in launch order regardless of settlement order.
fn collect_values(mut collected: Vec<(usize, BoxedValue)>) -> Program<Vec<BoxedValue>> {
    pull::result().flat_map(move |slot| match slot {
        Some(TaskResult::Ok { index, value }) => {
            collected.push((index, value));
            collect_values(collected)
        }
        Some(TaskResult::Err { error, .. }) => Program::fail(error),
        None => {
            collected.sort_by_key(|(index, _)| *index);
            Program::pure(collected.into_iter().map(|(_, value)| value).collect())
        }
    })
}

/// Collects every settlement in launch order; never fails.
fn collect_settled(mut collected: Vec<TaskResult>) -> Program<Vec<TaskResult>> {
    pull::result().flat_map(move |slot| match slot {
        Some(result) => {
            collected.push(result);
            collect_settled(collected)
        }
        None => {
            collected.sort_by_key(TaskResult::index);
            Program::pure(collected)
        }
    })
}

/// The first success wins; failed settlements are passed over, and a
/// stream that ends without one is a distinct no-results failure.
fn first_settlement() -> Program<TaskResult> {
    pull::result().flat_map(|slot| match slot {
        Some(winner @ TaskResult::Ok { .. }) => Program::pure(winner),
        Some(TaskResult::Err { .. }) => first_settlement(),
        None => Program::fail(Failure::no_results()),
    })
}

/// Runs tasks with bounded parallelism, collecting their values in
/// launch order and failing fast on the first failure.
///
/// # Errors
///
/// Returns [`ScheduleError::InvalidConcurrency`] when `max_concurrency`
/// is zero.
pub fn all(source: TaskSource, max_concurrency: usize) -> Result<Concurrent, ScheduleError> {
    Concurrent::new(
        source,
        max_concurrency,
        collect_values(Vec::new()).into_coroutine(),
    )
}

/// Like [`all`], but collects every settlement instead of failing fast.
///
/// # Errors
///
/// Returns [`ScheduleError::InvalidConcurrency`] when `max_concurrency`
/// is zero.
pub fn all_settled(
    source: TaskSource,
    max_concurrency: usize,
) -> Result<Concurrent, ScheduleError> {
    Concurrent::new(
        source,
        max_concurrency,
        collect_settled(Vec::new()).into_coroutine(),
    )
}

/// [`all`] without a parallelism bound.
pub fn parallel(source: TaskSource) -> Concurrent {
    Concurrent::with_limit(
        source,
        usize::MAX,
        collect_values(Vec::new()).into_coroutine().boxed(),
    )
}

/// Runs one task at a time, in launch order, under the given reducer;
/// the strict-ordering counterpart of [`Concurrent::new`] with a limit of
/// one.
pub fn series(source: TaskSource, reducer: impl Coroutine + 'static) -> Concurrent {
    Concurrent::with_limit(source, 1, reducer.boxed())
}

/// Runs every task at once; the first success wins and the losers are
/// abandoned through their own teardown. A source that never produces a
/// success fails with [`Failure::no_results`].
pub fn race(source: TaskSource) -> Concurrent {
    Concurrent::with_limit(
        source,
        usize::MAX,
        first_settlement().into_coroutine().boxed(),
    )
}
