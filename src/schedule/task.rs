//! Task inputs and attributed outputs of the scheduler.

use std::any::Any;
use std::collections::VecDeque;
use std::error::Error;
use std::fmt;

use crate::effect::{BoxCoroutine, BoxedValue, CoroutineExt, Failure, Program};

// ============================================================
// TaskSource
// ============================================================

enum SourceInner {
    /// Pulled lazily; `None` ends the stream.
    Produce(Box<dyn FnMut(usize) -> Option<BoxCoroutine> + Send>),

    /// A pre-built finite sequence.
    Sequence(VecDeque<BoxCoroutine>),
}

/// Where the scheduler pulls its tasks from.
///
/// Tasks are pulled one at a time, in order, only when a slot is free;
/// each pull is handed the index the task will be attributed under.
#[must_use]
pub struct TaskSource {
    inner: SourceInner,
}

impl TaskSource {
    /// A source pulling tasks from a producer until it returns `None`.
    pub fn from_fn(produce: impl FnMut(usize) -> Option<BoxCoroutine> + Send + 'static) -> Self {
        Self {
            inner: SourceInner::Produce(Box::new(produce)),
        }
    }

    /// A source over a fixed sequence of coroutines.
    pub fn from_coroutines(coroutines: impl IntoIterator<Item = BoxCoroutine>) -> Self {
        Self {
            inner: SourceInner::Sequence(coroutines.into_iter().collect()),
        }
    }

    /// A source over a fixed sequence of programs.
    pub fn from_programs<T: Any + Send>(programs: impl IntoIterator<Item = Program<T>>) -> Self {
        Self::from_coroutines(
            programs
                .into_iter()
                .map(|program| program.into_coroutine().boxed())
                .collect::<Vec<_>>(),
        )
    }

    pub(crate) fn pull(&mut self, index: usize) -> Option<BoxCoroutine> {
        match &mut self.inner {
            SourceInner::Produce(produce) => produce(index),
            SourceInner::Sequence(sequence) => sequence.pop_front(),
        }
    }
}

// ============================================================
// TaskResult
// ============================================================

/// One task's settlement, attributed to its launch index.
pub enum TaskResult {
    /// The task returned a value.
    Ok {
        /// The task's launch index.
        index: usize,
        /// The returned value.
        value: BoxedValue,
    },

    /// The task failed; the error carries the same index out-of-band.
    Err {
        /// The task's launch index.
        index: usize,
        /// The task's failure.
        error: Failure,
    },
}

impl TaskResult {
    /// The launch index this settlement is attributed to.
    #[must_use]
    pub const fn index(&self) -> usize {
        match self {
            Self::Ok { index, .. } | Self::Err { index, .. } => *index,
        }
    }

    /// Whether the task returned a value.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// Converts into a `Result`, dropping the index.
    ///
    /// # Errors
    ///
    /// Returns the task's failure when it did not return a value.
    pub fn into_result(self) -> Result<BoxedValue, Failure> {
        match self {
            Self::Ok { value, .. } => Ok(value),
            Self::Err { error, .. } => Err(error),
        }
    }
}

impl fmt::Debug for TaskResult {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok { index, .. } => formatter
                .debug_struct("Ok")
                .field("index", index)
                .finish(),
            Self::Err { index, error } => formatter
                .debug_struct("Err")
                .field("index", index)
                .field("error", error)
                .finish(),
        }
    }
}

// ============================================================
// ScheduleError
// ============================================================

/// A scheduler construction error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    /// `max_concurrency` was zero.
    InvalidConcurrency,
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConcurrency => formatter.write_str("max_concurrency must be at least 1"),
        }
    }
}

impl Error for ScheduleError {}
