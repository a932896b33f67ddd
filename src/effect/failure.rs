//! Dynamic failure values.
//!
//! A [`Failure`] is the native-exception analogue of this runtime: it is
//! what a coroutine terminates with when an awaited value fails, when a
//! computation calls [`Program::fail`](super::Program::fail), or when a
//! coroutine is forcibly cancelled. Failures carry their original payload
//! unchanged and, when they originate inside the scheduler, the index of
//! the task that raised them — attached out-of-band rather than by
//! reshaping the payload.

use std::any::Any;
use std::error::Error;
use std::fmt;

use super::value::BoxedValue;

/// Classifies a [`Failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// An application-level failure raised by user code or a failed await.
    Raised,

    /// The computation was forcibly cancelled before completing.
    Cancelled,

    /// A race over an input that produced no successful result.
    NoResults,

    /// The effect protocol was violated (answering a finished coroutine,
    /// mismatched resumption, unbalanced teardown brackets).
    Protocol,
}

/// A dynamic error value produced by a failing computation.
///
/// # Examples
///
/// ```rust
/// use effluent::effect::{Failure, FailureKind};
///
/// let failure = Failure::new("connection refused").with_payload(61_i32);
/// assert_eq!(failure.kind(), FailureKind::Raised);
/// assert_eq!(failure.payload::<i32>(), Some(&61));
/// assert_eq!(failure.to_string(), "connection refused");
/// ```
pub struct Failure {
    kind: FailureKind,
    message: String,
    payload: Option<BoxedValue>,
    task_index: Option<usize>,
}

impl Failure {
    /// Creates an application-level failure with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Raised,
            message: message.into(),
            payload: None,
            task_index: None,
        }
    }

    /// Creates the distinct failure reported by a cancelled computation.
    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: "computation cancelled".into(),
            payload: None,
            task_index: None,
        }
    }

    /// Creates the distinct failure reported by a race that saw no
    /// successful result.
    #[must_use]
    pub fn no_results() -> Self {
        Self {
            kind: FailureKind::NoResults,
            message: "no task produced a result".into(),
            payload: None,
            task_index: None,
        }
    }

    /// Creates a protocol-violation failure.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Protocol,
            message: message.into(),
            payload: None,
            task_index: None,
        }
    }

    /// Attaches the original payload of the failing effect or value.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Any + Send) -> Self {
        self.payload = Some(Box::new(payload));
        self
    }

    /// Attaches an already-boxed payload.
    #[must_use]
    pub fn with_boxed_payload(mut self, payload: BoxedValue) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Attaches the index of the scheduler task that raised this failure.
    ///
    /// The index rides alongside the payload; the payload itself is never
    /// reshaped.
    #[must_use]
    pub const fn with_task_index(mut self, index: usize) -> Self {
        self.task_index = Some(index);
        self
    }

    /// Returns the failure classification.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        self.kind
    }

    /// Returns the human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the payload downcast to `T`, if present and of that type.
    #[must_use]
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref::<T>())
    }

    /// Consumes the failure and returns its payload, if any.
    #[must_use]
    pub fn into_payload(self) -> Option<BoxedValue> {
        self.payload
    }

    /// Returns the index of the task this failure is attributed to.
    #[must_use]
    pub const fn task_index(&self) -> Option<usize> {
        self.task_index
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Failure")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("payload", &self.payload.as_ref().map(|_| "<boxed>"))
            .field("task_index", &self.task_index)
            .finish()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.message)?;
        if let Some(index) = self.task_index {
            write!(formatter, " (task {index})")?;
        }
        Ok(())
    }
}

impl Error for Failure {}
