//! Wire-level effect values.
//!
//! An [`Effect`] is the inert, data-only description of one pending request
//! that a coroutine yields at a suspension point. It is created at yield
//! time, answered exactly once by some ancestor, and discarded. The
//! matching resumption input is an [`Answer`]; one step of a coroutine
//! produces a [`Step`].

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use super::failure::Failure;

/// Type-erased payload currency.
///
/// Values crossing effect boundaries are boxed as `dyn Any` and downcast
/// at the typed edges of the API.
pub type BoxedValue = Box<dyn Any + Send>;

/// A boxed pending value: the future behind an [`Effect::Await`].
pub type Pending = Pin<Box<dyn Future<Output = Result<BoxedValue, Failure>> + Send>>;

/// Returns the boxed unit value used to answer teardown markers.
#[must_use]
pub fn unit() -> BoxedValue {
    Box::new(())
}

/// Phase of the internal teardown-bracket protocol.
///
/// When a coroutine holding cleanup obligations is forcibly cancelled, its
/// teardown is exposed as a `Start` marker, the cleanup's own effects, and
/// an `End` marker carrying any failures raised while tearing down. The
/// markers always occur as a balanced pair; whichever ancestor initiated
/// the cancellation pumps the coroutine through them.
#[derive(Debug)]
pub enum FinalPhase {
    /// Teardown begins; everything until the matching `End` is cleanup.
    Start,

    /// Teardown finished; carries the failures batched while draining.
    End(Vec<Failure>),
}

/// One pending request, yielded at a suspension point.
pub enum Effect {
    /// A declared error: propagate to the nearest handler registered for
    /// this name. Never answered with a resumption; a matching handler
    /// short-circuits the enclosing computation with its own result.
    Raise {
        /// The error name handlers match on.
        name: String,
        /// The original error payload, preserved unchanged.
        payload: BoxedValue,
    },

    /// A required context fetch: some ancestor must answer it. Reaching
    /// the root unanswered is a programming error.
    Ask {
        /// The context key.
        name: String,
        /// An optional argument accompanying the request (used by the
        /// collaborator boundary, e.g. "replace root value").
        argument: Option<BoxedValue>,
    },

    /// An optional context fetch: like [`Effect::Ask`] but degrades
    /// gracefully — the root answers [`Answer::Absent`] when nothing else
    /// did.
    AskOptional {
        /// The context key.
        name: String,
    },

    /// Suspend until the pending value settles; resumed with its result
    /// or its failure re-raised inside the coroutine. Only a root driver
    /// or the scheduler answers this; interpreter layers forward it
    /// untouched.
    Await {
        /// The boxed future to settle.
        pending: Pending,
    },

    /// Internal teardown-bracket marker; see [`FinalPhase`].
    Final(FinalPhase),
}

impl Effect {
    /// Returns the effect's name, for the named variants.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Raise { name, .. } | Self::Ask { name, .. } | Self::AskOptional { name } => {
                Some(name)
            }
            Self::Await { .. } | Self::Final(_) => None,
        }
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raise { name, .. } => formatter.debug_struct("Raise").field("name", name).finish(),
            Self::Ask { name, argument } => formatter
                .debug_struct("Ask")
                .field("name", name)
                .field("argument", &argument.as_ref().map(|_| "<boxed>"))
                .finish(),
            Self::AskOptional { name } => formatter
                .debug_struct("AskOptional")
                .field("name", name)
                .finish(),
            Self::Await { .. } => formatter.write_str("Await"),
            Self::Final(phase) => formatter.debug_tuple("Final").field(phase).finish(),
        }
    }
}

/// The resumption input answering a yielded [`Effect`].
pub enum Answer {
    /// The first resumption of a coroutine that has not yet run.
    Start,

    /// A value answering an `Ask`, `AskOptional`, or settled `Await`.
    Value(BoxedValue),

    /// The root's answer to an `AskOptional` nothing else provided.
    Absent,

    /// An awaited value failed, or an ancestor is killing the suspension
    /// point; re-raised as a native failure inside the coroutine.
    Failure(Failure),
}

impl fmt::Debug for Answer {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => formatter.write_str("Start"),
            Self::Value(_) => formatter.write_str("Value(<boxed>)"),
            Self::Absent => formatter.write_str("Absent"),
            Self::Failure(failure) => formatter.debug_tuple("Failure").field(failure).finish(),
        }
    }
}

/// The final result of a coroutine.
pub enum Outcome {
    /// Normal completion with a (type-erased) value.
    Return(BoxedValue),

    /// Termination with a native failure.
    Fail(Failure),
}

impl Outcome {
    /// Wraps a typed value as a returning outcome.
    #[must_use]
    pub fn ret(value: impl Any + Send) -> Self {
        Self::Return(Box::new(value))
    }

    /// Converts into a `Result`.
    ///
    /// # Errors
    ///
    /// Returns the failure when the outcome is [`Outcome::Fail`].
    pub fn into_result(self) -> Result<BoxedValue, Failure> {
        match self {
            Self::Return(value) => Ok(value),
            Self::Fail(failure) => Err(failure),
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Return(_) => formatter.write_str("Return(<boxed>)"),
            Self::Fail(failure) => formatter.debug_tuple("Fail").field(failure).finish(),
        }
    }
}

/// The result of advancing a coroutine by one step.
#[derive(Debug)]
pub enum Step {
    /// The coroutine suspended on a pending request.
    Yield(Effect),

    /// The coroutine finished.
    Done(Outcome),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn named_effects_report_their_name() {
        let raise = Effect::Raise {
            name: "nope".into(),
            payload: Box::new(()),
        };
        let ask = Effect::Ask {
            name: "db".into(),
            argument: None,
        };
        let optional = Effect::AskOptional { name: "trace".into() };
        assert_eq!(raise.name(), Some("nope"));
        assert_eq!(ask.name(), Some("db"));
        assert_eq!(optional.name(), Some("trace"));
        assert_eq!(Effect::Final(FinalPhase::Start).name(), None);
    }

    #[rstest]
    fn outcome_into_result_splits_variants() {
        assert!(Outcome::ret(1_i32).into_result().is_ok());
        assert!(Outcome::Fail(Failure::new("x")).into_result().is_err());
    }

    #[rstest]
    fn debug_renderings_hide_boxed_payloads() {
        let ask = Effect::Ask {
            name: "db".into(),
            argument: Some(Box::new(1_i32)),
        };
        assert!(format!("{ask:?}").contains("<boxed>"));
        assert!(format!("{:?}", Answer::Value(Box::new(()))).contains("<boxed>"));
    }
}
