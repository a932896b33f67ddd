//! Composable descriptions of effectful computations.
//!
//! A [`Program<A>`] is an inert value describing a sequential computation
//! that produces an `A` while performing effects along the way. Nothing
//! runs until the program is turned into a coroutine
//! ([`Program::into_coroutine`]) and driven by an interpreter. Composition
//! is monadic: [`Program::fmap`] transforms the result,
//! [`Program::flat_map`] sequences a dependent continuation, and the free
//! constructors ([`ask`], [`raise`], [`await_future`], ...) introduce one
//! suspension point each.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;

use super::coroutine::ProgramCoroutine;
use super::failure::Failure;
use super::queue::ContinuationQueue;
use super::value::{BoxedValue, Effect, Pending};

// ============================================================
// Erased representation
// ============================================================

/// A program with its result type erased.
///
/// The typed [`Program<A>`] wrapper restores the result type at the API
/// boundary; internally everything flows through this representation so
/// the continuation queue can hold heterogeneous arrows.
pub(crate) struct Erased {
    repr: ErasedRepr,
}

pub(crate) enum ErasedRepr {
    /// An immediate (type-erased) result.
    Value(BoxedValue),

    /// An immediate failure.
    Fail(Failure),

    /// A suspension: perform `effect`, feed its answer through `queue`.
    Request {
        effect: Effect,
        queue: ContinuationQueue,
    },
}

impl Erased {
    pub(crate) fn value(value: BoxedValue) -> Self {
        Self {
            repr: ErasedRepr::Value(value),
        }
    }

    pub(crate) fn fail(failure: Failure) -> Self {
        Self {
            repr: ErasedRepr::Fail(failure),
        }
    }

    pub(crate) fn request(effect: Effect, queue: ContinuationQueue) -> Self {
        Self {
            repr: ErasedRepr::Request { effect, queue },
        }
    }

    pub(crate) fn into_repr(self) -> ErasedRepr {
        self.repr
    }
}

// ============================================================
// Program
// ============================================================

/// A description of an effectful computation producing an `A`.
///
/// # Examples
///
/// ```rust
/// use effluent::effect::{Handlers, ask, scoped};
/// use effluent::run::run_sync;
///
/// let program = ask::<i32>("base")
///     .flat_map(|base| ask::<i32>("step").fmap(move |step| base + step));
///
/// let scope = scoped(program.into_coroutine()).handle(
///     Handlers::new()
///         .provide("base", || 40_i32)
///         .provide("step", || 2_i32),
/// );
/// assert_eq!(run_sync(scope).downcast::<i32>().unwrap(), 42);
/// ```
#[must_use = "programs describe work; nothing runs until they are driven"]
pub struct Program<A: 'static> {
    erased: Erased,
    _marker: PhantomData<fn() -> A>,
}

impl<A: Any + Send> Program<A> {
    /// Lifts a plain value into a program that performs no effects.
    pub fn pure(value: A) -> Self {
        Self::from_erased(Erased::value(Box::new(value)))
    }

    /// A program that terminates immediately with the given failure.
    pub fn fail(failure: Failure) -> Self {
        Self::from_erased(Erased::fail(failure))
    }

    /// A program that performs one effect and resumes with its answer,
    /// downcast to `A`.
    pub(crate) fn from_effect(effect: Effect) -> Self {
        Self::from_erased(Erased::request(effect, ContinuationQueue::new()))
    }

    pub(crate) fn from_erased(erased: Erased) -> Self {
        Self {
            erased,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_erased(self) -> Erased {
        self.erased
    }

    /// Transforms the result of this program.
    pub fn fmap<B, F>(self, function: F) -> Program<B>
    where
        B: Any + Send,
        F: FnOnce(A) -> B + Send + 'static,
    {
        self.flat_map(|value| Program::pure(function(value)))
    }

    /// Sequences a dependent continuation after this program.
    ///
    /// Binding is O(1) regardless of how deeply programs are already
    /// chained; the continuation runs only if this program succeeds.
    pub fn flat_map<B, F>(self, function: F) -> Program<B>
    where
        B: Any + Send,
        F: FnOnce(A) -> Program<B> + Send + 'static,
    {
        match self.erased.into_repr() {
            ErasedRepr::Value(value) => {
                let typed = *value
                    .downcast::<A>()
                    .expect("program value of the wrong type");
                function(typed)
            }
            ErasedRepr::Fail(failure) => Program::fail(failure),
            ErasedRepr::Request { effect, mut queue } => {
                queue.push(function);
                Program::from_erased(Erased::request(effect, queue))
            }
        }
    }

    /// Monadic bind under its `Result`-style name; identical to
    /// [`Program::flat_map`].
    pub fn and_then<B, F>(self, function: F) -> Program<B>
    where
        B: Any + Send,
        F: FnOnce(A) -> Program<B> + Send + 'static,
    {
        self.flat_map(function)
    }

    /// Sequences an independent follow-up program, discarding this
    /// program's result.
    pub fn then<B>(self, next: Program<B>) -> Program<B>
    where
        B: Any + Send,
    {
        self.flat_map(move |_| next)
    }

    /// Converts this description into a steppable coroutine.
    pub fn into_coroutine(self) -> ProgramCoroutine {
        ProgramCoroutine::new(self.erased)
    }
}

// ============================================================
// Free constructors
// ============================================================

/// A program that raises the named error with the given payload.
///
/// The payload reaches the matching handler unchanged. The program's
/// nominal result type is free because control never returns to the
/// raising computation.
pub fn raise<A>(name: impl Into<String>, payload: impl Any + Send) -> Program<A>
where
    A: Any + Send,
{
    Program::from_effect(Effect::Raise {
        name: name.into(),
        payload: Box::new(payload),
    })
}

/// A program that requests the named context value.
///
/// Some enclosing scope must provide it; reaching the root unanswered is
/// reported as a missing-handler error.
pub fn ask<T>(name: impl Into<String>) -> Program<T>
where
    T: Any + Send,
{
    Program::from_effect(Effect::Ask {
        name: name.into(),
        argument: None,
    })
}

/// Like [`ask`], with an argument accompanying the request.
pub fn ask_with<T>(name: impl Into<String>, argument: impl Any + Send) -> Program<T>
where
    T: Any + Send,
{
    Program::from_effect(Effect::Ask {
        name: name.into(),
        argument: Some(Box::new(argument)),
    })
}

/// A program that requests the named context value, resuming with `None`
/// when no enclosing scope provides it.
pub fn ask_optional<T>(name: impl Into<String>) -> Program<Option<T>>
where
    T: Any + Send,
{
    Program::<Option<BoxedValue>>::from_effect(Effect::AskOptional { name: name.into() }).fmap(
        |slot| {
            slot.map(|boxed| {
                *boxed
                    .downcast::<T>()
                    .expect("optional context value of the wrong type")
            })
        },
    )
}

/// A program that suspends until the given future settles.
///
/// A settled `Ok` resumes the program with the value; a settled `Err`
/// re-raises the failure inside the program, where an enclosing scope can
/// recover from it.
pub fn await_future<T, Fut>(future: Fut) -> Program<T>
where
    T: Any + Send,
    Fut: Future<Output = Result<T, Failure>> + Send + 'static,
{
    let pending: Pending = Box::pin(async move {
        future
            .await
            .map(|value| Box::new(value) as BoxedValue)
    });
    Program::from_effect(Effect::Await { pending })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::value::{Answer, Outcome, Step};
    use crate::effect::Coroutine;
    use rstest::rstest;

    fn run_pure<A: Any + Send>(program: Program<A>) -> A {
        let mut coroutine = program.into_coroutine();
        match coroutine.resume(Answer::Start) {
            Step::Done(Outcome::Return(value)) => *value.downcast::<A>().unwrap(),
            step => panic!("expected a pure completion, got {step:?}"),
        }
    }

    #[rstest]
    fn pure_completes_immediately() {
        assert_eq!(run_pure(Program::pure(7_i32)), 7);
    }

    #[rstest]
    fn fmap_transforms_the_result() {
        assert_eq!(run_pure(Program::pure(7_i32).fmap(|n| n * 6)), 42);
    }

    #[rstest]
    fn flat_map_sequences_dependent_programs() {
        let program = Program::pure(20_i32).flat_map(|n| Program::pure(n + 1).fmap(|m| m * 2));
        assert_eq!(run_pure(program), 42);
    }

    #[rstest]
    fn and_then_is_flat_map() {
        let program = Program::pure(20_i32).and_then(|n| Program::pure(n * 2).fmap(|m| m + 2));
        assert_eq!(run_pure(program), 42);
    }

    #[rstest]
    fn fail_short_circuits_continuations() {
        let program = Program::<i32>::fail(Failure::new("boom")).fmap(|n| n + 1);
        let mut coroutine = program.into_coroutine();
        match coroutine.resume(Answer::Start) {
            Step::Done(Outcome::Fail(failure)) => assert_eq!(failure.message(), "boom"),
            step => panic!("expected a failure, got {step:?}"),
        }
    }

    #[rstest]
    fn deep_flat_map_chains_stay_flat() {
        let mut program = Program::pure(0_u64);
        for _ in 0..100_000 {
            program = program.flat_map(|n| Program::pure(n + 1));
        }
        assert_eq!(run_pure(program), 100_000);
    }

    #[rstest]
    fn ask_suspends_with_the_requested_name() {
        let mut coroutine = ask::<i32>("answer").into_coroutine();
        match coroutine.resume(Answer::Start) {
            Step::Yield(effect) => assert_eq!(effect.name(), Some("answer")),
            step => panic!("expected a suspension, got {step:?}"),
        }
        match coroutine.resume(Answer::Value(Box::new(42_i32))) {
            Step::Done(Outcome::Return(value)) => {
                assert_eq!(*value.downcast::<i32>().unwrap(), 42);
            }
            step => panic!("expected completion, got {step:?}"),
        }
    }

    #[rstest]
    fn ask_optional_maps_absent_to_none() {
        let mut coroutine = ask_optional::<i32>("trace").into_coroutine();
        assert!(matches!(coroutine.resume(Answer::Start), Step::Yield(_)));
        match coroutine.resume(Answer::Absent) {
            Step::Done(Outcome::Return(value)) => {
                assert_eq!(*value.downcast::<Option<i32>>().unwrap(), None);
            }
            step => panic!("expected completion, got {step:?}"),
        }
    }
}
