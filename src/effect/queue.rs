//! Continuation queue for stack-safe program interpretation.
//!
//! Binding a continuation onto a suspended program appends a type-erased
//! arrow to this queue in O(1); answering the suspension applies the
//! arrows in a loop, so arbitrarily deep `flat_map` chains never grow the
//! call stack ("reflection without remorse").

use smallvec::SmallVec;
use std::any::Any;
use std::marker::PhantomData;

use super::program::{Erased, ErasedRepr, Program};
use super::value::BoxedValue;

/// Short chains (8 arrows or fewer) are stored inline without heap
/// allocation.
const CONTINUATION_INLINE_CAPACITY: usize = 8;

/// A type-erased continuation: `A -> Program<B>` lifted to
/// `BoxedValue -> Erased`.
trait ErasedArrow: Send {
    fn apply(self: Box<Self>, input: BoxedValue) -> Erased;
}

struct FlatMapArrow<A, B, F>
where
    F: FnOnce(A) -> Program<B>,
    B: 'static,
{
    function: F,
    _marker: PhantomData<fn(A) -> B>,
}

impl<A, B, F> ErasedArrow for FlatMapArrow<A, B, F>
where
    A: Any + Send,
    B: Any + Send,
    F: FnOnce(A) -> Program<B> + Send + 'static,
{
    fn apply(self: Box<Self>, input: BoxedValue) -> Erased {
        let value = *input
            .downcast::<A>()
            .expect("continuation applied to a value of the wrong type");
        (self.function)(value).into_erased()
    }
}

/// A queue of type-erased continuations awaiting an effect's answer.
pub(crate) struct ContinuationQueue {
    arrows: SmallVec<[Box<dyn ErasedArrow>; CONTINUATION_INLINE_CAPACITY]>,
}

impl ContinuationQueue {
    pub(crate) fn new() -> Self {
        Self {
            arrows: SmallVec::new(),
        }
    }

    /// Appends a `flat_map` continuation. O(1).
    pub(crate) fn push<A, B, F>(&mut self, function: F)
    where
        A: Any + Send,
        B: Any + Send,
        F: FnOnce(A) -> Program<B> + Send + 'static,
    {
        self.arrows.push(Box::new(FlatMapArrow {
            function,
            _marker: PhantomData,
        }));
    }

    /// Applies the queued continuations to the answer of a suspension.
    ///
    /// Runs arrows front to back while they produce immediate values; a
    /// failing arrow short-circuits (remaining continuations are
    /// abandoned, as after a thrown failure); a suspending arrow adopts
    /// the remaining arrows onto its own queue and returns the new
    /// suspended program.
    pub(crate) fn apply(self, input: BoxedValue) -> Erased {
        let mut value = input;
        let mut remaining = self.arrows.into_iter();
        while let Some(arrow) = remaining.next() {
            match arrow.apply(value).into_repr() {
                ErasedRepr::Value(next) => value = next,
                ErasedRepr::Fail(failure) => return Erased::fail(failure),
                ErasedRepr::Request { effect, mut queue } => {
                    queue.arrows.extend(remaining);
                    return Erased::request(effect, queue);
                }
            }
        }
        Erased::value(value)
    }
}
