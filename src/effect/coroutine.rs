//! The suspension interface.
//!
//! A [`Coroutine`] is one computation exposed as an explicit stepper: each
//! [`Coroutine::resume`] call runs it up to its next suspension point and
//! returns either a yielded [`Effect`] or a final [`Outcome`]. The
//! interpreter layers in [`scope`](super::scope) and the root drivers in
//! [`run`](crate::run) are all written against this interface, so a
//! handler wrapping a coroutine is itself a coroutine.

use super::failure::Failure;
use super::program::{Erased, ErasedRepr};
use super::queue::ContinuationQueue;
use super::value::{Answer, BoxedValue, Effect, Outcome, Step};

/// An explicitly-stepped effectful computation.
pub trait Coroutine: Send {
    /// Advances the computation with the answer to its last yielded
    /// effect (or [`Answer::Start`] for the first step), running it to
    /// its next suspension point or completion.
    ///
    /// Resuming after [`Step::Done`] is a protocol violation and
    /// completes with a protocol failure.
    fn resume(&mut self, answer: Answer) -> Step;

    /// Abandons the computation from its current suspension point.
    ///
    /// A coroutine with no cleanup obligations completes immediately with
    /// a cancelled failure. A coroutine holding cleanup obligations
    /// instead yields a teardown bracket
    /// ([`Effect::Final`](super::Effect::Final)); the caller must keep
    /// resuming it (answering its cleanup effects) until it completes.
    fn cancel(&mut self) -> Step;
}

/// An owned, type-erased coroutine.
pub type BoxCoroutine = Box<dyn Coroutine>;

impl Coroutine for BoxCoroutine {
    fn resume(&mut self, answer: Answer) -> Step {
        (**self).resume(answer)
    }

    fn cancel(&mut self) -> Step {
        (**self).cancel()
    }
}

/// Extension adaptors available on every sized coroutine.
pub trait CoroutineExt: Coroutine + Sized + 'static {
    /// Boxes this coroutine behind the type-erased interface.
    fn boxed(self) -> BoxCoroutine {
        Box::new(self)
    }
}

impl<C: Coroutine + Sized + 'static> CoroutineExt for C {}

// ============================================================
// ProgramCoroutine
// ============================================================

/// Which answer shape the suspended program expects back.
enum PendingKind {
    Raise,
    Ask,
    AskOptional,
    Await,
}

enum State {
    /// Not yet started.
    Idle(Erased),

    /// Suspended on an effect; the queue consumes the answer.
    Suspended {
        queue: ContinuationQueue,
        kind: PendingKind,
    },

    Finished,
}

/// The coroutine driving one [`Program`](super::Program).
#[must_use = "coroutines do nothing until resumed"]
pub struct ProgramCoroutine {
    state: State,
}

impl ProgramCoroutine {
    pub(crate) fn new(erased: Erased) -> Self {
        Self {
            state: State::Idle(erased),
        }
    }

    fn step(&mut self, erased: Erased) -> Step {
        match erased.into_repr() {
            ErasedRepr::Value(value) => {
                self.state = State::Finished;
                Step::Done(Outcome::Return(value))
            }
            ErasedRepr::Fail(failure) => {
                self.state = State::Finished;
                Step::Done(Outcome::Fail(failure))
            }
            ErasedRepr::Request { effect, queue } => {
                let kind = match &effect {
                    Effect::Raise { .. } => PendingKind::Raise,
                    Effect::Ask { .. } => PendingKind::Ask,
                    Effect::AskOptional { .. } => PendingKind::AskOptional,
                    Effect::Await { .. } => PendingKind::Await,
                    Effect::Final(_) => {
                        // Teardown markers belong to interpreters, not to
                        // program code.
                        self.state = State::Finished;
                        return Step::Done(Outcome::Fail(Failure::protocol(
                            "program yielded a teardown marker",
                        )));
                    }
                };
                self.state = State::Suspended { queue, kind };
                Step::Yield(effect)
            }
        }
    }

    fn finish_protocol(&mut self, message: &str) -> Step {
        self.state = State::Finished;
        Step::Done(Outcome::Fail(Failure::protocol(message)))
    }
}

impl Coroutine for ProgramCoroutine {
    fn resume(&mut self, answer: Answer) -> Step {
        match std::mem::replace(&mut self.state, State::Finished) {
            State::Idle(erased) => {
                if matches!(answer, Answer::Start) {
                    self.step(erased)
                } else {
                    self.finish_protocol("coroutine must first be resumed with Answer::Start")
                }
            }
            State::Suspended { queue, kind } => {
                let input: BoxedValue = match (kind, answer) {
                    (PendingKind::Ask | PendingKind::Await, Answer::Value(value)) => value,
                    (PendingKind::AskOptional, Answer::Value(value)) => Box::new(Some(value)),
                    (PendingKind::AskOptional, Answer::Absent) => {
                        Box::new(None::<BoxedValue>)
                    }
                    (_, Answer::Failure(failure)) => {
                        return Step::Done(Outcome::Fail(failure));
                    }
                    (PendingKind::Raise, _) => {
                        return self.finish_protocol(
                            "a raised error cannot be answered with a resumption",
                        );
                    }
                    (_, _) => {
                        return self
                            .finish_protocol("mismatched resumption for the pending effect");
                    }
                };
                self.step(queue.apply(input))
            }
            State::Finished => self.finish_protocol("coroutine resumed after completion"),
        }
    }

    fn cancel(&mut self) -> Step {
        // A bare program holds no cleanup obligations.
        self.state = State::Finished;
        Step::Done(Outcome::Fail(Failure::cancelled()))
    }
}
