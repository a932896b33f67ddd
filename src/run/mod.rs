//! Root drivers.
//!
//! A driver sits at the outermost edge of a coroutine stack and answers
//! the residual effects no scope claimed: optional context degrades to
//! absent, teardown brackets are pumped through, and anything that
//! genuinely required an answer becomes a [`RunError`]. [`run_sync`]
//! drives fully synchronous stacks; [`run_async`] additionally settles
//! asynchronous waits on the tokio runtime and honors a [`CancelToken`].

use std::any::Any;
use std::error::Error;
use std::fmt;

use crate::effect::{
    Answer, BoxedValue, Coroutine, Effect, Failure, FailureKind, FinalPhase, Outcome, Step, unit,
};

mod cancel;

pub use cancel::{CancelSource, CancelToken, delay};

// ============================================================
// Completion
// ============================================================

/// The full result of a driven computation.
///
/// The main outcome and the teardown report travel separately: failures
/// raised while tearing down a cancelled or aborted computation never
/// overwrite the primary result, they are batched here.
#[derive(Debug)]
#[must_use]
pub struct Completion {
    /// The computation's outcome.
    pub result: Result<BoxedValue, RunError>,

    /// Failures batched while pumping teardown brackets.
    pub cleanup_errors: Vec<Failure>,
}

impl Completion {
    /// Discards the teardown report and returns the outcome.
    ///
    /// # Errors
    ///
    /// Returns the run error when the computation did not complete
    /// normally.
    pub fn into_result(self) -> Result<BoxedValue, RunError> {
        self.result
    }

    /// Returns the outcome downcast to `T`.
    ///
    /// # Errors
    ///
    /// Returns the run error when the computation did not complete
    /// normally, or a protocol error when the returned value is not a
    /// `T`.
    pub fn downcast<T: Any>(self) -> Result<T, RunError> {
        self.result.and_then(|value| {
            value
                .downcast::<T>()
                .map(|boxed| *boxed)
                .map_err(|_| RunError::Protocol("completion value of an unexpected type".into()))
        })
    }
}

// ============================================================
// RunError
// ============================================================

/// Why a driven computation did not complete normally.
pub enum RunError {
    /// A raised error reached the driver with no scope resolving it.
    /// Carries the original payload unchanged.
    MissingHandler {
        /// The raised error's name.
        name: String,
        /// The raised error's payload.
        payload: BoxedValue,
    },

    /// A required context request reached the driver unanswered.
    MissingContext {
        /// The requested context key.
        name: String,
    },

    /// An asynchronous wait reached [`run_sync`].
    UnexpectedAsync,

    /// The computation was cancelled through its [`CancelToken`].
    Cancelled,

    /// The computation itself terminated with a failure.
    Failed(Failure),

    /// The effect protocol was violated.
    Protocol(String),
}

impl fmt::Debug for RunError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingHandler { name, .. } => formatter
                .debug_struct("MissingHandler")
                .field("name", name)
                .finish(),
            Self::MissingContext { name } => formatter
                .debug_struct("MissingContext")
                .field("name", name)
                .finish(),
            Self::UnexpectedAsync => formatter.write_str("UnexpectedAsync"),
            Self::Cancelled => formatter.write_str("Cancelled"),
            Self::Failed(failure) => formatter.debug_tuple("Failed").field(failure).finish(),
            Self::Protocol(message) => formatter.debug_tuple("Protocol").field(message).finish(),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingHandler { name, .. } => {
                write!(formatter, "no handler resolved raised error '{name}'")
            }
            Self::MissingContext { name } => {
                write!(formatter, "no handler provided context '{name}'")
            }
            Self::UnexpectedAsync => {
                formatter.write_str("asynchronous wait reached the synchronous driver")
            }
            Self::Cancelled => formatter.write_str("computation cancelled"),
            Self::Failed(failure) => write!(formatter, "{failure}"),
            Self::Protocol(message) => write!(formatter, "effect protocol violated: {message}"),
        }
    }
}

impl Error for RunError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

// ============================================================
// run_sync
// ============================================================

/// Drives a coroutine stack to completion synchronously.
///
/// Residual optional-context requests are answered absent; teardown
/// brackets are pumped through (depth tracked) with their failures
/// collected into the completion's report, and an `Ask`, `Raise`, or
/// asynchronous wait arriving inside an open bracket is failed into the
/// report the same way. Outside a bracket those effects abort the
/// computation: the stack is cancelled and drained before the error is
/// reported.
///
/// # Examples
///
/// ```rust
/// use effluent::effect::{Handlers, ask, scoped};
/// use effluent::run::run_sync;
///
/// let program = ask::<i32>("n").fmap(|n| n + 1);
/// let scope = scoped(program.into_coroutine())
///     .handle(Handlers::new().provide("n", || 41_i32));
/// assert_eq!(run_sync(scope).downcast::<i32>().unwrap(), 42);
/// ```
pub fn run_sync(mut coroutine: impl Coroutine) -> Completion {
    let mut cleanup_errors = Vec::new();
    let mut drain_depth = 0_usize;
    let mut step = coroutine.resume(Answer::Start);
    loop {
        match step {
            Step::Yield(effect) => match effect {
                Effect::AskOptional { .. } => step = coroutine.resume(Answer::Absent),
                Effect::Final(FinalPhase::Start) => {
                    drain_depth += 1;
                    step = coroutine.resume(Answer::Value(unit()));
                }
                Effect::Final(FinalPhase::End(failures)) => {
                    drain_depth = drain_depth.saturating_sub(1);
                    cleanup_errors.extend(failures);
                    step = coroutine.resume(Answer::Value(unit()));
                }
                // Inside an open teardown bracket these requests belong
                // to cleanup code; failing them there must not disturb
                // the outcome some scope already committed to.
                Effect::Ask { name, .. } if drain_depth > 0 => {
                    cleanup_errors.push(Failure::protocol(format!(
                        "unanswered context request '{name}' during teardown"
                    )));
                    step = coroutine.resume(Answer::Failure(Failure::protocol(
                        "context unavailable during teardown",
                    )));
                }
                Effect::Raise { name, payload } if drain_depth > 0 => {
                    cleanup_errors.push(
                        Failure::new(format!("unhandled error '{name}' during teardown"))
                            .with_boxed_payload(payload),
                    );
                    step = coroutine.resume(Answer::Failure(Failure::protocol(
                        "error unhandled during teardown",
                    )));
                }
                Effect::Await { .. } if drain_depth > 0 => {
                    cleanup_errors.push(Failure::protocol(
                        "asynchronous wait during synchronous teardown",
                    ));
                    step = coroutine.resume(Answer::Failure(Failure::protocol(
                        "asynchronous wait during synchronous teardown",
                    )));
                }
                Effect::Ask { name, .. } => {
                    return abort_sync(&mut coroutine, RunError::MissingContext { name }, cleanup_errors);
                }
                Effect::Raise { name, payload } => {
                    return abort_sync(
                        &mut coroutine,
                        RunError::MissingHandler { name, payload },
                        cleanup_errors,
                    );
                }
                Effect::Await { .. } => {
                    return abort_sync(&mut coroutine, RunError::UnexpectedAsync, cleanup_errors);
                }
            },
            Step::Done(Outcome::Return(value)) => {
                return Completion {
                    result: Ok(value),
                    cleanup_errors,
                };
            }
            Step::Done(Outcome::Fail(failure)) => {
                return Completion {
                    result: Err(RunError::Failed(failure)),
                    cleanup_errors,
                };
            }
        }
    }
}

/// Cancels the stack and drains its teardown without an async runtime.
fn abort_sync(
    coroutine: &mut impl Coroutine,
    error: RunError,
    mut cleanup_errors: Vec<Failure>,
) -> Completion {
    let mut step = coroutine.cancel();
    loop {
        match step {
            Step::Yield(effect) => match effect {
                Effect::AskOptional { .. } => step = coroutine.resume(Answer::Absent),
                Effect::Final(FinalPhase::Start) => {
                    step = coroutine.resume(Answer::Value(unit()));
                }
                Effect::Final(FinalPhase::End(failures)) => {
                    cleanup_errors.extend(failures);
                    step = coroutine.resume(Answer::Value(unit()));
                }
                Effect::Ask { name, .. } => {
                    cleanup_errors.push(Failure::protocol(format!(
                        "unanswered context request '{name}' during teardown"
                    )));
                    step = coroutine.resume(Answer::Failure(Failure::protocol(
                        "context unavailable during teardown",
                    )));
                }
                Effect::Raise { name, payload } => {
                    cleanup_errors.push(
                        Failure::new(format!("unhandled error '{name}' during teardown"))
                            .with_boxed_payload(payload),
                    );
                    step = coroutine.resume(Answer::Failure(Failure::protocol(
                        "error unhandled during teardown",
                    )));
                }
                Effect::Await { .. } => {
                    cleanup_errors.push(Failure::protocol(
                        "asynchronous wait during synchronous teardown",
                    ));
                    step = coroutine.resume(Answer::Failure(Failure::protocol(
                        "asynchronous wait during synchronous teardown",
                    )));
                }
            },
            Step::Done(outcome) => {
                if let Outcome::Fail(failure) = outcome {
                    if failure.kind() != FailureKind::Cancelled {
                        cleanup_errors.push(failure);
                    }
                }
                return Completion {
                    result: Err(error),
                    cleanup_errors,
                };
            }
        }
    }
}

// ============================================================
// run_async
// ============================================================

fn settle_answer(settled: Result<BoxedValue, Failure>) -> Answer {
    match settled {
        Ok(value) => Answer::Value(value),
        Err(failure) => Answer::Failure(failure),
    }
}

/// Drives a coroutine stack to completion on the tokio runtime.
///
/// Like [`run_sync`], but asynchronous waits are settled by awaiting
/// their futures, and the token is observed at every suspension point: on
/// cancellation the live wait is discarded, the stack is cancelled, and
/// its teardown is pumped to completion (teardown waits do run to
/// completion) before [`RunError::Cancelled`] is reported.
pub async fn run_async(mut coroutine: impl Coroutine, token: CancelToken) -> Completion {
    let mut cleanup_errors = Vec::new();
    let mut drain_depth = 0_usize;
    let mut abort: Option<RunError> = None;
    let mut step = if token.is_cancelled() {
        abort = Some(RunError::Cancelled);
        coroutine.cancel()
    } else {
        coroutine.resume(Answer::Start)
    };

    loop {
        if abort.is_none() && token.is_cancelled() && matches!(step, Step::Yield(_)) {
            abort = Some(RunError::Cancelled);
            step = coroutine.cancel();
        }
        match step {
            Step::Yield(effect) => match effect {
                Effect::AskOptional { .. } => step = coroutine.resume(Answer::Absent),
                Effect::Final(FinalPhase::Start) => {
                    drain_depth += 1;
                    step = coroutine.resume(Answer::Value(unit()));
                }
                Effect::Final(FinalPhase::End(failures)) => {
                    drain_depth = drain_depth.saturating_sub(1);
                    cleanup_errors.extend(failures);
                    step = coroutine.resume(Answer::Value(unit()));
                }
                Effect::Await { mut pending } => {
                    if abort.is_some() {
                        let settled = pending.await;
                        step = coroutine.resume(settle_answer(settled));
                    } else {
                        tokio::select! {
                            biased;
                            () = token.cancelled() => {
                                abort = Some(RunError::Cancelled);
                                step = coroutine.cancel();
                            }
                            settled = &mut pending => {
                                step = coroutine.resume(settle_answer(settled));
                            }
                        }
                    }
                }
                // An effect arriving inside an open teardown bracket
                // belongs to cleanup code, whether the run is aborting
                // or a scope committed to a resolution on its own.
                Effect::Ask { name, .. } => {
                    if abort.is_some() || drain_depth > 0 {
                        cleanup_errors.push(Failure::protocol(format!(
                            "unanswered context request '{name}' during teardown"
                        )));
                        step = coroutine.resume(Answer::Failure(Failure::protocol(
                            "context unavailable during teardown",
                        )));
                    } else {
                        abort = Some(RunError::MissingContext { name });
                        step = coroutine.cancel();
                    }
                }
                Effect::Raise { name, payload } => {
                    if abort.is_some() || drain_depth > 0 {
                        cleanup_errors.push(
                            Failure::new(format!("unhandled error '{name}' during teardown"))
                                .with_boxed_payload(payload),
                        );
                        step = coroutine.resume(Answer::Failure(Failure::protocol(
                            "error unhandled during teardown",
                        )));
                    } else {
                        abort = Some(RunError::MissingHandler { name, payload });
                        step = coroutine.cancel();
                    }
                }
            },
            Step::Done(outcome) => {
                return match abort {
                    Some(error) => {
                        if let Outcome::Fail(failure) = outcome {
                            if failure.kind() != FailureKind::Cancelled {
                                cleanup_errors.push(failure);
                            }
                        }
                        Completion {
                            result: Err(error),
                            cleanup_errors,
                        }
                    }
                    None => Completion {
                        result: outcome.into_result().map_err(RunError::Failed),
                        cleanup_errors,
                    },
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::{Handlers, Program, ask, ask_optional, raise, scoped};
    use rstest::rstest;

    #[rstest]
    fn sync_driver_returns_the_value() {
        let completion = run_sync(Program::pure(5_i32).into_coroutine());
        assert_eq!(completion.downcast::<i32>().unwrap(), 5);
    }

    #[rstest]
    fn sync_driver_answers_optional_context_absent() {
        let program = ask_optional::<i32>("trace").fmap(|slot| slot.is_none());
        assert!(run_sync(program.into_coroutine()).downcast::<bool>().unwrap());
    }

    #[rstest]
    fn unanswered_ask_reports_missing_context() {
        let completion = run_sync(ask::<i32>("db").into_coroutine());
        match completion.result {
            Err(RunError::MissingContext { name }) => assert_eq!(name, "db"),
            other => panic!("expected a missing-context error, got {other:?}"),
        }
    }

    #[rstest]
    fn unresolved_raise_reports_missing_handler_with_payload() {
        let completion = run_sync(raise::<i32>("nope", 9_i32).into_coroutine());
        match completion.result {
            Err(RunError::MissingHandler { name, payload }) => {
                assert_eq!(name, "nope");
                assert_eq!(*payload.downcast::<i32>().unwrap(), 9);
            }
            other => panic!("expected a missing-handler error, got {other:?}"),
        }
    }

    #[rstest]
    fn abort_still_runs_cleanup() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let cleaned = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&cleaned);
        let cleanup = Program::pure(())
            .fmap(move |()| observed.store(true, Ordering::SeqCst))
            .into_coroutine();
        let scope = scoped(ask::<i32>("db").into_coroutine()).finally(cleanup);

        let completion = run_sync(scope);
        assert!(matches!(
            completion.result,
            Err(RunError::MissingContext { .. })
        ));
        assert!(cleaned.load(Ordering::SeqCst));
        assert!(completion.cleanup_errors.is_empty());
    }

    #[rstest]
    fn failing_cleanup_during_abort_lands_in_the_report() {
        let cleanup = Program::<()>::fail(Failure::new("drop failed")).into_coroutine();
        let scope = scoped(ask::<i32>("db").into_coroutine()).finally(cleanup);

        let completion = run_sync(scope);
        assert!(matches!(
            completion.result,
            Err(RunError::MissingContext { .. })
        ));
        assert_eq!(completion.cleanup_errors.len(), 1);
        assert_eq!(completion.cleanup_errors[0].message(), "drop failed");
    }

    #[rstest]
    fn await_under_the_sync_driver_is_an_error() {
        let program = crate::effect::await_future(async { Ok(1_i32) });
        assert!(matches!(
            run_sync(program.into_coroutine()).result,
            Err(RunError::UnexpectedAsync)
        ));
    }

    #[rstest]
    fn resolved_raise_never_reaches_the_driver() {
        let program = raise::<i32>("nope", 1_i32);
        let scope = scoped(program.into_coroutine())
            .handle(Handlers::new().resolve("nope", |n: i32| n + 1));
        assert_eq!(run_sync(scope).downcast::<i32>().unwrap(), 2);
    }

    #[tokio::test]
    async fn async_driver_settles_awaits() {
        let program = crate::effect::await_future(async { Ok(20_i32) }).fmap(|n| n + 2);
        let completion = run_async(program.into_coroutine(), CancelToken::never()).await;
        assert_eq!(completion.downcast::<i32>().unwrap(), 22);
    }

    #[tokio::test]
    async fn failed_await_surfaces_as_a_failure() {
        let program = crate::effect::await_future::<i32, _>(async { Err(Failure::new("io")) });
        let completion = run_async(program.into_coroutine(), CancelToken::never()).await;
        match completion.result {
            Err(RunError::Failed(failure)) => assert_eq!(failure.message(), "io"),
            other => panic!("expected the await's failure, got {other:?}"),
        }
    }
}
