//! Interpreter scopes: local handling and cleanup bracketing.
//!
//! [`scoped`] wraps a coroutine in a [`Scope`], onto which interpreter
//! layers are stacked. [`Scope::handle`] installs [`Handlers`] that answer
//! context requests and resolve raised errors; [`Scope::finally`] attaches
//! a cleanup coroutine that runs exactly once, whether the wrapped body
//! returns, fails, or is cancelled mid-suspension. Both layers are
//! themselves coroutines, so scopes nest arbitrarily and unmatched effects
//! propagate outward one layer at a time.

use std::any::Any;
use std::collections::HashMap;
use std::mem;

use super::coroutine::{BoxCoroutine, Coroutine, CoroutineExt};
use super::failure::{Failure, FailureKind};
use super::value::{Answer, BoxedValue, Effect, FinalPhase, Outcome, Step, unit};

// ============================================================
// Handlers
// ============================================================

enum Entry {
    /// Answers `Ask`/`AskOptional` requests; may be consulted many times.
    Provide(Box<dyn Fn(Option<BoxedValue>) -> BoxedValue + Send>),

    /// Resolves a raised error; consumed on first use.
    Resolve(Option<Box<dyn FnOnce(BoxedValue) -> Outcome + Send>>),
}

/// A set of named handlers installed by [`Scope::handle`].
///
/// # Examples
///
/// ```rust
/// use effluent::effect::{Handlers, Outcome, ask, raise, scoped};
/// use effluent::run::run_sync;
///
/// let program = raise::<i32>("too-small", 3_i32);
/// let scope = scoped(program.into_coroutine())
///     .handle(Handlers::new().resolve("too-small", |n: i32| n + 100));
///
/// assert_eq!(run_sync(scope).downcast::<i32>().unwrap(), 103);
/// ```
#[must_use]
#[derive(Default)]
pub struct Handlers {
    entries: HashMap<String, Entry>,
}

impl Handlers {
    /// Creates an empty handler set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers requests for `name` with a freshly produced value.
    pub fn provide<T, F>(mut self, name: impl Into<String>, produce: F) -> Self
    where
        T: Any + Send,
        F: Fn() -> T + Send + 'static,
    {
        self.entries.insert(
            name.into(),
            Entry::Provide(Box::new(move |_argument| Box::new(produce()))),
        );
        self
    }

    /// Answers requests for `name`, receiving the request's argument.
    pub fn provide_with<T, F>(mut self, name: impl Into<String>, produce: F) -> Self
    where
        T: Any + Send,
        F: Fn(Option<BoxedValue>) -> T + Send + 'static,
    {
        self.entries.insert(
            name.into(),
            Entry::Provide(Box::new(move |argument| Box::new(produce(argument)))),
        );
        self
    }

    /// Resolves errors raised under `name`, receiving the raw payload.
    ///
    /// The enclosed computation is abandoned (running its cleanup
    /// obligations) and the scope completes with the resolver's outcome.
    pub fn on_raise<F>(mut self, name: impl Into<String>, resolver: F) -> Self
    where
        F: FnOnce(BoxedValue) -> Outcome + Send + 'static,
    {
        self.entries
            .insert(name.into(), Entry::Resolve(Some(Box::new(resolver))));
        self
    }

    /// Typed sugar over [`Handlers::on_raise`]: downcasts the payload to
    /// `T` and returns the resolver's value as the scope's result.
    pub fn resolve<T, R, F>(self, name: impl Into<String>, resolver: F) -> Self
    where
        T: Any + Send,
        R: Any + Send,
        F: FnOnce(T) -> R + Send + 'static,
    {
        self.on_raise(name, move |payload| {
            let typed = *payload
                .downcast::<T>()
                .expect("raised payload of the wrong type for its resolver");
            Outcome::ret(resolver(typed))
        })
    }

    fn provide_entry(&self, name: &str) -> Option<&dyn Fn(Option<BoxedValue>) -> BoxedValue> {
        match self.entries.get(name) {
            Some(Entry::Provide(produce)) => Some(&**produce),
            _ => None,
        }
    }

    fn take_resolver(&mut self, name: &str) -> Option<Box<dyn FnOnce(BoxedValue) -> Outcome + Send>> {
        match self.entries.get_mut(name) {
            Some(Entry::Resolve(slot)) => slot.take(),
            _ => None,
        }
    }

    fn has_resolver(&self, name: &str) -> bool {
        matches!(self.entries.get(name), Some(Entry::Resolve(Some(_))))
    }
}

// ============================================================
// Scope
// ============================================================

/// A coroutine with interpreter layers stacked on top.
#[must_use = "scopes do nothing until driven"]
pub struct Scope {
    inner: BoxCoroutine,
}

/// Opens a scope around the given coroutine.
pub fn scoped(inner: impl Coroutine + 'static) -> Scope {
    Scope {
        inner: inner.boxed(),
    }
}

impl Scope {
    /// Stacks a handler layer onto this scope.
    pub fn handle(self, handlers: Handlers) -> Self {
        Self {
            inner: Handled::new(self.inner, handlers).boxed(),
        }
    }

    /// Stacks a cleanup obligation onto this scope.
    ///
    /// The cleanup coroutine runs exactly once after the wrapped body
    /// finishes, for every way it can finish. On the normal and failing
    /// paths a cleanup failure replaces the body's outcome; on the
    /// cancellation path cleanup failures are batched into the teardown
    /// bracket's closing marker instead.
    pub fn finally(self, cleanup: impl Coroutine + 'static) -> Self {
        Self {
            inner: Bracketed::new(self.inner, cleanup.boxed()).boxed(),
        }
    }
}

impl Coroutine for Scope {
    fn resume(&mut self, answer: Answer) -> Step {
        self.inner.resume(answer)
    }

    fn cancel(&mut self) -> Step {
        self.inner.cancel()
    }
}

// ============================================================
// Handled
// ============================================================

enum HandledMode {
    /// Answering the body's effects.
    Pumping,

    /// The body is being abandoned; when it completes, the stored
    /// resolver (if any) decides the scope's outcome.
    Draining {
        resolve: Option<(Box<dyn FnOnce(BoxedValue) -> Outcome + Send>, BoxedValue)>,
    },

    Finished,
}

/// The handler interpreter: answers matching `Ask`/`AskOptional` requests
/// in place and resolves matching `Raise` effects by abandoning the body.
struct Handled {
    inner: BoxCoroutine,
    handlers: Handlers,
    mode: HandledMode,
}

impl Handled {
    fn new(inner: BoxCoroutine, handlers: Handlers) -> Self {
        Self {
            inner,
            handlers,
            mode: HandledMode::Pumping,
        }
    }

    fn pump(&mut self, mut step: Step) -> Step {
        loop {
            match step {
                Step::Yield(effect) => match effect {
                    Effect::Ask { name, argument }
                        if self.handlers.provide_entry(&name).is_some() =>
                    {
                        let produce = self
                            .handlers
                            .provide_entry(&name)
                            .expect("provide entry vanished");
                        let value = produce(argument);
                        step = self.inner.resume(Answer::Value(value));
                    }
                    Effect::AskOptional { name }
                        if self.handlers.provide_entry(&name).is_some() =>
                    {
                        let produce = self
                            .handlers
                            .provide_entry(&name)
                            .expect("provide entry vanished");
                        let value = produce(None);
                        step = self.inner.resume(Answer::Value(value));
                    }
                    // Raises are only resolved on the live path; a raise
                    // escaping teardown propagates outward untouched.
                    Effect::Raise { name, payload }
                        if matches!(self.mode, HandledMode::Pumping)
                            && self.handlers.has_resolver(&name) =>
                    {
                        let resolver = self
                            .handlers
                            .take_resolver(&name)
                            .expect("resolver vanished");
                        self.mode = HandledMode::Draining {
                            resolve: Some((resolver, payload)),
                        };
                        step = self.inner.cancel();
                    }
                    other => return Step::Yield(other),
                },
                Step::Done(outcome) => {
                    let mode = mem::replace(&mut self.mode, HandledMode::Finished);
                    return Step::Done(match mode {
                        HandledMode::Pumping | HandledMode::Finished => outcome,
                        HandledMode::Draining {
                            resolve: Some((resolver, payload)),
                        } => resolver(payload),
                        HandledMode::Draining { resolve: None } => {
                            Outcome::Fail(Failure::cancelled())
                        }
                    });
                }
            }
        }
    }
}

impl Coroutine for Handled {
    fn resume(&mut self, answer: Answer) -> Step {
        if matches!(self.mode, HandledMode::Finished) {
            return Step::Done(Outcome::Fail(Failure::protocol(
                "handler scope resumed after completion",
            )));
        }
        let step = self.inner.resume(answer);
        self.pump(step)
    }

    fn cancel(&mut self) -> Step {
        match &mut self.mode {
            HandledMode::Pumping => {
                self.mode = HandledMode::Draining { resolve: None };
                let step = self.inner.cancel();
                self.pump(step)
            }
            HandledMode::Draining { resolve } => {
                // Cancellation overrides a pending resolution.
                *resolve = None;
                let step = self.inner.cancel();
                self.pump(step)
            }
            HandledMode::Finished => Step::Done(Outcome::Fail(Failure::cancelled())),
        }
    }
}

// ============================================================
// Bracketed
// ============================================================

enum BracketState {
    /// Pumping the body.
    Running,

    /// The body finished; pumping cleanup on the normal path.
    Cleaning,

    /// Cancelled: the opening teardown marker was emitted, the body's
    /// abandonment has not started yet.
    DrainPending,

    /// Cancelled while cleanup was already running normally; the cleanup
    /// coroutine itself is about to be abandoned.
    DrainCleanupPending,

    /// Cancelled: pumping the body's teardown.
    DrainInner,

    /// Cancelled: pumping cleanup.
    DrainCleanup,

    /// The closing teardown marker was emitted.
    Ended,

    Finished,
}

/// The cleanup interpreter: brackets a body with a cleanup coroutine that
/// runs exactly once.
struct Bracketed {
    inner: BoxCoroutine,
    cleanup: BoxCoroutine,
    state: BracketState,
    outcome: Option<Outcome>,
    failures: Vec<Failure>,
}

impl Bracketed {
    fn new(inner: BoxCoroutine, cleanup: BoxCoroutine) -> Self {
        Self {
            inner,
            cleanup,
            state: BracketState::Running,
            outcome: None,
            failures: Vec::new(),
        }
    }

    fn drive_running(&mut self, step: Step) -> Step {
        match step {
            Step::Yield(effect) => Step::Yield(effect),
            Step::Done(outcome) => {
                self.outcome = Some(outcome);
                self.state = BracketState::Cleaning;
                let step = self.cleanup.resume(Answer::Start);
                self.drive_cleaning(step)
            }
        }
    }

    fn drive_cleaning(&mut self, step: Step) -> Step {
        match step {
            Step::Yield(effect) => Step::Yield(effect),
            Step::Done(Outcome::Return(_)) => {
                self.state = BracketState::Finished;
                let outcome = self.outcome.take().unwrap_or_else(|| {
                    Outcome::Fail(Failure::protocol("cleanup finished without a body outcome"))
                });
                Step::Done(outcome)
            }
            Step::Done(Outcome::Fail(failure)) => {
                // On the live path a failing cleanup replaces the body's
                // outcome.
                self.state = BracketState::Finished;
                Step::Done(Outcome::Fail(failure))
            }
        }
    }

    /// Pumps the body's teardown, absorbing nested teardown brackets so
    /// this bracket exposes a single flat pair.
    fn drive_drain_inner(&mut self, mut step: Step) -> Step {
        loop {
            match step {
                Step::Yield(Effect::Final(FinalPhase::Start)) => {
                    step = self.inner.resume(Answer::Value(unit()));
                }
                Step::Yield(Effect::Final(FinalPhase::End(nested))) => {
                    self.failures.extend(nested);
                    step = self.inner.resume(Answer::Value(unit()));
                }
                Step::Yield(effect) => {
                    self.state = BracketState::DrainInner;
                    return Step::Yield(effect);
                }
                Step::Done(outcome) => {
                    self.collect_failure(outcome);
                    let step = self.cleanup.resume(Answer::Start);
                    return self.drive_drain_cleanup(step);
                }
            }
        }
    }

    /// Pumps cleanup on the cancellation path, then emits the closing
    /// marker carrying the batched teardown failures.
    fn drive_drain_cleanup(&mut self, mut step: Step) -> Step {
        loop {
            match step {
                Step::Yield(Effect::Final(FinalPhase::Start)) => {
                    step = self.cleanup.resume(Answer::Value(unit()));
                }
                Step::Yield(Effect::Final(FinalPhase::End(nested))) => {
                    self.failures.extend(nested);
                    step = self.cleanup.resume(Answer::Value(unit()));
                }
                Step::Yield(effect) => {
                    self.state = BracketState::DrainCleanup;
                    return Step::Yield(effect);
                }
                Step::Done(outcome) => {
                    self.collect_failure(outcome);
                    self.state = BracketState::Ended;
                    return Step::Yield(Effect::Final(FinalPhase::End(mem::take(
                        &mut self.failures,
                    ))));
                }
            }
        }
    }

    fn collect_failure(&mut self, outcome: Outcome) {
        if let Outcome::Fail(failure) = outcome {
            if failure.kind() != FailureKind::Cancelled {
                self.failures.push(failure);
            }
        }
    }
}

impl Coroutine for Bracketed {
    fn resume(&mut self, answer: Answer) -> Step {
        match self.state {
            BracketState::Running => {
                let step = self.inner.resume(answer);
                self.drive_running(step)
            }
            BracketState::Cleaning => {
                let step = self.cleanup.resume(answer);
                self.drive_cleaning(step)
            }
            BracketState::DrainPending => {
                let step = self.inner.cancel();
                self.drive_drain_inner(step)
            }
            BracketState::DrainCleanupPending => {
                let step = self.cleanup.cancel();
                self.drive_drain_cleanup(step)
            }
            BracketState::DrainInner => {
                let step = self.inner.resume(answer);
                self.drive_drain_inner(step)
            }
            BracketState::DrainCleanup => {
                let step = self.cleanup.resume(answer);
                self.drive_drain_cleanup(step)
            }
            BracketState::Ended => {
                self.state = BracketState::Finished;
                Step::Done(Outcome::Fail(Failure::cancelled()))
            }
            BracketState::Finished => Step::Done(Outcome::Fail(Failure::protocol(
                "cleanup scope resumed after completion",
            ))),
        }
    }

    fn cancel(&mut self) -> Step {
        match self.state {
            BracketState::Running => {
                self.state = BracketState::DrainPending;
                Step::Yield(Effect::Final(FinalPhase::Start))
            }
            BracketState::Cleaning => {
                // Cancelled mid-cleanup: the body's outcome is discarded
                // and the remainder of cleanup is abandoned from its
                // suspension point.
                self.outcome = None;
                self.state = BracketState::DrainCleanupPending;
                Step::Yield(Effect::Final(FinalPhase::Start))
            }
            BracketState::DrainPending | BracketState::DrainInner => {
                // Escalation: abandon the body's teardown where it stands.
                let step = self.inner.cancel();
                self.drive_drain_inner(step)
            }
            BracketState::DrainCleanupPending | BracketState::DrainCleanup => {
                let step = self.cleanup.cancel();
                self.drive_drain_cleanup(step)
            }
            BracketState::Ended => {
                self.state = BracketState::Finished;
                Step::Done(Outcome::Fail(Failure::cancelled()))
            }
            BracketState::Finished => Step::Done(Outcome::Fail(Failure::cancelled())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::program::{Program, ask, ask_optional, raise};
    use rstest::rstest;

    fn start(coroutine: &mut impl Coroutine) -> Step {
        coroutine.resume(Answer::Start)
    }

    fn expect_return<T: Any>(step: Step) -> T {
        match step {
            Step::Done(Outcome::Return(value)) => *value.downcast::<T>().unwrap(),
            step => panic!("expected a returned value, got {step:?}"),
        }
    }

    #[rstest]
    fn handlers_answer_context_requests() {
        let program = ask::<i32>("base").fmap(|n| n * 2);
        let mut scope = scoped(program.into_coroutine())
            .handle(Handlers::new().provide("base", || 21_i32));
        assert_eq!(expect_return::<i32>(start(&mut scope)), 42);
    }

    #[rstest]
    fn optional_requests_fall_through_unprovided() {
        let program = ask_optional::<i32>("trace").fmap(|slot| slot.is_none());
        let mut scope = scoped(program.into_coroutine()).handle(Handlers::new());
        // The handler layer has no entry, so the request propagates.
        match start(&mut scope) {
            Step::Yield(Effect::AskOptional { name }) => assert_eq!(name, "trace"),
            step => panic!("expected propagation, got {step:?}"),
        }
        assert!(expect_return::<bool>(scope.resume(Answer::Absent)));
    }

    #[rstest]
    fn resolver_recovers_a_raised_error() {
        let program = raise::<i32>("too-small", 3_i32);
        let mut scope = scoped(program.into_coroutine())
            .handle(Handlers::new().resolve("too-small", |n: i32| n + 100));
        assert_eq!(expect_return::<i32>(start(&mut scope)), 103);
    }

    #[rstest]
    fn unmatched_raise_propagates_outward() {
        let program = raise::<i32>("unknown", ());
        let mut scope = scoped(program.into_coroutine())
            .handle(Handlers::new().resolve("other", |(): ()| 0_i32));
        match start(&mut scope) {
            Step::Yield(Effect::Raise { name, .. }) => assert_eq!(name, "unknown"),
            step => panic!("expected propagation, got {step:?}"),
        }
    }

    #[rstest]
    fn inner_handler_wins_over_outer() {
        let program = ask::<i32>("n");
        let mut scope = scoped(
            scoped(program.into_coroutine()).handle(Handlers::new().provide("n", || 1_i32)),
        )
        .handle(Handlers::new().provide("n", || 2_i32));
        assert_eq!(expect_return::<i32>(start(&mut scope)), 1);
    }

    #[rstest]
    fn cleanup_runs_after_normal_completion() {
        let program = Program::pure(1_i32);
        let cleanup = Program::pure(()).into_coroutine();
        let mut scope = scoped(program.into_coroutine()).finally(cleanup);
        assert_eq!(expect_return::<i32>(start(&mut scope)), 1);
    }

    #[rstest]
    fn cleanup_effects_are_forwarded_then_outcome_returned() {
        let program = Program::pure(1_i32);
        let cleanup = ask::<()>("flush").into_coroutine();
        let mut scope = scoped(program.into_coroutine()).finally(cleanup);
        match start(&mut scope) {
            Step::Yield(Effect::Ask { name, .. }) => assert_eq!(name, "flush"),
            step => panic!("expected the cleanup's request, got {step:?}"),
        }
        assert_eq!(
            expect_return::<i32>(scope.resume(Answer::Value(Box::new(())))),
            1
        );
    }

    #[rstest]
    fn failing_cleanup_replaces_the_outcome() {
        let program = Program::pure(1_i32);
        let cleanup = Program::<()>::fail(Failure::new("flush failed")).into_coroutine();
        let mut scope = scoped(program.into_coroutine()).finally(cleanup);
        match start(&mut scope) {
            Step::Done(Outcome::Fail(failure)) => assert_eq!(failure.message(), "flush failed"),
            step => panic!("expected the cleanup failure, got {step:?}"),
        }
    }

    #[rstest]
    fn cancel_brackets_the_cleanup() {
        let program = ask::<i32>("never");
        let cleanup = Program::pure(()).into_coroutine();
        let mut scope = scoped(program.into_coroutine()).finally(cleanup);
        assert!(matches!(start(&mut scope), Step::Yield(Effect::Ask { .. })));

        match scope.cancel() {
            Step::Yield(Effect::Final(FinalPhase::Start)) => {}
            step => panic!("expected the opening teardown marker, got {step:?}"),
        }
        match scope.resume(Answer::Value(unit())) {
            Step::Yield(Effect::Final(FinalPhase::End(failures))) => assert!(failures.is_empty()),
            step => panic!("expected the closing teardown marker, got {step:?}"),
        }
        match scope.resume(Answer::Value(unit())) {
            Step::Done(Outcome::Fail(failure)) => {
                assert_eq!(failure.kind(), FailureKind::Cancelled);
            }
            step => panic!("expected a cancelled completion, got {step:?}"),
        }
    }

    #[rstest]
    fn cancel_batches_cleanup_failures_into_the_closing_marker() {
        let program = ask::<i32>("never");
        let cleanup = Program::<()>::fail(Failure::new("drop failed")).into_coroutine();
        let mut scope = scoped(program.into_coroutine()).finally(cleanup);
        assert!(matches!(start(&mut scope), Step::Yield(_)));

        assert!(matches!(
            scope.cancel(),
            Step::Yield(Effect::Final(FinalPhase::Start))
        ));
        match scope.resume(Answer::Value(unit())) {
            Step::Yield(Effect::Final(FinalPhase::End(failures))) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].message(), "drop failed");
            }
            step => panic!("expected the closing marker, got {step:?}"),
        }
    }

    #[rstest]
    fn nested_brackets_merge_into_one_flat_pair() {
        let inner_cleanup = Program::pure(()).into_coroutine();
        let outer_cleanup = Program::pure(()).into_coroutine();
        let body = scoped(ask::<i32>("never").into_coroutine()).finally(inner_cleanup);
        let mut scope = scoped(body).finally(outer_cleanup);
        assert!(matches!(start(&mut scope), Step::Yield(Effect::Ask { .. })));

        assert!(matches!(
            scope.cancel(),
            Step::Yield(Effect::Final(FinalPhase::Start))
        ));
        // The nested bracket is absorbed; one closing marker follows.
        match scope.resume(Answer::Value(unit())) {
            Step::Yield(Effect::Final(FinalPhase::End(failures))) => assert!(failures.is_empty()),
            step => panic!("expected a single closing marker, got {step:?}"),
        }
    }

    #[rstest]
    fn resolver_abandons_the_body_before_resolving() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let cleaned = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&cleaned);
        let cleanup = Program::pure(())
            .fmap(move |()| observed.store(true, Ordering::SeqCst))
            .into_coroutine();
        let body = scoped(raise::<i32>("nope", 7_i32).into_coroutine()).finally(cleanup);
        let mut scope = scoped(body).handle(Handlers::new().resolve("nope", |n: i32| n * 2));

        // The body's teardown bracket reaches this level; pump it through.
        assert!(matches!(
            start(&mut scope),
            Step::Yield(Effect::Final(FinalPhase::Start))
        ));
        assert!(matches!(
            scope.resume(Answer::Value(unit())),
            Step::Yield(Effect::Final(FinalPhase::End(_)))
        ));
        assert_eq!(expect_return::<i32>(scope.resume(Answer::Value(unit()))), 14);
        assert!(cleaned.load(Ordering::SeqCst));
    }
}
