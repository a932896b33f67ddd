//! The cooperative concurrency scheduler.
//!
//! [`Concurrent`] multiplexes many task coroutines behind a single
//! coroutine interface. Tasks are pulled from a [`TaskSource`] while a
//! slot under `max_concurrency` is free; their asynchronous waits are
//! merged into one combined wait yielded to whoever drives the scheduler,
//! so sibling tasks overlap in time while everything above the scheduler
//! stays a plain coroutine stack. Settlements are attributed to launch
//! indices and consumed by a reducer coroutine through the
//! [`pull`](super::reducers::pull) effects; when the reducer finishes
//! early or the scheduler is cancelled, every outstanding task is
//! abandoned through its own teardown before the scheduler completes.

use std::collections::{HashMap, VecDeque};
use std::future::poll_fn;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use futures::Stream;
use futures::future::{AbortHandle, abortable};
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;

use crate::effect::{
    Answer, BoxCoroutine, BoxedValue, Coroutine, CoroutineExt, Effect, Failure, FailureKind,
    FinalPhase, Outcome, Pending, Step, unit,
};

use super::reducers::pull;
use super::task::{ScheduleError, TaskResult, TaskSource};

/// One settled task wait: the task's index and its result, or `None` when
/// the wait was discarded after the task stopped mattering.
type Settlement = (usize, Option<Result<BoxedValue, Failure>>);

type SettleFuture = Pin<Box<dyn Future<Output = Settlement> + Send>>;

type MergedSet = Arc<Mutex<FuturesUnordered<SettleFuture>>>;

/// Which pull request the reducer is suspended on.
enum PullKind {
    Next,
    Result,
}

/// Who the scheduler's last yielded effect belongs to.
enum Route {
    Idle,
    Reducer,
    Task(usize),
    Merged,
    Marker,
}

enum Mode {
    Normal,
    Draining,
    Ended,
    Finished,
}

enum DrainTarget {
    Reducer,
    Task(usize),
}

enum Incoming {
    Reducer(Step),
    Task(usize, Step),
}

enum Flow {
    Event(Incoming),
    Emit(Step),
}

fn settle_answer(settled: Result<BoxedValue, Failure>) -> Answer {
    match settled {
        Ok(value) => Answer::Value(value),
        Err(failure) => Answer::Failure(failure),
    }
}

/// The next settlement out of the merged set, boxed for the wire.
fn merged_wait(set: MergedSet) -> Pending {
    Box::pin(poll_fn(move |context| {
        let mut guard = set.lock();
        match Pin::new(&mut *guard).poll_next(context) {
            Poll::Ready(Some(settlement)) => {
                Poll::Ready(Ok(Box::new(settlement) as BoxedValue))
            }
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }))
}

/// A scheduler running tasks with bounded parallelism under a reducer.
#[must_use = "schedulers do nothing until driven"]
pub struct Concurrent {
    source: TaskSource,
    limit: usize,
    reducer: BoxCoroutine,
    reducer_started: bool,
    reducer_finished: bool,
    reducer_outcome: Option<Outcome>,
    pending_pull: Option<PullKind>,
    next_index: usize,
    exhausted: bool,
    tasks: HashMap<usize, BoxCoroutine>,
    /// Tasks parked on a detached wait. `Some` holds the live-path abort
    /// handle; teardown waits carry `None` and are never aborted.
    expecting: HashMap<usize, Option<AbortHandle>>,
    merged: MergedSet,
    results: VecDeque<TaskResult>,
    route: Route,
    mode: Mode,
    drain_queue: VecDeque<DrainTarget>,
    drain_failures: Vec<Failure>,
    drain_outcome: Option<Outcome>,
}

impl Concurrent {
    /// Creates a scheduler over `source`, running at most
    /// `max_concurrency` tasks at once, consumed by `reducer`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::InvalidConcurrency`] when
    /// `max_concurrency` is zero.
    pub fn new(
        source: TaskSource,
        max_concurrency: usize,
        reducer: impl Coroutine + 'static,
    ) -> Result<Self, ScheduleError> {
        if max_concurrency == 0 {
            return Err(ScheduleError::InvalidConcurrency);
        }
        Ok(Self::with_limit(source, max_concurrency, reducer.boxed()))
    }

    pub(crate) fn with_limit(source: TaskSource, limit: usize, reducer: BoxCoroutine) -> Self {
        Self {
            source,
            limit,
            reducer,
            reducer_started: false,
            reducer_finished: false,
            reducer_outcome: None,
            pending_pull: None,
            next_index: 0,
            exhausted: false,
            tasks: HashMap::new(),
            expecting: HashMap::new(),
            merged: Arc::new(Mutex::new(FuturesUnordered::new())),
            results: VecDeque::new(),
            route: Route::Idle,
            mode: Mode::Normal,
            drain_queue: VecDeque::new(),
            drain_failures: Vec::new(),
            drain_outcome: None,
        }
    }

    // ------------------------------------------------------------
    // Event processing
    // ------------------------------------------------------------

    fn drive(&mut self, mut event: Option<Incoming>) -> Step {
        loop {
            let flow = match event.take() {
                Some(incoming) => self.process(incoming),
                None => self.schedule(),
            };
            match flow {
                Flow::Event(incoming) => event = Some(incoming),
                Flow::Emit(step) => return step,
            }
        }
    }

    fn process(&mut self, incoming: Incoming) -> Flow {
        match incoming {
            Incoming::Reducer(step) => self.process_reducer(step),
            Incoming::Task(index, step) => self.process_task(index, step),
        }
    }

    fn process_reducer(&mut self, step: Step) -> Flow {
        match step {
            Step::Yield(Effect::Ask { name, .. }) if name == pull::NEXT => {
                self.pending_pull = Some(PullKind::Next);
                self.schedule()
            }
            Step::Yield(Effect::Ask { name, .. }) if name == pull::RESULT => {
                self.pending_pull = Some(PullKind::Result);
                self.schedule()
            }
            Step::Yield(Effect::Final(FinalPhase::Start)) if self.draining() => {
                Flow::Event(Incoming::Reducer(self.reducer.resume(Answer::Value(unit()))))
            }
            Step::Yield(Effect::Final(FinalPhase::End(nested))) if self.draining() => {
                self.drain_failures.extend(nested);
                Flow::Event(Incoming::Reducer(self.reducer.resume(Answer::Value(unit()))))
            }
            Step::Yield(effect) => {
                self.route = Route::Reducer;
                Flow::Emit(Step::Yield(effect))
            }
            Step::Done(outcome) => {
                self.reducer_finished = true;
                self.pending_pull = None;
                if self.draining() {
                    self.collect_drain_failure(outcome);
                } else {
                    self.reducer_outcome = Some(outcome);
                }
                self.schedule()
            }
        }
    }

    fn process_task(&mut self, index: usize, step: Step) -> Flow {
        match step {
            Step::Yield(Effect::Await { pending }) => {
                if self.draining() {
                    // A teardown wait detaches like any other so one
                    // slow cleanup cannot serialize the remaining
                    // losers' teardown behind it; it runs to completion.
                    self.expecting.insert(index, None);
                    self.merged
                        .lock()
                        .push(Box::pin(async move { (index, Some(pending.await)) }));
                } else {
                    let (wait, handle) = abortable(pending);
                    self.expecting.insert(index, Some(handle));
                    self.merged.lock().push(Box::pin(async move {
                        match wait.await {
                            Ok(settled) => (index, Some(settled)),
                            Err(_aborted) => (index, None),
                        }
                    }));
                }
                self.schedule()
            }
            Step::Yield(Effect::Final(FinalPhase::Start)) if self.draining() => {
                let step = self.resume_task(index, Answer::Value(unit()));
                Flow::Event(Incoming::Task(index, step))
            }
            Step::Yield(Effect::Final(FinalPhase::End(nested))) if self.draining() => {
                self.drain_failures.extend(nested);
                let step = self.resume_task(index, Answer::Value(unit()));
                Flow::Event(Incoming::Task(index, step))
            }
            Step::Yield(effect) => {
                self.route = Route::Task(index);
                Flow::Emit(Step::Yield(effect))
            }
            Step::Done(outcome) => {
                self.tasks.remove(&index);
                if self.draining() {
                    self.collect_drain_failure(outcome);
                } else {
                    self.results.push_back(match outcome {
                        Outcome::Return(value) => TaskResult::Ok { index, value },
                        Outcome::Fail(error) => TaskResult::Err {
                            index,
                            error: error.with_task_index(index),
                        },
                    });
                }
                self.schedule()
            }
        }
    }

    fn resume_task(&mut self, index: usize, answer: Answer) -> Step {
        self.tasks.get_mut(&index).map_or_else(
            || {
                Step::Done(Outcome::Fail(Failure::protocol(
                    "answer routed to a task that no longer exists",
                )))
            },
            |task| task.resume(answer),
        )
    }

    fn collect_drain_failure(&mut self, outcome: Outcome) {
        if let Outcome::Fail(failure) = outcome {
            if failure.kind() != FailureKind::Cancelled {
                self.drain_failures.push(failure);
            }
        }
    }

    const fn draining(&self) -> bool {
        matches!(self.mode, Mode::Draining)
    }

    // ------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------

    fn schedule(&mut self) -> Flow {
        if self.draining() {
            return self.schedule_drain();
        }

        // A finished reducer decides the scheduler's fate: complete
        // outright, or abandon whatever is still running first.
        if self.reducer_finished {
            if let Some(outcome) = self.reducer_outcome.take() {
                if self.tasks.is_empty() {
                    self.mode = Mode::Finished;
                    return Flow::Emit(Step::Done(outcome));
                }
                self.begin_drain(Some(outcome));
                self.route = Route::Marker;
                return Flow::Emit(Step::Yield(Effect::Final(FinalPhase::Start)));
            }
            self.mode = Mode::Finished;
            return Flow::Emit(Step::Done(Outcome::Fail(Failure::protocol(
                "reducer finished without an outcome",
            ))));
        }

        // Feed the reducer before launching anything new.
        if let Some(kind) = self.pending_pull.take() {
            if let Some(result) = self.results.pop_front() {
                let answer = match kind {
                    PullKind::Next => match result {
                        TaskResult::Ok { value, .. } => {
                            Answer::Value(Box::new(Some(value)) as BoxedValue)
                        }
                        TaskResult::Err { error, .. } => Answer::Failure(error),
                    },
                    PullKind::Result => Answer::Value(Box::new(Some(result)) as BoxedValue),
                };
                return Flow::Event(Incoming::Reducer(self.reducer.resume(answer)));
            }
            self.pending_pull = Some(kind);
        }

        if !self.reducer_started {
            self.reducer_started = true;
            return Flow::Event(Incoming::Reducer(self.reducer.resume(Answer::Start)));
        }

        // Launch while a slot is free.
        if !self.exhausted && self.tasks.len() < self.limit {
            let index = self.next_index;
            if let Some(task) = self.source.pull(index) {
                self.next_index += 1;
                self.tasks.insert(index, task);
                let step = self.resume_task(index, Answer::Start);
                return Flow::Event(Incoming::Task(index, step));
            }
            self.exhausted = true;
        }

        // End of stream.
        if self.exhausted && self.tasks.is_empty() && self.results.is_empty() {
            if let Some(kind) = self.pending_pull.take() {
                let answer = match kind {
                    PullKind::Next => Answer::Value(Box::new(None::<BoxedValue>) as BoxedValue),
                    PullKind::Result => Answer::Value(Box::new(None::<TaskResult>) as BoxedValue),
                };
                return Flow::Event(Incoming::Reducer(self.reducer.resume(answer)));
            }
        }

        // Nothing to do but wait for a settlement.
        if !self.expecting.is_empty() {
            self.route = Route::Merged;
            return Flow::Emit(Step::Yield(Effect::Await {
                pending: merged_wait(Arc::clone(&self.merged)),
            }));
        }

        self.mode = Mode::Finished;
        Flow::Emit(Step::Done(Outcome::Fail(Failure::protocol(
            "scheduler wedged with no runnable work",
        ))))
    }

    fn schedule_drain(&mut self) -> Flow {
        if let Some(target) = self.drain_queue.pop_front() {
            match target {
                DrainTarget::Reducer => {
                    if self.reducer_finished {
                        return self.schedule_drain();
                    }
                    return Flow::Event(Incoming::Reducer(self.reducer.cancel()));
                }
                DrainTarget::Task(index) => {
                    if let Some(task) = self.tasks.get_mut(&index) {
                        let step = task.cancel();
                        return Flow::Event(Incoming::Task(index, step));
                    }
                    return self.schedule_drain();
                }
            }
        }
        // Every target has been cancelled; wait out the teardown waits
        // still in flight before closing the bracket.
        if !self.expecting.is_empty() {
            self.route = Route::Merged;
            return Flow::Emit(Step::Yield(Effect::Await {
                pending: merged_wait(Arc::clone(&self.merged)),
            }));
        }
        self.mode = Mode::Ended;
        self.route = Route::Marker;
        Flow::Emit(Step::Yield(Effect::Final(FinalPhase::End(mem::take(
            &mut self.drain_failures,
        )))))
    }

    fn begin_drain(&mut self, outcome: Option<Outcome>) {
        self.mode = Mode::Draining;
        self.drain_outcome = outcome;
        self.pending_pull = None;
        self.results.clear();
        // Discard outstanding live-path waits so a slow loser cannot
        // stall the teardown; its task is abandoned through cancel
        // instead.
        for (_, handle) in self.expecting.drain() {
            if let Some(handle) = handle {
                handle.abort();
            }
        }
        self.drain_queue.clear();
        if self.reducer_started && !self.reducer_finished {
            self.drain_queue.push_back(DrainTarget::Reducer);
        }
        let mut live: Vec<usize> = self.tasks.keys().copied().collect();
        live.sort_unstable();
        self.drain_queue
            .extend(live.into_iter().map(DrainTarget::Task));
    }
}

impl Coroutine for Concurrent {
    fn resume(&mut self, answer: Answer) -> Step {
        match self.mode {
            Mode::Finished => {
                return Step::Done(Outcome::Fail(Failure::protocol(
                    "scheduler resumed after completion",
                )));
            }
            Mode::Ended => {
                self.mode = Mode::Finished;
                return Step::Done(
                    self.drain_outcome
                        .take()
                        .unwrap_or(Outcome::Fail(Failure::cancelled())),
                );
            }
            Mode::Normal | Mode::Draining => {}
        }

        let event = match mem::replace(&mut self.route, Route::Idle) {
            Route::Idle | Route::Marker => None,
            Route::Reducer => Some(Incoming::Reducer(self.reducer.resume(answer))),
            Route::Task(index) => {
                let step = self.resume_task(index, answer);
                Some(Incoming::Task(index, step))
            }
            Route::Merged => match answer {
                Answer::Value(boxed) => {
                    let (index, slot) = *boxed
                        .downcast::<Settlement>()
                        .expect("merged wait settled with a foreign value");
                    // An aborted wait settles inertly; the same index may
                    // already be parked on a fresh teardown wait, so only
                    // a real settlement claims the expecting entry.
                    match slot {
                        Some(settled) => {
                            if self.expecting.remove(&index).is_some() {
                                let step = self.resume_task(index, settle_answer(settled));
                                Some(Incoming::Task(index, step))
                            } else {
                                None
                            }
                        }
                        None => None,
                    }
                }
                Answer::Failure(failure) => {
                    self.mode = Mode::Finished;
                    return Step::Done(Outcome::Fail(failure));
                }
                Answer::Start | Answer::Absent => {
                    self.mode = Mode::Finished;
                    return Step::Done(Outcome::Fail(Failure::protocol(
                        "mismatched resumption for the merged wait",
                    )));
                }
            },
        };
        self.drive(event)
    }

    fn cancel(&mut self) -> Step {
        match self.mode {
            Mode::Normal => {
                if self.tasks.is_empty() && !self.reducer_started {
                    self.mode = Mode::Finished;
                    return Step::Done(Outcome::Fail(Failure::cancelled()));
                }
                self.begin_drain(None);
                self.route = Route::Marker;
                Step::Yield(Effect::Final(FinalPhase::Start))
            }
            Mode::Draining => {
                // Escalation: abandon whatever teardown step was in
                // flight and keep draining.
                let event = match mem::replace(&mut self.route, Route::Idle) {
                    Route::Reducer => Some(Incoming::Reducer(self.reducer.cancel())),
                    Route::Task(index) => self
                        .tasks
                        .get_mut(&index)
                        .map(|task| Incoming::Task(index, task.cancel())),
                    Route::Idle | Route::Merged | Route::Marker => None,
                };
                self.drain_outcome = None;
                self.drive(event)
            }
            Mode::Ended | Mode::Finished => {
                self.mode = Mode::Finished;
                Step::Done(Outcome::Fail(Failure::cancelled()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::Program;
    use rstest::rstest;

    #[rstest]
    fn zero_concurrency_is_rejected() {
        let source = TaskSource::from_programs([Program::pure(1_i32)]);
        let reducer = Program::pure(()).into_coroutine();
        assert_eq!(
            Concurrent::new(source, 0, reducer).err(),
            Some(ScheduleError::InvalidConcurrency)
        );
    }

    #[rstest]
    fn cancel_before_start_completes_immediately() {
        let source = TaskSource::from_programs([Program::pure(1_i32)]);
        let reducer = Program::pure(()).into_coroutine();
        let mut scheduler = Concurrent::new(source, 1, reducer).unwrap();
        match scheduler.cancel() {
            Step::Done(Outcome::Fail(failure)) => {
                assert_eq!(failure.kind(), FailureKind::Cancelled);
            }
            step => panic!("expected immediate cancellation, got {step:?}"),
        }
    }
}
