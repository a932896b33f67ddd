//! The asynchronous driver: settled waits, cancellation, and teardown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use effluent::effect::ProgramCoroutine;
use effluent::prelude::*;

type Log = Arc<Mutex<Vec<&'static str>>>;

fn record(log: &Log, entry: &'static str) -> ProgramCoroutine {
    let log = Arc::clone(log);
    Program::pure(())
        .fmap(move |()| log.lock().push(entry))
        .into_coroutine()
}

fn sleep_then(duration: Duration, value: i32) -> Program<i32> {
    await_future(async move {
        tokio::time::sleep(duration).await;
        Ok(value)
    })
}

#[tokio::test(start_paused = true)]
async fn awaited_values_flow_back_into_the_program() {
    let program = sleep_then(Duration::from_millis(10), 20)
        .flat_map(|first| sleep_then(Duration::from_millis(10), first + 2));
    let completion = run_async(program.into_coroutine(), CancelToken::never()).await;
    assert_eq!(completion.downcast::<i32>().unwrap(), 22);
}

#[tokio::test(start_paused = true)]
async fn a_failed_wait_is_recoverable_by_an_enclosing_scope() {
    let program = await_future::<i32, _>(async { Err(Failure::new("io").with_payload(5_i32)) });
    // The await's failure surfaces as the program's failure, so the run
    // reports it; handlers recover raises, not native failures.
    let completion = run_async(program.into_coroutine(), CancelToken::never()).await;
    match completion.result {
        Err(RunError::Failed(failure)) => {
            assert_eq!(failure.message(), "io");
            assert_eq!(failure.payload::<i32>(), Some(&5));
        }
        other => panic!("expected the await's failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_a_live_wait_and_runs_cleanup() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let body = sleep_then(Duration::from_secs(3600), 0);
    let scope = scoped(body.into_coroutine()).finally(record(&log, "cleanup"));

    let source = CancelSource::new();
    let token = source.token();
    let (completion, ()) = tokio::join!(run_async(scope, token), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        source.cancel();
    });

    assert!(matches!(completion.result, Err(RunError::Cancelled)));
    assert_eq!(*log.lock(), vec!["cleanup"]);
    assert!(completion.cleanup_errors.is_empty());
}

#[tokio::test(start_paused = true)]
async fn teardown_waits_run_to_completion() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&log);
    let cleanup = await_future(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        observed.lock().push("flushed");
        Ok(())
    })
    .into_coroutine();
    let scope = scoped(sleep_then(Duration::from_secs(3600), 0).into_coroutine()).finally(cleanup);

    let source = CancelSource::new();
    let token = source.token();
    let (completion, ()) = tokio::join!(run_async(scope, token), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        source.cancel();
    });

    assert!(matches!(completion.result, Err(RunError::Cancelled)));
    assert_eq!(*log.lock(), vec!["flushed"]);
}

#[tokio::test(start_paused = true)]
async fn teardown_failures_reach_the_report_not_the_result() {
    let cleanup = Program::<()>::fail(Failure::new("release failed")).into_coroutine();
    let scope = scoped(sleep_then(Duration::from_secs(3600), 0).into_coroutine()).finally(cleanup);

    let source = CancelSource::new();
    let token = source.token();
    let (completion, ()) = tokio::join!(run_async(scope, token), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        source.cancel();
    });

    assert!(matches!(completion.result, Err(RunError::Cancelled)));
    assert_eq!(completion.cleanup_errors.len(), 1);
    assert_eq!(completion.cleanup_errors[0].message(), "release failed");
}

#[tokio::test(start_paused = true)]
async fn a_resolved_outcome_survives_an_unanswered_teardown_request() {
    let cleanup = ask::<i32>("db").fmap(|_| ()).into_coroutine();
    let body = scoped(
        sleep_then(Duration::from_millis(5), 0)
            .then(raise::<i32>("bad", 2_i32))
            .into_coroutine(),
    )
    .finally(cleanup);
    let scope = scoped(body).handle(Handlers::new().resolve("bad", |n: i32| n * 21));

    let completion = run_async(scope, CancelToken::never()).await;
    assert!(!completion.cleanup_errors.is_empty());
    assert_eq!(completion.downcast::<i32>().unwrap(), 42);
}

#[tokio::test(start_paused = true)]
async fn an_already_cancelled_token_stops_the_run_before_it_starts() {
    let source = CancelSource::new();
    source.cancel();
    let completion =
        run_async(Program::pure(1_i32).into_coroutine(), source.token()).await;
    assert!(matches!(completion.result, Err(RunError::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn delay_completes_when_left_alone() {
    let program = delay(Duration::from_millis(25), CancelToken::never()).fmap(|()| "done");
    let completion = run_async(program.into_coroutine(), CancelToken::never()).await;
    assert_eq!(completion.downcast::<&str>().unwrap(), "done");
}

#[tokio::test(start_paused = true)]
async fn delay_fails_early_when_its_token_fires() {
    let source = CancelSource::new();
    let program = delay(Duration::from_secs(3600), source.token());

    let (completion, ()) = tokio::join!(
        run_async(program.into_coroutine(), CancelToken::never()),
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            source.cancel();
        }
    );

    match completion.result {
        Err(RunError::Failed(failure)) => {
            assert_eq!(failure.kind(), FailureKind::Cancelled);
        }
        other => panic!("expected the delay's failure, got {other:?}"),
    }
}
