use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use tokio::time::{self, Instant};
use tokio_test::{assert_err, assert_ok};

use super::{
    AutoscaleConfig, AutoscaledPool, ConcurrencySettings, PoolError, PoolState, SnapshotterError,
    events::EventBus,
    instant_now,
    snapshot::CpuSnapshot,
    snapshotter::{Snapshotter, SnapshotterConfig},
    system_status::{LoadEvaluator, LoadEvaluatorConfig},
};
use crate::{Error as CrateError, test_utils::trace_init};

fn evaluator() -> LoadEvaluator {
    let snapshotter = Arc::new(Snapshotter::new(
        Arc::new(EventBus::default()),
        SnapshotterConfig::default(),
    ));
    LoadEvaluator::new(snapshotter, LoadEvaluatorConfig::default())
}

fn active_evaluator() -> LoadEvaluator {
    let evaluator = evaluator();
    assert_ok!(evaluator.snapshotter().start());
    evaluator
}

fn fixed(concurrency: usize) -> ConcurrencySettings {
    ConcurrencySettings::builder()
        .min_concurrency(concurrency)
        .max_concurrency(concurrency)
        .build()
        .unwrap()
}

/// Task that sleeps for `duration`, then bumps `completed`.
fn sleeping_task(
    duration: Duration,
    completed: &Arc<AtomicUsize>,
) -> impl Fn() -> BoxFuture<'static, Result<(), CrateError>> + Send + Sync + 'static {
    let completed = Arc::clone(completed);
    move || {
        let completed = Arc::clone(&completed);
        async move {
            time::sleep(duration).await;
            completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    }
}

fn at_least(
    counter: &Arc<AtomicUsize>,
    target: usize,
) -> impl Fn() -> futures::future::Ready<bool> + Send + Sync + 'static {
    let counter = Arc::clone(counter);
    move || futures::future::ready(counter.load(Ordering::SeqCst) >= target)
}

fn always(value: bool) -> impl Fn() -> futures::future::Ready<bool> + Send + Sync + 'static {
    move || futures::future::ready(value)
}

#[tokio::test]
async fn dispatches_in_parallel() {
    trace_init();
    time::pause();
    let completed = Arc::new(AtomicUsize::new(0));
    let pool = AutoscaledPool::new(
        active_evaluator(),
        fixed(10),
        sleeping_task(Duration::from_millis(100), &completed),
        always(true),
        at_least(&completed, 10),
    );

    let started = Instant::now();
    assert_ok!(pool.run().await);

    assert!(started.elapsed() < Duration::from_millis(300));
    assert!(completed.load(Ordering::SeqCst) >= 10);
    assert_eq!(pool.current_concurrency(), 0);
    assert_eq!(pool.state(), PoolState::Finished);
}

#[tokio::test]
async fn respects_max_tasks_per_minute() {
    trace_init();
    time::pause();
    let completed = Arc::new(AtomicUsize::new(0));
    let settings = ConcurrencySettings::builder()
        .min_concurrency(1)
        .max_concurrency(1)
        .desired_concurrency(1)
        .max_tasks_per_minute(120.0)
        .build()
        .unwrap();
    let pool = Arc::new(AutoscaledPool::new(
        active_evaluator(),
        settings,
        sleeping_task(Duration::from_millis(100), &completed),
        always(true),
        always(false),
    ));

    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    time::sleep(Duration::from_millis(500)).await;
    assert!(completed.load(Ordering::SeqCst) <= 1);

    time::sleep(Duration::from_millis(550)).await;
    assert_eq!(completed.load(Ordering::SeqCst), 2);

    assert_ok!(pool.abort());
    assert_ok!(assert_ok!(run.await));
}

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn abort_cancels_in_flight_tasks() {
    trace_init();
    time::pause();
    let dropped = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let task = {
        let dropped = Arc::clone(&dropped);
        let completed = Arc::clone(&completed);
        move || {
            let guard = DropCounter(Arc::clone(&dropped));
            let completed = Arc::clone(&completed);
            async move {
                time::sleep(Duration::from_secs(60)).await;
                completed.fetch_add(1, Ordering::SeqCst);
                drop(guard);
                Ok::<(), CrateError>(())
            }
        }
    };
    let pool = Arc::new(AutoscaledPool::new(
        active_evaluator(),
        fixed(10),
        task,
        always(true),
        always(false),
    ));

    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.current_concurrency(), 10);

    let aborted_at = Instant::now();
    assert_ok!(pool.abort());
    assert_eq!(pool.current_concurrency(), 0);

    let outcome = assert_ok!(time::timeout(Duration::from_millis(200), run).await);
    assert_ok!(assert_ok!(outcome));
    assert!(aborted_at.elapsed() < Duration::from_millis(200));
    assert_eq!(pool.state(), PoolState::Aborted);

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(dropped.load(Ordering::SeqCst), 10);
    assert_eq!(completed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn task_failure_is_returned_after_drain_and_pool_is_reusable() {
    trace_init();
    time::pause();
    let invocations = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let task = {
        let invocations = Arc::clone(&invocations);
        let completed = Arc::clone(&completed);
        move || {
            let invocation = invocations.fetch_add(1, Ordering::SeqCst) + 1;
            let completed = Arc::clone(&completed);
            async move {
                time::sleep(Duration::from_millis(10)).await;
                if invocation == 6 {
                    return Err::<(), CrateError>("invocation 6 failed".into());
                }
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    };
    let pool = AutoscaledPool::new(
        active_evaluator(),
        fixed(3),
        task,
        always(true),
        at_least(&completed, 20),
    );

    let error = assert_err!(pool.run().await);
    assert!(matches!(error, PoolError::TaskFailed { .. }));
    assert!(completed.load(Ordering::SeqCst) < 20);
    assert_eq!(pool.state(), PoolState::Failed);
    assert_eq!(pool.current_concurrency(), 0);
    let source = error.into_task_error().unwrap();
    assert_eq!(source.to_string(), "invocation 6 failed");

    // A failed pool accepts a fresh run.
    assert_ok!(pool.run().await);
    assert!(completed.load(Ordering::SeqCst) >= 20);
    assert_eq!(pool.state(), PoolState::Finished);
}

#[tokio::test]
async fn failure_wins_over_completion() {
    trace_init();
    time::pause();
    let done = Arc::new(AtomicBool::new(false));
    let task = {
        let done = Arc::clone(&done);
        move || {
            let done = Arc::clone(&done);
            async move {
                done.store(true, Ordering::SeqCst);
                Err::<(), CrateError>("late failure".into())
            }
        }
    };
    let is_finished = {
        let done = Arc::clone(&done);
        move || futures::future::ready(done.load(Ordering::SeqCst))
    };
    let pool = AutoscaledPool::new(active_evaluator(), fixed(1), task, always(true), is_finished);

    let error = assert_err!(pool.run().await);
    assert!(matches!(error, PoolError::TaskFailed { .. }));
}

#[tokio::test]
async fn waits_briefly_when_no_task_is_ready() {
    trace_init();
    time::pause();
    let ready_checks = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let opened_at = Instant::now() + Duration::from_millis(200);
    let is_task_ready = {
        let ready_checks = Arc::clone(&ready_checks);
        move || {
            ready_checks.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Instant::now() >= opened_at)
        }
    };
    let pool = AutoscaledPool::new(
        active_evaluator(),
        fixed(2),
        sleeping_task(Duration::from_millis(10), &completed),
        is_task_ready,
        at_least(&completed, 4),
    );

    assert_ok!(pool.run().await);
    assert!(Instant::now() >= opened_at);
    // Roughly one check per dispatch wait before work shows up, not a busy loop.
    assert!(ready_checks.load(Ordering::SeqCst) < 20);
}

#[tokio::test]
async fn scales_up_while_idle_and_saturated() {
    trace_init();
    time::pause();
    let completed = Arc::new(AtomicUsize::new(0));
    let settings = ConcurrencySettings::builder()
        .min_concurrency(1)
        .max_concurrency(3)
        .build()
        .unwrap();
    let config = AutoscaleConfig::builder()
        .autoscale_interval(Duration::from_secs(1))
        .build()
        .unwrap();
    let pool = Arc::new(
        AutoscaledPool::new(
            active_evaluator(),
            settings,
            sleeping_task(Duration::from_secs(3600), &completed),
            always(true),
            always(false),
        )
        .with_config(config),
    );
    assert_eq!(pool.desired_concurrency(), 1);

    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    for _ in 0..6 {
        time::sleep(Duration::from_millis(500)).await;
        let desired = pool.desired_concurrency();
        assert!((1..=3).contains(&desired));
        assert!(pool.current_concurrency() <= desired);
    }
    assert_eq!(pool.desired_concurrency(), 3);

    assert_ok!(pool.abort());
    assert_ok!(assert_ok!(run.await));
}

#[tokio::test]
async fn scales_down_while_overloaded() {
    trace_init();
    time::pause();
    let evaluator = active_evaluator();
    let snapshotter = Arc::clone(evaluator.snapshotter());
    let now = instant_now();
    for _ in 0..5 {
        assert_ok!(snapshotter.record(CpuSnapshot {
            used_ratio: 1.0,
            max_used_ratio: 0.95,
            created_at: now,
        }));
    }

    let completed = Arc::new(AtomicUsize::new(0));
    let settings = ConcurrencySettings::builder()
        .min_concurrency(2)
        .max_concurrency(10)
        .desired_concurrency(5)
        .build()
        .unwrap();
    let config = AutoscaleConfig::builder()
        .autoscale_interval(Duration::from_secs(1))
        .build()
        .unwrap();
    let pool = Arc::new(
        AutoscaledPool::new(
            evaluator,
            settings,
            sleeping_task(Duration::from_secs(3600), &completed),
            always(true),
            always(false),
        )
        .with_config(config),
    );

    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.desired_concurrency(), 5);
    time::sleep(Duration::from_millis(4_000)).await;
    assert_eq!(pool.desired_concurrency(), 2);
    // Running invocations are not cancelled by a scale-down.
    assert_eq!(pool.current_concurrency(), 5);

    assert_ok!(pool.abort());
    assert_ok!(assert_ok!(run.await));
}

#[tokio::test]
async fn lifecycle_errors() {
    trace_init();
    let completed = Arc::new(AtomicUsize::new(0));

    let inactive = AutoscaledPool::new(
        evaluator(),
        fixed(1),
        sleeping_task(Duration::ZERO, &completed),
        always(true),
        always(true),
    );
    assert!(matches!(
        inactive.run().await,
        Err(PoolError::Snapshotter {
            source: SnapshotterError::NotActive
        })
    ));
    assert!(matches!(inactive.abort(), Err(PoolError::NotRunning)));
    assert_eq!(inactive.state(), PoolState::Idle);

    time::pause();
    let pool = Arc::new(AutoscaledPool::new(
        active_evaluator(),
        fixed(1),
        sleeping_task(Duration::from_secs(60), &completed),
        always(true),
        always(false),
    ));
    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });
    time::sleep(Duration::from_millis(10)).await;

    assert!(matches!(pool.run().await, Err(PoolError::AlreadyRunning)));
    assert_ok!(pool.abort());
    assert_ok!(assert_ok!(run.await));
    assert!(matches!(pool.abort(), Err(PoolError::NotRunning)));
}

#[tokio::test]
async fn stopping_the_snapshotter_mid_run_fails_the_run() {
    trace_init();
    time::pause();
    let evaluator = active_evaluator();
    let snapshotter = Arc::clone(evaluator.snapshotter());
    let completed = Arc::new(AtomicUsize::new(0));
    let config = AutoscaleConfig::builder()
        .autoscale_interval(Duration::from_millis(100))
        .build()
        .unwrap();
    let pool = Arc::new(
        AutoscaledPool::new(
            evaluator,
            fixed(2),
            sleeping_task(Duration::from_secs(60), &completed),
            always(true),
            always(false),
        )
        .with_config(config),
    );
    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    time::sleep(Duration::from_millis(50)).await;
    snapshotter.stop().await;

    let outcome = assert_ok!(run.await);
    assert!(matches!(
        outcome,
        Err(PoolError::Snapshotter {
            source: SnapshotterError::NotActive
        })
    ));
    assert_eq!(pool.current_concurrency(), 0);
}

/// Readiness that answers at once on the first call and takes `slow` afterwards.
fn slow_after_first(
    slow: Duration,
) -> impl Fn() -> BoxFuture<'static, bool> + Send + Sync + 'static {
    let calls = Arc::new(AtomicUsize::new(0));
    move || {
        let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
        async move {
            if !first {
                time::sleep(slow).await;
            }
            true
        }
        .boxed()
    }
}

#[tokio::test]
async fn completions_are_reaped_while_readiness_is_pending() {
    trace_init();
    time::pause();
    let completed = Arc::new(AtomicUsize::new(0));
    let config = AutoscaleConfig::builder()
        .autoscale_interval(Duration::from_millis(500))
        .build()
        .unwrap();
    let pool = Arc::new(
        AutoscaledPool::new(
            active_evaluator(),
            fixed(2),
            sleeping_task(Duration::from_secs(1), &completed),
            slow_after_first(Duration::from_secs(5)),
            always(false),
        )
        .with_config(config),
    );
    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.current_concurrency(), 1);

    time::sleep(Duration::from_secs(2)).await;
    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.current_concurrency(), 0);
    assert_eq!(pool.state(), PoolState::Running);

    assert_ok!(pool.abort());
    assert_ok!(assert_ok!(run.await));
}

#[tokio::test]
async fn failure_during_pending_readiness_starts_nothing_more() {
    trace_init();
    time::pause();
    let started = Arc::new(AtomicUsize::new(0));
    let task = {
        let started = Arc::clone(&started);
        move || {
            started.fetch_add(1, Ordering::SeqCst);
            async move {
                time::sleep(Duration::from_secs(1)).await;
                Err::<(), CrateError>("downstream refused".into())
            }
        }
    };
    let pool = Arc::new(AutoscaledPool::new(
        active_evaluator(),
        fixed(2),
        task,
        slow_after_first(Duration::from_secs(5)),
        always(false),
    ));
    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    time::sleep(Duration::from_secs(2)).await;
    assert!(run.is_finished());
    assert_eq!(pool.current_concurrency(), 0);

    let error = assert_err!(assert_ok!(run.await));
    assert!(matches!(error, PoolError::TaskFailed { .. }));

    time::sleep(Duration::from_secs(10)).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn vanishing_task_rate_does_not_panic() {
    trace_init();
    time::pause();
    let completed = Arc::new(AtomicUsize::new(0));
    let settings = ConcurrencySettings::builder()
        .max_tasks_per_minute(1e-300)
        .build()
        .unwrap();
    let pool = Arc::new(AutoscaledPool::new(
        active_evaluator(),
        settings,
        sleeping_task(Duration::from_millis(10), &completed),
        always(true),
        always(false),
    ));
    let run = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    time::sleep(Duration::from_millis(100)).await;
    assert!(!run.is_finished());
    assert_eq!(completed.load(Ordering::SeqCst), 1);

    assert_ok!(pool.abort());
    assert_ok!(assert_ok!(run.await));
}
