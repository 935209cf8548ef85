//! The admission-control loop.
//!
//! While a run is active two loops share one `select!`:
//!
//! - the autoscale loop reads the historical load on a fixed interval and moves the
//!   desired concurrency one step up (system idle and the current allowance is used)
//!   or one step down (system overloaded);
//! - the dispatch loop starts task invocations while work is ready, the current
//!   concurrency is below the desired one and the starts-per-minute budget allows.
//!
//! The caller's `is_finished` and `is_task_ready` calls are branches of that same
//! `select!`, so completions, failures and ticks are handled while they are pending.

use std::{
    future::{self, Future},
    mem,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bon::bon;
use futures::{FutureExt, future::BoxFuture};
use tokio::{
    task::JoinSet,
    time::{Instant, MissedTickBehavior, interval_at, sleep_until},
};
use tokio_util::sync::CancellationToken;

use super::{
    ConcurrencySettings, ConfigError, ensure_non_zero, ensure_ratio,
    error::{PoolError, SnapshotterError},
    instant_now,
    internal_event::{
        AutoscaledPoolConcurrency, AutoscaledPoolConcurrencyHandle, AutoscaledPoolScaled,
        AutoscaledPoolScaledHandle, ConcurrencyData, ScaleData,
    },
    rate::{MAX_WAIT, StartBudget},
    system_status::LoadEvaluator,
};
use crate::Error as CrateError;

type TaskFn = Box<dyn Fn() -> BoxFuture<'static, Result<(), CrateError>> + Send + Sync>;
type PredicateFn = Box<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Lifecycle of an [`AutoscaledPool`]. The outcome of the last run is kept until the
/// next run starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolState {
    Idle,
    Running,
    Finished,
    Aborted,
    Failed,
}

/// Timing and step tunables for the autoscale and dispatch loops.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `autoscale_interval` | 10 s | How often the desired concurrency is re-evaluated |
/// | `logging_interval` | 60 s | How often the pool status is logged |
/// | `dispatch_wait` | 50 ms | Wait before asking again when no task is ready |
/// | `scale_up_step_ratio` | 0.05 | Step up is `ceil(desired * ratio)`, at least 1 |
/// | `scale_down_step_ratio` | 0.05 | Step down is `ceil(desired * ratio)`, at least 1 |
/// | `desired_concurrency_ratio` | 0.95 | Minimum `current / desired` before scaling up |
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AutoscaleConfig {
    pub(super) autoscale_interval: Duration,
    pub(super) logging_interval: Duration,
    pub(super) dispatch_wait: Duration,
    pub(super) scale_up_step_ratio: f64,
    pub(super) scale_down_step_ratio: f64,
    pub(super) desired_concurrency_ratio: f64,
}

#[bon]
impl AutoscaleConfig {
    #[builder]
    pub fn new(
        #[builder(default = Duration::from_secs(10))] autoscale_interval: Duration,
        #[builder(default = Duration::from_secs(60))] logging_interval: Duration,
        #[builder(default = Duration::from_millis(50))] dispatch_wait: Duration,
        #[builder(default = 0.05)] scale_up_step_ratio: f64,
        #[builder(default = 0.05)] scale_down_step_ratio: f64,
        #[builder(default = 0.95)] desired_concurrency_ratio: f64,
    ) -> Result<Self, ConfigError> {
        ensure_non_zero("autoscale_interval", autoscale_interval)?;
        ensure_non_zero("logging_interval", logging_interval)?;
        ensure_non_zero("dispatch_wait", dispatch_wait)?;
        ensure_ratio("scale_up_step_ratio", scale_up_step_ratio)?;
        ensure_ratio("scale_down_step_ratio", scale_down_step_ratio)?;
        ensure_ratio("desired_concurrency_ratio", desired_concurrency_ratio)?;

        Ok(Self {
            autoscale_interval,
            logging_interval,
            dispatch_wait,
            scale_up_step_ratio,
            scale_down_step_ratio,
            desired_concurrency_ratio,
        })
    }
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            autoscale_interval: Duration::from_secs(10),
            logging_interval: Duration::from_secs(60),
            dispatch_wait: Duration::from_millis(50),
            scale_up_step_ratio: 0.05,
            scale_down_step_ratio: 0.05,
            desired_concurrency_ratio: 0.95,
        }
    }
}

fn step(desired: usize, ratio: f64) -> usize {
    ((desired as f64 * ratio).ceil() as usize).max(1)
}

/// The desired concurrency after one autoscale tick.
fn next_desired(
    settings: &ConcurrencySettings,
    config: &AutoscaleConfig,
    desired: usize,
    current: usize,
    system_idle: bool,
) -> usize {
    if system_idle {
        let utilization = current as f64 / desired as f64;
        if utilization >= config.desired_concurrency_ratio {
            return settings.clamp(desired + step(desired, config.scale_up_step_ratio));
        }
        desired
    } else {
        settings.clamp(desired.saturating_sub(step(desired, config.scale_down_step_ratio)))
    }
}

struct RunSlot {
    state: PoolState,
    abort: Option<CancellationToken>,
}

enum Outcome {
    Finished,
    Aborted,
    Failed(CrateError),
    Evaluator(SnapshotterError),
}

/// Where the dispatch side of the run loop stands. Predicate calls are held here so
/// the run loop keeps reaping completions and ticking while they are pending.
enum Step {
    /// Nothing pending; the next iteration asks `is_finished`.
    Idle,
    CheckFinished(BoxFuture<'static, bool>),
    CheckReady(BoxFuture<'static, bool>),
    /// Look for work again at this instant.
    Wait(Instant),
    /// Wait for a completion or an autoscale tick.
    Parked,
    Done,
}

impl Step {
    fn is_checking(&self) -> bool {
        matches!(self, Step::CheckFinished(_) | Step::CheckReady(_))
    }

    fn wake_at(&self) -> Option<Instant> {
        match self {
            Step::Wait(at) => Some(*at),
            _ => None,
        }
    }

    /// Resolves with the pending predicate's answer. Never resolves otherwise.
    async fn answer(&mut self) -> bool {
        match self {
            Step::CheckFinished(check) | Step::CheckReady(check) => check.await,
            _ => future::pending().await,
        }
    }
}

/// `now + wait`, saturating far in the future instead of overflowing.
fn deadline_after(now: Instant, wait: Duration) -> Instant {
    now.checked_add(wait).unwrap_or_else(|| now + MAX_WAIT)
}

/// Runs a task routine many times concurrently, scaling the number of concurrent
/// invocations to the load reported by a [`LoadEvaluator`].
///
/// The pool is re-entrant: once a run has finished, failed or been aborted, `run()`
/// may be called again.
pub struct AutoscaledPool {
    evaluator: LoadEvaluator,
    settings: ConcurrencySettings,
    config: AutoscaleConfig,
    run_task: TaskFn,
    is_task_ready: PredicateFn,
    is_finished: PredicateFn,
    desired_concurrency: AtomicUsize,
    current_concurrency: AtomicUsize,
    slot: Mutex<RunSlot>,
}

impl AutoscaledPool {
    /// - `run_task` performs one unit of work.
    /// - `is_task_ready` tells whether work is available right now.
    /// - `is_finished` tells whether no more work will ever become available.
    pub fn new<T, TFut, R, RFut, F, FFut>(
        evaluator: LoadEvaluator,
        settings: ConcurrencySettings,
        run_task: T,
        is_task_ready: R,
        is_finished: F,
    ) -> Self
    where
        T: Fn() -> TFut + Send + Sync + 'static,
        TFut: Future<Output = Result<(), CrateError>> + Send + 'static,
        R: Fn() -> RFut + Send + Sync + 'static,
        RFut: Future<Output = bool> + Send + 'static,
        F: Fn() -> FFut + Send + Sync + 'static,
        FFut: Future<Output = bool> + Send + 'static,
    {
        Self {
            evaluator,
            settings,
            config: AutoscaleConfig::default(),
            run_task: Box::new(move || run_task().boxed()),
            is_task_ready: Box::new(move || is_task_ready().boxed()),
            is_finished: Box::new(move || is_finished().boxed()),
            desired_concurrency: AtomicUsize::new(settings.desired_concurrency()),
            current_concurrency: AtomicUsize::new(0),
            slot: Mutex::new(RunSlot {
                state: PoolState::Idle,
                abort: None,
            }),
        }
    }

    pub fn with_config(mut self, config: AutoscaleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn settings(&self) -> &ConcurrencySettings {
        &self.settings
    }

    pub fn evaluator(&self) -> &LoadEvaluator {
        &self.evaluator
    }

    /// Number of task invocations in flight right now.
    ///
    /// No invocation starts while this is at or above
    /// [`desired_concurrency`](Self::desired_concurrency), but a scale-down does not
    /// cancel running invocations. Right after one this can exceed the desired
    /// concurrency until enough invocations finish.
    pub fn current_concurrency(&self) -> usize {
        self.current_concurrency.load(Ordering::Acquire)
    }

    /// Number of concurrent invocations the pool is currently aiming for. Always within
    /// the settings' `[min_concurrency, max_concurrency]`; it may drop below
    /// [`current_concurrency`](Self::current_concurrency) when the pool scales down.
    pub fn desired_concurrency(&self) -> usize {
        self.desired_concurrency.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PoolState {
        self.lock_slot().state
    }

    /// Runs until `is_finished` holds and every invocation has completed.
    ///
    /// The first error returned by a task invocation stops new starts; once the
    /// in-flight invocations drain it is returned as [`PoolError::TaskFailed`].
    /// An [`abort`](Self::abort) makes this return `Ok(())` right away.
    pub async fn run(&self) -> Result<(), PoolError> {
        let token = self.begin_run()?;
        let _guard = RunGuard { pool: self };

        info!(
            message = "Starting the pool.",
            min_concurrency = self.settings.min_concurrency(),
            max_concurrency = self.settings.max_concurrency(),
            desired_concurrency = self.desired_concurrency(),
        );

        let outcome = self.drive(&token).await;
        let (state, result) = match outcome {
            Outcome::Finished => {
                info!("All tasks finished.");
                (PoolState::Finished, Ok(()))
            }
            Outcome::Aborted => {
                info!("The pool was aborted.");
                (PoolState::Aborted, Ok(()))
            }
            Outcome::Failed(source) => {
                error!(message = "A task failed; the pool stopped.", error = %source);
                (PoolState::Failed, Err(PoolError::TaskFailed { source }))
            }
            Outcome::Evaluator(source) => {
                error!(message = "Load evaluation failed; the pool stopped.", error = %source);
                (PoolState::Failed, Err(PoolError::Snapshotter { source }))
            }
        };
        self.lock_slot().state = state;
        result
    }

    /// Cancels every in-flight invocation and makes the running `run()` return
    /// without an error. Fails with [`PoolError::NotRunning`] outside a run.
    pub fn abort(&self) -> Result<(), PoolError> {
        let slot = self.lock_slot();
        let token = match (&slot.state, &slot.abort) {
            (PoolState::Running, Some(token)) => token,
            _ => return Err(PoolError::NotRunning),
        };
        token.cancel();
        self.current_concurrency.store(0, Ordering::Release);
        info!("Aborting the pool.");
        Ok(())
    }

    fn begin_run(&self) -> Result<CancellationToken, PoolError> {
        let mut slot = self.lock_slot();
        if slot.state == PoolState::Running {
            return Err(PoolError::AlreadyRunning);
        }
        if !self.evaluator.snapshotter().is_active() {
            return Err(PoolError::Snapshotter {
                source: SnapshotterError::NotActive,
            });
        }

        let token = CancellationToken::new();
        slot.state = PoolState::Running;
        slot.abort = Some(token.clone());
        self.desired_concurrency
            .store(self.settings.desired_concurrency(), Ordering::Release);
        self.current_concurrency.store(0, Ordering::Release);
        Ok(token)
    }

    async fn drive(&self, token: &CancellationToken) -> Outcome {
        let mut in_flight: JoinSet<Result<(), CrateError>> = JoinSet::new();
        let mut budget = StartBudget::new(self.settings.max_tasks_per_minute(), instant_now());
        let mut failure: Option<CrateError> = None;
        let mut step = Step::Idle;

        let start = Instant::now();
        let mut autoscale_ticks = interval_at(
            deadline_after(start, self.config.autoscale_interval),
            self.config.autoscale_interval,
        );
        autoscale_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status_ticks = interval_at(
            deadline_after(start, self.config.logging_interval),
            self.config.logging_interval,
        );
        status_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let concurrency_event = AutoscaledPoolConcurrency.register();
        let scaled_event = AutoscaledPoolScaled.register();

        loop {
            if token.is_cancelled() {
                in_flight.abort_all();
                return Outcome::Aborted;
            }

            if let Some(source) = failure.take() {
                if in_flight.is_empty() {
                    return Outcome::Failed(source);
                }
                failure = Some(source);
            } else if matches!(step, Step::Idle) {
                step = Step::CheckFinished((self.is_finished)());
            }

            let wake_at = step.wake_at();
            tokio::select! {
                biased;

                _ = token.cancelled() => {}

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.release_slot();
                    let result = joined.unwrap_or_else(|join_error| Err(Box::new(join_error) as CrateError));
                    if let Err(source) = result {
                        if failure.is_none() {
                            warn!(
                                message = "Task failed; no new tasks will be started.",
                                error = %source,
                                in_flight = in_flight.len(),
                            );
                            failure = Some(source);
                        } else {
                            debug!(message = "Another task failed while draining.", error = %source);
                        }
                        // Drops a pending predicate call along with the chance to start from it.
                        step = Step::Parked;
                    } else if failure.is_none() && matches!(step, Step::Parked) {
                        step = Step::Idle;
                    }
                }

                _ = autoscale_ticks.tick() => {
                    if let Err(source) = self.autoscale(&scaled_event, &concurrency_event) {
                        in_flight.abort_all();
                        return Outcome::Evaluator(source);
                    }
                    if failure.is_none() && matches!(step, Step::Parked) {
                        step = Step::Idle;
                    }
                }

                _ = status_ticks.tick() => self.log_status(),

                answer = step.answer(), if step.is_checking() => {
                    step = match mem::replace(&mut step, Step::Idle) {
                        Step::CheckFinished(_) => self.on_finished_checked(answer, &in_flight),
                        Step::CheckReady(_) if failure.is_none() => {
                            self.on_ready_checked(answer, &mut in_flight, &mut budget)
                        }
                        _ => Step::Parked,
                    };
                    if matches!(step, Step::Done) {
                        return Outcome::Finished;
                    }
                }

                _ = sleep_until(wake_at.unwrap_or(start)), if wake_at.is_some() => {
                    step = Step::Idle;
                }
            }
        }
    }

    fn on_finished_checked(
        &self,
        finished: bool,
        in_flight: &JoinSet<Result<(), CrateError>>,
    ) -> Step {
        match (finished, in_flight.is_empty()) {
            (true, true) => Step::Done,
            // Wait for the stragglers, then ask again.
            (true, false) => Step::Parked,
            (false, _) => self.next_ready_check(),
        }
    }

    /// Starts one invocation if the answer and the budget allow it, then decides what
    /// to wait for next.
    fn on_ready_checked(
        &self,
        ready: bool,
        in_flight: &mut JoinSet<Result<(), CrateError>>,
        budget: &mut StartBudget,
    ) -> Step {
        if !ready {
            return Step::Wait(deadline_after(Instant::now(), self.config.dispatch_wait));
        }
        // Desired may have dropped while the predicate was pending.
        if self.current_concurrency() >= self.desired_concurrency() {
            return Step::Parked;
        }
        if let Err(wait) = budget.try_acquire(instant_now()) {
            trace!(message = "Task start budget exhausted.", wait_ms = wait.as_millis());
            return Step::Wait(deadline_after(Instant::now(), wait));
        }

        in_flight.spawn((self.run_task)());
        let current = self.current_concurrency.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(message = "Task started.", current_concurrency = current);
        self.next_ready_check()
    }

    fn next_ready_check(&self) -> Step {
        if self.current_concurrency() < self.desired_concurrency() {
            Step::CheckReady((self.is_task_ready)())
        } else {
            Step::Parked
        }
    }

    fn release_slot(&self) {
        let _ = self
            .current_concurrency
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(1))
            });
    }

    fn autoscale(
        &self,
        scaled_event: &AutoscaledPoolScaledHandle,
        concurrency_event: &AutoscaledPoolConcurrencyHandle,
    ) -> Result<(), SnapshotterError> {
        let info = self.evaluator.get_historical_system_info()?;
        let desired = self.desired_concurrency();
        let current = self.current_concurrency();
        let next = next_desired(
            &self.settings,
            &self.config,
            desired,
            current,
            info.is_system_idle(),
        );

        if next != desired {
            self.desired_concurrency.store(next, Ordering::Release);
            scaled_event.emit(ScaleData {
                from: desired,
                to: next,
            });
        }
        if next < desired {
            debug!(
                message = "System is overloaded; scaling down.",
                cpu = info.cpu.actual_ratio,
                memory = info.memory.actual_ratio,
                event_loop = info.event_loop.actual_ratio,
                client = info.client.actual_ratio,
                desired_concurrency = next,
            );
        }
        concurrency_event.emit(ConcurrencyData {
            desired: next,
            current,
        });
        Ok(())
    }

    fn log_status(&self) {
        match self.evaluator.get_current_system_info() {
            Ok(info) => info!(
                message = "Pool status.",
                current_concurrency = self.current_concurrency(),
                desired_concurrency = self.desired_concurrency(),
                system_idle = info.is_system_idle(),
                cpu = info.cpu.actual_ratio,
                memory = info.memory.actual_ratio,
                event_loop = info.event_loop.actual_ratio,
                client = info.client.actual_ratio,
            ),
            Err(error) => debug!(message = "Pool status unavailable.", %error),
        }
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, RunSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resets the run slot however `run()` exits, including when its future is dropped.
struct RunGuard<'a> {
    pool: &'a AutoscaledPool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.pool.lock_slot();
        if slot.state == PoolState::Running {
            slot.state = PoolState::Aborted;
        }
        if let Some(token) = slot.abort.take() {
            token.cancel();
        }
        self.pool.current_concurrency.store(0, Ordering::Release);
    }
}
