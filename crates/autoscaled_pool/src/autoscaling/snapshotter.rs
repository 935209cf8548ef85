//! Trailing, time-ordered history of resource samples.
//!
//! CPU and memory samples arrive as [`Event::SystemInfo`] measurements on the event
//! bus. Scheduler lag and downstream errors are sampled by the snapshotter itself on
//! fixed intervals. Every insertion round ends by pruning samples older than the
//! retention window.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bon::bon;
use snafu::ResultExt;
use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;

use super::{
    ConfigError, ensure_non_zero, ensure_ratio,
    error::{ClientLoadSnafu, MeasurementError, SnapshotterError},
    events::{Event, EventBus, Subscription, SystemMeasurement},
    instant_now,
    internal_event::{EventLoopDelay, EventLoopDelayHandle, ResourceOverloaded, ResourceOverloadedHandle},
    snapshot::{
        ClientSnapshot, CpuSnapshot, EventLoopSnapshot, MemorySnapshot, ResourceKind, Snapshot,
    },
};
use crate::Error as CrateError;

/// Tunables for the [`Snapshotter`].
///
/// | Parameter | Default |
/// |-----------|---------|
/// | `event_loop_snapshot_interval` | 500 ms |
/// | `client_snapshot_interval` | 1 s |
/// | `snapshot_history` (retention window) | 30 s |
/// | `max_used_cpu_ratio` | 0.95 |
/// | `max_used_memory_ratio` | 0.9 |
/// | `max_memory_size` | `available_memory_ratio` of total memory |
/// | `available_memory_ratio` | 0.25 |
/// | `max_event_loop_delay` | 50 ms |
/// | `max_client_errors` | 1 |
/// | `memory_warning_cooldown` | 10 s |
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SnapshotterConfig {
    pub(super) event_loop_snapshot_interval: Duration,
    pub(super) client_snapshot_interval: Duration,
    pub(super) snapshot_history: Duration,
    pub(super) max_used_cpu_ratio: f64,
    pub(super) max_used_memory_ratio: f64,
    pub(super) max_memory_size: Option<u64>,
    pub(super) available_memory_ratio: f64,
    pub(super) max_event_loop_delay: Duration,
    pub(super) max_client_errors: u64,
    pub(super) memory_warning_cooldown: Duration,
}

#[bon]
impl SnapshotterConfig {
    #[builder]
    pub fn new(
        #[builder(default = Duration::from_millis(500))] event_loop_snapshot_interval: Duration,
        #[builder(default = Duration::from_secs(1))] client_snapshot_interval: Duration,
        #[builder(default = Duration::from_secs(30))] snapshot_history: Duration,
        #[builder(default = 0.95)] max_used_cpu_ratio: f64,
        #[builder(default = 0.9)] max_used_memory_ratio: f64,
        max_memory_size: Option<u64>,
        #[builder(default = 0.25)] available_memory_ratio: f64,
        #[builder(default = Duration::from_millis(50))] max_event_loop_delay: Duration,
        #[builder(default = 1)] max_client_errors: u64,
        #[builder(default = Duration::from_secs(10))] memory_warning_cooldown: Duration,
    ) -> Result<Self, ConfigError> {
        ensure_non_zero("event_loop_snapshot_interval", event_loop_snapshot_interval)?;
        ensure_non_zero("client_snapshot_interval", client_snapshot_interval)?;
        ensure_non_zero("snapshot_history", snapshot_history)?;
        ensure_ratio("max_used_cpu_ratio", max_used_cpu_ratio)?;
        ensure_ratio("max_used_memory_ratio", max_used_memory_ratio)?;
        ensure_ratio("available_memory_ratio", available_memory_ratio)?;

        Ok(Self {
            event_loop_snapshot_interval,
            client_snapshot_interval,
            snapshot_history,
            max_used_cpu_ratio,
            max_used_memory_ratio,
            max_memory_size,
            available_memory_ratio,
            max_event_loop_delay,
            max_client_errors,
            memory_warning_cooldown,
        })
    }
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self {
            event_loop_snapshot_interval: Duration::from_millis(500),
            client_snapshot_interval: Duration::from_secs(1),
            snapshot_history: Duration::from_secs(30),
            max_used_cpu_ratio: 0.95,
            max_used_memory_ratio: 0.9,
            max_memory_size: None,
            available_memory_ratio: 0.25,
            max_event_loop_delay: Duration::from_millis(50),
            max_client_errors: 1,
            memory_warning_cooldown: Duration::from_secs(10),
        }
    }
}

impl SnapshotterConfig {
    pub fn snapshot_history(&self) -> Duration {
        self.snapshot_history
    }
}

/// Source of the downstream error signal.
pub trait ClientLoad: Send + Sync {
    /// Cumulative number of downstream errors (e.g. rate-limit responses) so far.
    fn error_count(&self) -> Result<u64, CrateError>;
}

/// Counter the caller bumps whenever the downstream pushes back.
///
/// Clones share the same count.
#[derive(Clone, Debug, Default)]
pub struct ClientErrorCounter {
    count: Arc<AtomicU64>,
}

impl ClientErrorCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl ClientLoad for ClientErrorCounter {
    fn error_count(&self) -> Result<u64, CrateError> {
        Ok(self.total())
    }
}

/// Per-kind sample series, each sorted ascending by `created_at`.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct SnapshotHistory {
    series: [Vec<Snapshot>; 4],
}

impl SnapshotHistory {
    /// Inserts by creation time rather than arrival time. Ties keep arrival order.
    pub(crate) fn insert(&mut self, snapshot: Snapshot) {
        let series = &mut self.series[snapshot.kind().index()];
        let created_at = snapshot.created_at();
        let position = series.partition_point(|s| s.created_at() <= created_at);
        series.insert(position, snapshot);
    }

    /// Drops samples of `kind` created before `now - retention`.
    pub(crate) fn prune(&mut self, kind: ResourceKind, now: Instant, retention: Duration) {
        let Some(cutoff) = now.checked_sub(retention) else {
            return;
        };
        let series = &mut self.series[kind.index()];
        let expired = series.partition_point(|s| s.created_at() < cutoff);
        series.drain(..expired);
    }

    pub(crate) fn get(
        &self,
        kind: ResourceKind,
        now: Instant,
        duration: Option<Duration>,
    ) -> Vec<Snapshot> {
        let series = &self.series[kind.index()];
        match duration {
            None => series.clone(),
            Some(duration) => {
                let from = now.checked_sub(duration);
                series
                    .iter()
                    .filter(|s| {
                        let created_at = s.created_at();
                        from.is_none_or(|from| created_at >= from) && created_at <= now
                    })
                    .copied()
                    .collect()
            }
        }
    }
}

/// Warns once per memory overload episode, at most once per cooldown.
#[derive(Debug)]
struct MemoryWarning {
    cooldown: Duration,
    last_warned: Option<Instant>,
}

impl MemoryWarning {
    fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_warned: None,
        }
    }

    fn should_warn(&mut self, overloaded: bool, now: Instant) -> bool {
        if !overloaded {
            self.last_warned = None;
            return false;
        }
        if let Some(last) = self.last_warned {
            if now.saturating_duration_since(last) < self.cooldown {
                return false;
            }
        }
        self.last_warned = Some(now);
        true
    }
}

type SharedHistory = Arc<Mutex<Option<SnapshotHistory>>>;

struct ActiveSampling {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Drop for ActiveSampling {
    fn drop(&mut self) {
        // Ends the sampling task, releasing its bus subscription, even if `stop()`
        // was never awaited.
        self.token.cancel();
    }
}

/// Owns the trailing history of all four sample kinds.
///
/// Histories exist only between [`start`](Self::start) and [`stop`](Self::stop);
/// queries outside that window fail with [`SnapshotterError::NotActive`].
pub struct Snapshotter {
    bus: Arc<EventBus>,
    config: SnapshotterConfig,
    client: Arc<dyn ClientLoad>,
    history: SharedHistory,
    active: Mutex<Option<ActiveSampling>>,
}

impl Snapshotter {
    pub fn new(bus: Arc<EventBus>, config: SnapshotterConfig) -> Self {
        Self {
            bus,
            config,
            client: Arc::new(ClientErrorCounter::new()),
            history: Arc::new(Mutex::new(None)),
            active: Mutex::new(None),
        }
    }

    /// Replaces the downstream error source, which defaults to a counter nobody bumps.
    pub fn with_client_load(mut self, client: impl ClientLoad + 'static) -> Self {
        self.client = Arc::new(client);
        self
    }

    pub fn config(&self) -> &SnapshotterConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.lock_history().is_some()
    }

    /// Subscribes to system measurements and starts self-sampling of scheduler lag
    /// and downstream errors. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), SnapshotterError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.is_some() {
            return Err(SnapshotterError::AlreadyActive);
        }

        *self.lock_history() = Some(SnapshotHistory::default());

        let subscription = self.bus.subscribe();
        let token = CancellationToken::new();
        let sampler = Sampler {
            config: self.config,
            client: Arc::clone(&self.client),
            history: Arc::clone(&self.history),
            previous_client_errors: None,
            memory_warning: MemoryWarning::new(self.config.memory_warning_cooldown),
            overloaded: ResourceOverloaded.register(),
            event_loop_delay: EventLoopDelay.register(),
        };
        let handle = tokio::spawn(sampler.run(subscription, token.clone()));

        *active = Some(ActiveSampling {
            token,
            handle: Some(handle),
        });
        info!(
            message = "Snapshotter started.",
            retention_secs = self.config.snapshot_history.as_secs_f64(),
        );
        Ok(())
    }

    /// Unsubscribes, ends self-sampling and drops the retained history.
    ///
    /// Stopping an inactive snapshotter is a no-op.
    pub async fn stop(&self) {
        let stopped = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut stopped) = stopped else {
            debug!("Snapshotter::stop: not active");
            return;
        };

        stopped.token.cancel();
        if let Some(handle) = stopped.handle.take() {
            if let Err(error) = handle.await {
                if !error.is_cancelled() {
                    error!(message = "Snapshotter sampling task failed.", %error);
                }
            }
        }

        *self.lock_history() = None;
        info!("Snapshotter stopped.");
    }

    /// Samples of `kind` created within `[now - duration, now]`, oldest first, or the
    /// whole retained history when `duration` is `None`.
    pub fn get_sample(
        &self,
        kind: ResourceKind,
        duration: Option<Duration>,
    ) -> Result<Vec<Snapshot>, SnapshotterError> {
        let history = self.lock_history();
        let history = history.as_ref().ok_or(SnapshotterError::NotActive)?;
        Ok(history.get(kind, instant_now(), duration))
    }

    /// Inserts an externally produced sample, then prunes its series.
    pub fn record(&self, snapshot: impl Into<Snapshot>) -> Result<(), SnapshotterError> {
        let snapshot = snapshot.into();
        let mut history = self.lock_history();
        let history = history.as_mut().ok_or(SnapshotterError::NotActive)?;
        history.insert(snapshot);
        history.prune(snapshot.kind(), instant_now(), self.config.snapshot_history);
        Ok(())
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, Option<SnapshotHistory>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State owned by the background sampling task.
struct Sampler {
    config: SnapshotterConfig,
    client: Arc<dyn ClientLoad>,
    history: SharedHistory,
    previous_client_errors: Option<u64>,
    memory_warning: MemoryWarning,
    overloaded: ResourceOverloadedHandle,
    event_loop_delay: EventLoopDelayHandle,
}

impl Sampler {
    async fn run(mut self, mut subscription: Subscription, token: CancellationToken) {
        let mut event_loop_ticks = interval(self.config.event_loop_snapshot_interval);
        event_loop_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut client_ticks = interval(self.config.client_snapshot_interval);
        client_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut bus_open = true;

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => break,

                event = subscription.recv(), if bus_open => match event {
                    Some(Event::SystemInfo(measurement)) => {
                        if let Err(error) = self.snapshot_system(measurement) {
                            warn!(message = "Skipping system measurement.", %error);
                        }
                    }
                    None => {
                        debug!("Snapshotter: event bus closed");
                        bus_open = false;
                    }
                },

                scheduled = event_loop_ticks.tick() => {
                    self.snapshot_event_loop(scheduled.into_std());
                }

                _ = client_ticks.tick() => {
                    if let Err(error) = self.snapshot_client() {
                        warn!(message = "Skipping client snapshot.", %error);
                    }
                }
            }
        }
        debug!("Snapshotter: sampling task finished");
    }

    fn snapshot_system(&mut self, measurement: SystemMeasurement) -> Result<(), MeasurementError> {
        if !measurement.cpu_used_ratio.is_finite() || measurement.cpu_used_ratio < 0.0 {
            return Err(MeasurementError::InvalidMeasurement {
                details: format!("cpu_used_ratio is {}", measurement.cpu_used_ratio),
            });
        }
        if measurement.memory_total_size == 0 {
            return Err(MeasurementError::InvalidMeasurement {
                details: "memory_total_size is 0".to_string(),
            });
        }

        let cpu = CpuSnapshot {
            used_ratio: measurement.cpu_used_ratio,
            max_used_ratio: self.config.max_used_cpu_ratio,
            created_at: measurement.created_at,
        };

        let max_memory_size = self.config.max_memory_size.unwrap_or_else(|| {
            (measurement.memory_total_size as f64 * self.config.available_memory_ratio) as u64
        });
        let memory = MemorySnapshot {
            current_size: measurement.memory_current_size,
            max_memory_size,
            max_used_memory_ratio: self.config.max_used_memory_ratio,
            created_at: measurement.created_at,
        };

        if self
            .memory_warning
            .should_warn(memory.is_overloaded(), instant_now())
        {
            warn!(
                message = "Memory is critically overloaded.",
                used_bytes = memory.current_size,
                max_bytes = memory.max_memory_size,
                used_ratio = memory.used_ratio(),
                max_used_ratio = memory.max_used_memory_ratio,
            );
        }

        self.insert(&[cpu.into(), memory.into()]);
        Ok(())
    }

    fn snapshot_event_loop(&mut self, scheduled: Instant) {
        let delay = instant_now().saturating_duration_since(scheduled);
        self.event_loop_delay.emit(delay);
        let snapshot = EventLoopSnapshot {
            delay,
            max_delay: self.config.max_event_loop_delay,
            created_at: instant_now(),
        };
        self.insert(&[snapshot.into()]);
    }

    fn snapshot_client(&mut self) -> Result<(), MeasurementError> {
        let total = self.client.error_count().context(ClientLoadSnafu)?;
        let previous = self.previous_client_errors.replace(total).unwrap_or(total);
        let snapshot = ClientSnapshot {
            error_count: total.saturating_sub(previous),
            max_error_count: self.config.max_client_errors,
            created_at: instant_now(),
        };
        self.insert(&[snapshot.into()]);
        Ok(())
    }

    fn insert(&self, snapshots: &[Snapshot]) {
        let now = instant_now();
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(history) = history.as_mut() else {
            return;
        };
        for snapshot in snapshots {
            if snapshot.is_overloaded() {
                self.overloaded.emit(snapshot.kind());
            }
            history.insert(*snapshot);
            history.prune(snapshot.kind(), now, self.config.snapshot_history);
        }
    }
}
