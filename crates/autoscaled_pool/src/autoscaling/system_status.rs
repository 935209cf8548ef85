//! Decision-ready load signals derived from the snapshotter's history.

use std::{sync::Arc, time::Duration, time::Instant};

use bon::bon;

use super::{
    ConfigError, ensure_non_zero, ensure_ratio,
    error::SnapshotterError,
    instant_now,
    snapshot::{ResourceKind, Snapshot},
    snapshotter::Snapshotter,
};

/// Fraction of samples found overloaded, against the fraction that is tolerated.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoadRatioInfo {
    pub limit_ratio: f64,
    pub actual_ratio: f64,
}

impl LoadRatioInfo {
    pub fn is_overloaded(&self) -> bool {
        self.actual_ratio > self.limit_ratio
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SystemInfo {
    pub cpu: LoadRatioInfo,
    pub memory: LoadRatioInfo,
    pub event_loop: LoadRatioInfo,
    pub client: LoadRatioInfo,
    pub created_at: Instant,
}

impl SystemInfo {
    /// True when none of the four resources is overloaded.
    pub fn is_system_idle(&self) -> bool {
        !self.cpu.is_overloaded()
            && !self.memory.is_overloaded()
            && !self.event_loop.is_overloaded()
            && !self.client.is_overloaded()
    }
}

/// Overload thresholds and the history window used by [`LoadEvaluator`].
///
/// A resource counts as overloaded when the fraction of its overloaded samples
/// exceeds its threshold.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoadEvaluatorConfig {
    pub(super) max_snapshot_age: Duration,
    pub(super) cpu_overload_threshold: f64,
    pub(super) memory_overload_threshold: f64,
    pub(super) event_loop_overload_threshold: f64,
    pub(super) client_overload_threshold: f64,
}

#[bon]
impl LoadEvaluatorConfig {
    #[builder]
    pub fn new(
        #[builder(default = Duration::from_secs(5))] max_snapshot_age: Duration,
        #[builder(default = 0.4)] cpu_overload_threshold: f64,
        #[builder(default = 0.2)] memory_overload_threshold: f64,
        #[builder(default = 0.6)] event_loop_overload_threshold: f64,
        #[builder(default = 0.3)] client_overload_threshold: f64,
    ) -> Result<Self, ConfigError> {
        ensure_non_zero("max_snapshot_age", max_snapshot_age)?;
        ensure_ratio("cpu_overload_threshold", cpu_overload_threshold)?;
        ensure_ratio("memory_overload_threshold", memory_overload_threshold)?;
        ensure_ratio("event_loop_overload_threshold", event_loop_overload_threshold)?;
        ensure_ratio("client_overload_threshold", client_overload_threshold)?;

        Ok(Self {
            max_snapshot_age,
            cpu_overload_threshold,
            memory_overload_threshold,
            event_loop_overload_threshold,
            client_overload_threshold,
        })
    }
}

impl Default for LoadEvaluatorConfig {
    fn default() -> Self {
        Self {
            max_snapshot_age: Duration::from_secs(5),
            cpu_overload_threshold: 0.4,
            memory_overload_threshold: 0.2,
            event_loop_overload_threshold: 0.6,
            client_overload_threshold: 0.3,
        }
    }
}

impl LoadEvaluatorConfig {
    fn threshold(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu_overload_threshold,
            ResourceKind::Memory => self.memory_overload_threshold,
            ResourceKind::EventLoop => self.event_loop_overload_threshold,
            ResourceKind::Client => self.client_overload_threshold,
        }
    }
}

/// Read-only view over a [`Snapshotter`]. Never mutates the history.
#[derive(Clone)]
pub struct LoadEvaluator {
    snapshotter: Arc<Snapshotter>,
    config: LoadEvaluatorConfig,
}

impl LoadEvaluator {
    pub fn new(snapshotter: Arc<Snapshotter>, config: LoadEvaluatorConfig) -> Self {
        Self {
            snapshotter,
            config,
        }
    }

    pub fn snapshotter(&self) -> &Arc<Snapshotter> {
        &self.snapshotter
    }

    /// Load from the single most recent sample of each kind: ratio 1 if that sample
    /// is overloaded, 0 otherwise (also 0 when there are no samples).
    pub fn get_current_system_info(&self) -> Result<SystemInfo, SnapshotterError> {
        self.system_info(|kind| {
            let samples = self.snapshotter.get_sample(kind, None)?;
            Ok(samples
                .last()
                .map_or(0.0, |s| if s.is_overloaded() { 1.0 } else { 0.0 }))
        })
    }

    /// Load over the last `max_snapshot_age`: overloaded samples divided by all
    /// samples in the window. An empty window yields 0.
    pub fn get_historical_system_info(&self) -> Result<SystemInfo, SnapshotterError> {
        self.system_info(|kind| {
            let samples = self
                .snapshotter
                .get_sample(kind, Some(self.config.max_snapshot_age))?;
            Ok(overloaded_ratio(&samples))
        })
    }

    fn system_info<F>(&self, mut ratio_of: F) -> Result<SystemInfo, SnapshotterError>
    where
        F: FnMut(ResourceKind) -> Result<f64, SnapshotterError>,
    {
        let mut load = |kind| {
            Ok::<_, SnapshotterError>(LoadRatioInfo {
                limit_ratio: self.config.threshold(kind),
                actual_ratio: ratio_of(kind)?,
            })
        };

        Ok(SystemInfo {
            cpu: load(ResourceKind::Cpu)?,
            memory: load(ResourceKind::Memory)?,
            event_loop: load(ResourceKind::EventLoop)?,
            client: load(ResourceKind::Client)?,
            created_at: instant_now(),
        })
    }
}

fn overloaded_ratio(samples: &[Snapshot]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let overloaded = samples.iter().filter(|s| s.is_overloaded()).count();
    overloaded as f64 / samples.len() as f64
}
