use snafu::Snafu;

use crate::Error as CrateError;

/// An invalid configuration value. Raised when a settings value is built or
/// deserialized, never while a pool is running.
#[derive(Debug, Snafu, Clone, PartialEq)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("min_concurrency must be at least 1"))]
    MinConcurrencyZero,

    #[snafu(display("max_concurrency ({max}) must not be lower than min_concurrency ({min})"))]
    MaxBelowMin { min: usize, max: usize },

    #[snafu(display(
        "desired_concurrency ({desired}) must be within [{min}, {max}]"
    ))]
    DesiredOutOfRange { desired: usize, min: usize, max: usize },

    #[snafu(display("max_tasks_per_minute must be a positive number, got {value}"))]
    InvalidTasksPerMinute { value: f64 },

    #[snafu(display("`{name}` must be a ratio within [0, 1], got {value}"))]
    InvalidRatio { name: &'static str, value: f64 },

    #[snafu(display("`{name}` must be a non-zero duration"))]
    ZeroInterval { name: &'static str },
}

/// Errors raised by the snapshotter lifecycle.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum SnapshotterError {
    /// A query arrived outside the start/stop window.
    #[snafu(display("snapshotter is not active; call `start()` first"))]
    NotActive,

    #[snafu(display("snapshotter is already active"))]
    AlreadyActive,
}

/// Failure to obtain a single resource sample. Always recovered locally.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MeasurementError {
    #[snafu(display("failed to read downstream client errors: {source}"))]
    ClientLoad { source: CrateError },

    #[snafu(display("invalid system measurement: {details}"))]
    InvalidMeasurement { details: String },

    #[snafu(display("failed to read system usage: {details}"))]
    SystemRead { details: String },
}

/// Errors returned by [`AutoscaledPool`](super::controller::AutoscaledPool).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PoolError {
    #[snafu(display("pool is already running"))]
    AlreadyRunning,

    #[snafu(display("pool is not running"))]
    NotRunning,

    #[snafu(display("load evaluation failed: {source}"))]
    Snapshotter { source: SnapshotterError },

    /// The first error raised by a task invocation, after in-flight tasks drained.
    #[snafu(display("task failed: {source}"))]
    TaskFailed { source: CrateError },
}

impl PoolError {
    /// Unwraps the original task error, if this is a task failure.
    pub fn into_task_error(self) -> Option<CrateError> {
        match self {
            PoolError::TaskFailed { source } => Some(source),
            _ => None,
        }
    }
}
