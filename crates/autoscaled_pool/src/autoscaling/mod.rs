//! Scale the number of concurrently running task invocations to the observed system load.

pub mod controller;
pub mod error;
pub mod events;
pub mod internal_event;
pub mod monitor;
mod rate;
pub mod snapshot;
pub mod snapshotter;
pub mod system_status;
#[cfg(test)]
mod tests;

use std::time::Duration;

use bon::bon;
use serde::{Deserialize, Serialize};
use snafu::ensure;

pub use controller::{AutoscaleConfig, AutoscaledPool, PoolState};
pub use error::{ConfigError, MeasurementError, PoolError, SnapshotterError};

use error::{
    DesiredOutOfRangeSnafu, InvalidRatioSnafu, InvalidTasksPerMinuteSnafu, MaxBelowMinSnafu,
    MinConcurrencyZeroSnafu, ZeroIntervalSnafu,
};

pub(crate) fn instant_now() -> std::time::Instant {
    tokio::time::Instant::now().into()
}

pub(crate) fn ensure_ratio(name: &'static str, value: f64) -> Result<(), ConfigError> {
    ensure!((0.0..=1.0).contains(&value), InvalidRatioSnafu { name, value });
    Ok(())
}

pub(crate) fn ensure_non_zero(name: &'static str, value: Duration) -> Result<(), ConfigError> {
    ensure!(!value.is_zero(), ZeroIntervalSnafu { name });
    Ok(())
}

/// Concurrency bounds for an [`AutoscaledPool`].
///
/// The value is validated once, when it is built or deserialized, and is immutable
/// afterwards. It can be shared between any number of pools and runs.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `min_concurrency` | 1 | Floor for the desired concurrency, at least 1 |
/// | `max_concurrency` | 200 | Ceiling for the desired concurrency |
/// | `desired_concurrency` | `min_concurrency` | Where every run starts |
/// | `max_tasks_per_minute` | unbounded | Ceiling on task starts per minute |
///
/// # Example
///
/// ```rust
/// use autoscaled_pool::autoscaling::ConcurrencySettings;
///
/// let settings = ConcurrencySettings::builder()
///     .min_concurrency(2)
///     .max_concurrency(50)
///     .max_tasks_per_minute(600.0)
///     .build()
///     .unwrap();
/// assert_eq!(settings.desired_concurrency(), 2);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawConcurrencySettings")]
pub struct ConcurrencySettings {
    min_concurrency: usize,
    max_concurrency: usize,
    desired_concurrency: usize,
    max_tasks_per_minute: Option<f64>,
}

const fn default_min_concurrency() -> usize {
    1
}

const fn default_max_concurrency() -> usize {
    200
}

#[bon]
impl ConcurrencySettings {
    #[builder]
    pub fn new(
        #[builder(default = default_min_concurrency())] min_concurrency: usize,
        #[builder(default = default_max_concurrency())] max_concurrency: usize,
        desired_concurrency: Option<usize>,
        max_tasks_per_minute: Option<f64>,
    ) -> Result<Self, ConfigError> {
        ensure!(min_concurrency >= 1, MinConcurrencyZeroSnafu);
        ensure!(
            max_concurrency >= min_concurrency,
            MaxBelowMinSnafu {
                min: min_concurrency,
                max: max_concurrency,
            }
        );

        let desired = desired_concurrency.unwrap_or(min_concurrency);
        ensure!(
            (min_concurrency..=max_concurrency).contains(&desired),
            DesiredOutOfRangeSnafu {
                desired,
                min: min_concurrency,
                max: max_concurrency,
            }
        );

        if let Some(value) = max_tasks_per_minute {
            ensure!(
                value.is_finite() && value > 0.0,
                InvalidTasksPerMinuteSnafu { value }
            );
        }

        Ok(Self {
            min_concurrency,
            max_concurrency,
            desired_concurrency: desired,
            max_tasks_per_minute,
        })
    }
}

impl ConcurrencySettings {
    pub fn min_concurrency(&self) -> usize {
        self.min_concurrency
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn desired_concurrency(&self) -> usize {
        self.desired_concurrency
    }

    /// `None` means task starts are not rate limited.
    pub fn max_tasks_per_minute(&self) -> Option<f64> {
        self.max_tasks_per_minute
    }

    pub(crate) fn clamp(&self, desired: usize) -> usize {
        desired.clamp(self.min_concurrency, self.max_concurrency)
    }
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            min_concurrency: default_min_concurrency(),
            max_concurrency: default_max_concurrency(),
            desired_concurrency: default_min_concurrency(),
            max_tasks_per_minute: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConcurrencySettings {
    #[serde(default = "default_min_concurrency")]
    min_concurrency: usize,
    #[serde(default = "default_max_concurrency")]
    max_concurrency: usize,
    #[serde(default)]
    desired_concurrency: Option<usize>,
    #[serde(default)]
    max_tasks_per_minute: Option<f64>,
}

impl TryFrom<RawConcurrencySettings> for ConcurrencySettings {
    type Error = ConfigError;

    fn try_from(raw: RawConcurrencySettings) -> Result<Self, Self::Error> {
        ConcurrencySettings::builder()
            .min_concurrency(raw.min_concurrency)
            .max_concurrency(raw.max_concurrency)
            .maybe_desired_concurrency(raw.desired_concurrency)
            .maybe_max_tasks_per_minute(raw.max_tasks_per_minute)
            .build()
    }
}
