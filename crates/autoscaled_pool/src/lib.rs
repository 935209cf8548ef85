//! Self-regulating concurrency for repeated units of work.
//!
//! This crate runs a caller-supplied task routine many times concurrently and keeps
//! adjusting how many invocations may be in flight, based on observed resource pressure.
//!
//! # Algorithm Overview
//!
//! 1. A [`Snapshotter`](autoscaling::snapshotter::Snapshotter) keeps a trailing history
//!    of CPU, memory, scheduler-lag and downstream-error samples.
//! 2. A [`LoadEvaluator`](autoscaling::system_status::LoadEvaluator) turns that history
//!    into an instantaneous and a windowed overload signal.
//! 3. The [`AutoscaledPool`](autoscaling::controller::AutoscaledPool) grows the desired
//!    concurrency by one step while the system is idle and the current allowance is
//!    actually used, and shrinks it by one step while the system is overloaded.
//!
//! # Basic Usage
//! ```no_run
//! use std::sync::Arc;
//! use autoscaled_pool::autoscaling::{
//!     ConcurrencySettings,
//!     controller::AutoscaledPool,
//!     events::EventBus,
//!     snapshotter::{Snapshotter, SnapshotterConfig},
//!     system_status::{LoadEvaluator, LoadEvaluatorConfig},
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let bus = Arc::new(EventBus::default());
//! let snapshotter = Arc::new(Snapshotter::new(bus, SnapshotterConfig::default()));
//! snapshotter.start()?;
//!
//! let evaluator = LoadEvaluator::new(snapshotter.clone(), LoadEvaluatorConfig::default());
//! let settings = ConcurrencySettings::builder().max_concurrency(20).build()?;
//! let pool = AutoscaledPool::new(
//!     evaluator,
//!     settings,
//!     || async { Ok(()) },
//!     || async { true },
//!     || async { false },
//! );
//!
//! let outcome = pool.run().await;
//! snapshotter.stop().await;
//! outcome?;
//! # Ok(())
//! # }
//! ```
//!
//! # Metrics
//! Emits metrics via the registered events in [`autoscaling::internal_event`].
pub mod autoscaling;
#[cfg(test)]
pub mod test_utils;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
