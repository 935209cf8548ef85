//! Publishes CPU and memory usage of this process on the event bus.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bon::Builder;
use sysinfo::{MINIMUM_CPU_UPDATE_INTERVAL, ProcessesToUpdate, System};
use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;

use super::{
    error::MeasurementError,
    events::{Event, EventBus, SystemMeasurement},
    instant_now,
};

#[derive(Clone, Copy, Debug, Builder)]
pub struct MonitorConfig {
    /// How often a measurement is published. Raised to sysinfo's minimum CPU
    /// refresh interval if lower.
    #[builder(default = Duration::from_secs(1))]
    interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

/// Periodically measures CPU and memory usage and emits [`Event::SystemInfo`].
pub struct SystemMonitor {
    bus: Arc<EventBus>,
    config: MonitorConfig,
    active: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SystemMonitor {
    pub fn new(bus: Arc<EventBus>, config: MonitorConfig) -> Self {
        Self {
            bus,
            config,
            active: Mutex::new(None),
        }
    }

    /// Starts publishing. Calling it again while active does nothing.
    pub fn start(&self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.is_some() {
            debug!("SystemMonitor::start: already active");
            return;
        }

        let token = CancellationToken::new();
        let period = self.config.interval.max(MINIMUM_CPU_UPDATE_INTERVAL);
        let handle = tokio::spawn(publish(Arc::clone(&self.bus), period, token.clone()));
        *active = Some((token, handle));
        debug!(interval_ms = period.as_millis(), "SystemMonitor started");
    }

    pub async fn stop(&self) {
        let stopped = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((token, handle)) = stopped {
            token.cancel();
            if let Err(error) = handle.await {
                error!(message = "System monitor task failed.", %error);
            }
            debug!("SystemMonitor stopped");
        }
    }
}

impl Drop for SystemMonitor {
    fn drop(&mut self) {
        if let Some((token, _)) = self
            .active
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            token.cancel();
        }
    }
}

async fn publish(bus: Arc<EventBus>, period: Duration, token: CancellationToken) {
    let mut system = System::new();
    let mut ticks = interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticks.tick() => match measure(&mut system) {
                Ok(measurement) => bus.emit(Event::SystemInfo(measurement)),
                Err(error) => warn!(message = "Skipping system measurement.", %error),
            },
        }
    }
}

fn measure(system: &mut System) -> Result<SystemMeasurement, MeasurementError> {
    let pid = sysinfo::get_current_pid().map_err(|details| MeasurementError::SystemRead {
        details: details.to_string(),
    })?;

    system.refresh_cpu_usage();
    system.refresh_memory();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

    let process = system
        .process(pid)
        .ok_or_else(|| MeasurementError::SystemRead {
            details: format!("process {pid} not found"),
        })?;

    Ok(SystemMeasurement {
        cpu_used_ratio: (f64::from(system.global_cpu_usage()) / 100.0).clamp(0.0, 1.0),
        memory_current_size: process.memory(),
        memory_total_size: system.total_memory(),
        created_at: instant_now(),
    })
}
