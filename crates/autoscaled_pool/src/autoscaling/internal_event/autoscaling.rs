use std::time::Duration;

use metrics::{Counter, Gauge, Histogram, counter, gauge, histogram};

use crate::autoscaling::snapshot::ResourceKind;
use crate::registered_event;

#[derive(Clone, Copy, Debug)]
pub struct ConcurrencyData {
    pub desired: usize,
    pub current: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct ScaleData {
    pub from: usize,
    pub to: usize,
}

registered_event! {
    AutoscaledPoolConcurrency => {
        desired: Gauge = gauge!("autoscaled_pool_desired_concurrency"),
        current: Gauge = gauge!("autoscaled_pool_current_concurrency"),
    }

    fn emit(&self, data: ConcurrencyData) {
        self.desired.set(data.desired as f64);
        self.current.set(data.current as f64);
        tracing::trace!(
            target: "autoscaled_pool::stats",
            desired_concurrency = data.desired,
            current_concurrency = data.current,
            "Concurrency sampled"
        );
    }
}

registered_event! {
    AutoscaledPoolScaled => {
        scaled_up: Counter = counter!("autoscaled_pool_scaled_total", "direction" => "up"),
        scaled_down: Counter = counter!("autoscaled_pool_scaled_total", "direction" => "down"),
    }

    fn emit(&self, data: ScaleData) {
        if data.to > data.from {
            self.scaled_up.increment(1);
        } else {
            self.scaled_down.increment(1);
        }
        tracing::debug!(
            target: "autoscaled_pool::stats",
            from = data.from,
            to = data.to,
            "Desired concurrency changed"
        );
    }
}

registered_event! {
    ResourceOverloaded => {
        cpu: Counter = counter!("autoscaled_pool_resource_overloaded_total", "resource" => "cpu"),
        memory: Counter = counter!("autoscaled_pool_resource_overloaded_total", "resource" => "memory"),
        event_loop: Counter = counter!("autoscaled_pool_resource_overloaded_total", "resource" => "event_loop"),
        client: Counter = counter!("autoscaled_pool_resource_overloaded_total", "resource" => "client"),
    }

    fn emit(&self, kind: ResourceKind) {
        match kind {
            ResourceKind::Cpu => self.cpu.increment(1),
            ResourceKind::Memory => self.memory.increment(1),
            ResourceKind::EventLoop => self.event_loop.increment(1),
            ResourceKind::Client => self.client.increment(1),
        }
        tracing::trace!(target: "autoscaled_pool::stats", resource = %kind, "Resource overloaded");
    }
}

registered_event! {
    EventLoopDelay => {
        delay: Histogram = histogram!("autoscaled_pool_event_loop_delay_seconds"),
    }

    fn emit(&self, delay: Duration) {
        self.delay.record(delay);
        tracing::trace!(target: "autoscaled_pool::stats", delay_ms = delay.as_millis(), "Event loop delay");
    }
}
