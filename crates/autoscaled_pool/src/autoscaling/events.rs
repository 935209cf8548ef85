//! Process-wide publish/subscribe feed for system measurements.
//!
//! The bus wraps a tokio broadcast channel. Publishers fire and forget; each
//! subscriber holds a [`Subscription`] and stops receiving as soon as it is dropped.

use std::time::Instant;

use tokio::sync::broadcast;

/// Default channel capacity (events).
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_024;

/// One reading of system-wide CPU and memory usage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SystemMeasurement {
    /// Fraction of CPU capacity in use, in `[0, 1]`.
    pub cpu_used_ratio: f64,
    /// Bytes of memory in use.
    pub memory_current_size: u64,
    /// Total bytes of memory on the machine.
    pub memory_total_size: u64,
    /// When the measurement was taken, which may precede its delivery.
    pub created_at: Instant,
}

#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Event {
    SystemInfo(SystemMeasurement),
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::SystemInfo(_) => "system_info",
        }
    }
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Events published while nobody is subscribed are dropped.
    pub fn emit(&self, event: Event) {
        trace!(event_type = event.event_type(), "EventBus::emit");
        let _ = self.tx.send(event);
    }

    /// Events published before this call are not delivered to the new subscription.
    pub fn subscribe(&self) -> Subscription {
        debug!(subscribers = self.tx.receiver_count() + 1, "EventBus::subscribe");
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

/// A live registration on an [`EventBus`]. Dropping it unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Waits for the next event. Returns `None` once the bus is gone.
    ///
    /// A subscriber that falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(message = "Subscriber lagged behind the event bus.", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        debug!("EventBus: subscription released");
    }
}
