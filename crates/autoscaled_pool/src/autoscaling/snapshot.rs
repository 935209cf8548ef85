//! Immutable, timestamped measurements of a single resource.

use std::{fmt, time::Duration, time::Instant};

/// The four resource signals tracked by the snapshotter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Cpu,
    Memory,
    EventLoop,
    Client,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Cpu,
        ResourceKind::Memory,
        ResourceKind::EventLoop,
        ResourceKind::Client,
    ];

    pub(crate) const fn index(self) -> usize {
        match self {
            ResourceKind::Cpu => 0,
            ResourceKind::Memory => 1,
            ResourceKind::EventLoop => 2,
            ResourceKind::Client => 3,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::EventLoop => "event_loop",
            ResourceKind::Client => "client",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CpuSnapshot {
    pub used_ratio: f64,
    pub max_used_ratio: f64,
    pub created_at: Instant,
}

impl CpuSnapshot {
    pub fn is_overloaded(&self) -> bool {
        self.used_ratio > self.max_used_ratio
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MemorySnapshot {
    /// Bytes in use.
    pub current_size: u64,
    /// Bytes the process is allowed to use.
    pub max_memory_size: u64,
    pub max_used_memory_ratio: f64,
    pub created_at: Instant,
}

impl MemorySnapshot {
    pub fn used_ratio(&self) -> f64 {
        if self.max_memory_size == 0 {
            return 1.0;
        }
        self.current_size as f64 / self.max_memory_size as f64
    }

    pub fn is_overloaded(&self) -> bool {
        self.used_ratio() > self.max_used_memory_ratio
    }
}

/// Scheduler lag: how late a timer fired compared to when it was due.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EventLoopSnapshot {
    pub delay: Duration,
    pub max_delay: Duration,
    pub created_at: Instant,
}

impl EventLoopSnapshot {
    pub fn is_overloaded(&self) -> bool {
        self.delay > self.max_delay
    }
}

/// Downstream errors observed since the previous client sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClientSnapshot {
    pub error_count: u64,
    pub max_error_count: u64,
    pub created_at: Instant,
}

impl ClientSnapshot {
    pub fn is_overloaded(&self) -> bool {
        self.error_count > self.max_error_count
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Snapshot {
    Cpu(CpuSnapshot),
    Memory(MemorySnapshot),
    EventLoop(EventLoopSnapshot),
    Client(ClientSnapshot),
}

impl Snapshot {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Snapshot::Cpu(_) => ResourceKind::Cpu,
            Snapshot::Memory(_) => ResourceKind::Memory,
            Snapshot::EventLoop(_) => ResourceKind::EventLoop,
            Snapshot::Client(_) => ResourceKind::Client,
        }
    }

    pub fn created_at(&self) -> Instant {
        match self {
            Snapshot::Cpu(s) => s.created_at,
            Snapshot::Memory(s) => s.created_at,
            Snapshot::EventLoop(s) => s.created_at,
            Snapshot::Client(s) => s.created_at,
        }
    }

    pub fn is_overloaded(&self) -> bool {
        match self {
            Snapshot::Cpu(s) => s.is_overloaded(),
            Snapshot::Memory(s) => s.is_overloaded(),
            Snapshot::EventLoop(s) => s.is_overloaded(),
            Snapshot::Client(s) => s.is_overloaded(),
        }
    }
}

impl From<CpuSnapshot> for Snapshot {
    fn from(s: CpuSnapshot) -> Self {
        Snapshot::Cpu(s)
    }
}

impl From<MemorySnapshot> for Snapshot {
    fn from(s: MemorySnapshot) -> Self {
        Snapshot::Memory(s)
    }
}

impl From<EventLoopSnapshot> for Snapshot {
    fn from(s: EventLoopSnapshot) -> Self {
        Snapshot::EventLoop(s)
    }
}

impl From<ClientSnapshot> for Snapshot {
    fn from(s: ClientSnapshot) -> Self {
        Snapshot::Client(s)
    }
}
