use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
struct LatencyCell {
    count: AtomicU64,
    total_micros: AtomicU64,
}

/// Process-local dispatcher counters. Commands are keyed by action name,
/// errors by taxonomy kind. Connectivity reflects whether at least one
/// command client is attached.
pub struct DispatcherMetrics {
    commands: DashMap<String, AtomicU64>,
    errors: DashMap<String, AtomicU64>,
    command_clients: AtomicU64,
    pushes_sent: AtomicU64,
    pushes_dropped: AtomicU64,
    latency: DashMap<String, LatencyCell>,
}

impl DispatcherMetrics {
    pub fn inc_command(&self, action: &str) {
        self.commands
            .entry(action.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_error(&self, kind: &str) {
        self.errors
            .entry(kind.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_attached(&self) {
        self.command_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_detached(&self) {
        self.command_clients.fetch_sub(1, Ordering::Relaxed);
    }

    /// Connectivity gauge: true while any command client is attached.
    pub fn connected(&self) -> bool {
        self.command_clients.load(Ordering::Relaxed) > 0
    }

    pub fn inc_pushes_sent(&self, n: u64) {
        self.pushes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_pushes_dropped(&self, n: u64) {
        self.pushes_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn observe_latency(&self, action: &str, elapsed: Duration) {
        let cell = self.latency.entry(action.to_string()).or_default();
        cell.count.fetch_add(1, Ordering::Relaxed);
        cell.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn command_count(&self, action: &str) -> u64 {
        self.commands
            .get(action)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn error_count(&self, kind: &str) -> u64 {
        self.errors
            .get(kind)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn pushes_sent(&self) -> u64 {
        self.pushes_sent.load(Ordering::Relaxed)
    }

    pub fn pushes_dropped(&self) -> u64 {
        self.pushes_dropped.load(Ordering::Relaxed)
    }

    /// (sample count, mean latency in microseconds) for one action.
    pub fn latency_snapshot(&self, action: &str) -> (u64, u64) {
        match self.latency.get(action) {
            Some(cell) => {
                let count = cell.count.load(Ordering::Relaxed);
                let total = cell.total_micros.load(Ordering::Relaxed);
                (count, if count == 0 { 0 } else { total / count })
            }
            None => (0, 0),
        }
    }
}

pub static METRICS: Lazy<DispatcherMetrics> = Lazy::new(|| DispatcherMetrics {
    commands: DashMap::new(),
    errors: DashMap::new(),
    command_clients: AtomicU64::new(0),
    pushes_sent: AtomicU64::new(0),
    pushes_dropped: AtomicU64::new(0),
    latency: DashMap::new(),
});
