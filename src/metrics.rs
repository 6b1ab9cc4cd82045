use std::sync::atomic::{AtomicU64, Ordering};

/// Exponentially weighted per-second rate.
pub struct ThroughputAverager {
    tau_secs: f64,
    smoothed: f64,
}

impl ThroughputAverager {
    pub fn new(tau_secs: f64) -> Self {
        Self { tau_secs, smoothed: 0.0 }
    }

    pub fn update(&mut self, delta: u64, dt_secs: f64) -> f64 {
        let dt = dt_secs.max(1e-3);
        let alpha = 1.0 - (-dt / self.tau_secs).exp();
        let inst = (delta as f64) / dt;
        self.smoothed = self.smoothed * (1.0 - alpha) + inst * alpha;
        self.smoothed
    }
}

/// Server-wide counters, bumped lock-free from every thread.
#[derive(Default)]
pub struct Stats {
    pub accepted: AtomicU64,
    pub refused: AtomicU64,
    pub departed: AtomicU64,
    pub messages_in: AtomicU64,
    pub messages_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub deliveries: AtomicU64,
    pub write_failures: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub refused: u64,
    pub departed: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub bytes_in: u64,
    pub deliveries: u64,
    pub write_failures: u64,
}

impl Stats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            departed: self.departed.load(Ordering::Relaxed),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}
