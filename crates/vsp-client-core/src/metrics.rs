use crate::lifecycle::ExtensionState;
use core::time::Duration;
use metrics::{counter, gauge, histogram};
use std::sync::atomic::{AtomicU64, Ordering};
use vsp_proto::ControlCommand;

struct LatencyStat {
    count: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl LatencyStat {
    const fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            max_ns: AtomicU64::new(0),
        }
    }

    fn observe(&self, ns: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ns = self.total_ns.load(Ordering::Relaxed);
        let avg_ns = if count == 0 {
            0.0
        } else {
            total_ns as f64 / count as f64
        };
        LatencySnapshot {
            count,
            avg_ns,
            max_ns: self.max_ns.load(Ordering::Relaxed),
        }
    }
}

static SENT: AtomicU64 = AtomicU64::new(0);
static REJECTED: AtomicU64 = AtomicU64::new(0);
static SUCCEEDED: LatencyStat = LatencyStat::new();
static FAILED: LatencyStat = LatencyStat::new();
static TRANSITIONS: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug, Default)]
pub struct LatencySnapshot {
    pub count: u64,
    pub avg_ns: f64,
    pub max_ns: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsSnapshot {
    pub commands_sent: u64,
    pub commands_rejected: u64,
    pub succeeded: LatencySnapshot,
    pub failed: LatencySnapshot,
    pub lifecycle_transitions: u64,
}

pub fn record_command_sent(command: ControlCommand) {
    counter!("vsp_command_sent", "command" => command.as_str()).increment(1);
    SENT.fetch_add(1, Ordering::Relaxed);
}

/// A command that never reached the driver.
pub fn record_command_rejected(command: ControlCommand) {
    counter!("vsp_command_rejected", "command" => command.as_str()).increment(1);
    REJECTED.fetch_add(1, Ordering::Relaxed);
}

pub fn observe_command_completed(command: ControlCommand, ok: bool, dur: Duration) {
    let ns = dur.as_nanos().min(u64::MAX as u128) as u64;
    let outcome = if ok { "ok" } else { "error" };
    counter!("vsp_command_completed", "command" => command.as_str(), "outcome" => outcome)
        .increment(1);
    histogram!("vsp_command_latency_ns", "command" => command.as_str()).record(ns as f64);
    if ok {
        SUCCEEDED.observe(ns);
    } else {
        FAILED.observe(ns);
    }
}

pub fn record_lifecycle_transition(to: ExtensionState) {
    counter!("vsp_lifecycle_transition", "state" => to.as_str()).increment(1);
    for state in ExtensionState::ALL {
        let current = if state == to { 1.0 } else { 0.0 };
        gauge!("vsp_extension_state", "state" => state.as_str()).set(current);
    }
    TRANSITIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        commands_sent: SENT.load(Ordering::Relaxed),
        commands_rejected: REJECTED.load(Ordering::Relaxed),
        succeeded: SUCCEEDED.snapshot(),
        failed: FAILED.snapshot(),
        lifecycle_transitions: TRANSITIONS.load(Ordering::Relaxed),
    }
}
