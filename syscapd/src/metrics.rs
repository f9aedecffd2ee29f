use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

/// In-process diagnostics counters (C10). Exposed only for in-process
/// diagnostics in this agent — exporting them over Prometheus/HTTP is
/// future work outside this crate's scope, matching the distilled spec's
/// exclusion of a metrics sink render/persist surface.
pub struct Metrics {
    pub start_time: SystemTime,
    events_observed: AtomicU64,
    events_dropped_malformed: AtomicU64,
    events_dropped_identity_miss: AtomicU64,
    ring_buffer_errors: AtomicU64,
    cluster_list_failures: AtomicU64,
    profiles_drained: AtomicU64,
    recording_active_count: AtomicUsize,
    rpc_calls_ok: AtomicU64,
    rpc_calls_not_running: AtomicU64,
    rpc_calls_not_found: AtomicU64,
    rpc_calls_no_syscalls: AtomicU64,
    rpc_latency_total_micros: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            events_observed: AtomicU64::new(0),
            events_dropped_malformed: AtomicU64::new(0),
            events_dropped_identity_miss: AtomicU64::new(0),
            ring_buffer_errors: AtomicU64::new(0),
            cluster_list_failures: AtomicU64::new(0),
            profiles_drained: AtomicU64::new(0),
            recording_active_count: AtomicUsize::new(0),
            rpc_calls_ok: AtomicU64::new(0),
            rpc_calls_not_running: AtomicU64::new(0),
            rpc_calls_not_found: AtomicU64::new(0),
            rpc_calls_no_syscalls: AtomicU64::new(0),
            rpc_latency_total_micros: AtomicU64::new(0),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn inc_events_observed(&self) {
        self.events_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_observed(&self) -> u64 {
        self.events_observed.load(Ordering::Relaxed)
    }

    pub fn inc_dropped_malformed(&self) {
        self.events_dropped_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped_identity_miss(&self) {
        self.events_dropped_identity_miss
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_total(&self) -> u64 {
        self.events_dropped_malformed.load(Ordering::Relaxed)
            + self.events_dropped_identity_miss.load(Ordering::Relaxed)
    }

    pub fn inc_ring_buffer_error(&self) {
        self.ring_buffer_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cluster_list_failure(&self) {
        self.cluster_list_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cluster_list_failures(&self) -> u64 {
        self.cluster_list_failures.load(Ordering::Relaxed)
    }

    pub fn inc_profiles_drained(&self) {
        self.profiles_drained.fetch_add(1, Ordering::Relaxed);
    }

    pub fn profiles_drained(&self) -> u64 {
        self.profiles_drained.load(Ordering::Relaxed)
    }

    pub fn set_recording_active_count(&self, count: usize) {
        self.recording_active_count.store(count, Ordering::Relaxed);
    }

    pub fn recording_active_count(&self) -> usize {
        self.recording_active_count.load(Ordering::Relaxed)
    }

    pub fn record_rpc_outcome(&self, outcome: RpcOutcome, latency_micros: u64) {
        match outcome {
            RpcOutcome::Ok => self.rpc_calls_ok.fetch_add(1, Ordering::Relaxed),
            RpcOutcome::NotRunning => self.rpc_calls_not_running.fetch_add(1, Ordering::Relaxed),
            RpcOutcome::NotFound => self.rpc_calls_not_found.fetch_add(1, Ordering::Relaxed),
            RpcOutcome::NoSyscallsForMntns => {
                self.rpc_calls_no_syscalls.fetch_add(1, Ordering::Relaxed)
            }
        };
        self.rpc_latency_total_micros
            .fetch_add(latency_micros, Ordering::Relaxed);
    }

    pub fn rpc_calls_total(&self) -> u64 {
        self.rpc_calls_ok.load(Ordering::Relaxed)
            + self.rpc_calls_not_running.load(Ordering::Relaxed)
            + self.rpc_calls_not_found.load(Ordering::Relaxed)
            + self.rpc_calls_no_syscalls.load(Ordering::Relaxed)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// The outcome bucket an RPC call's latency is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcOutcome {
    Ok,
    NotRunning,
    NotFound,
    NoSyscallsForMntns,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_total_sums_both_reasons() {
        let m = Metrics::new();
        m.inc_dropped_malformed();
        m.inc_dropped_identity_miss();
        m.inc_dropped_identity_miss();
        assert_eq!(m.dropped_total(), 3);
    }

    #[test]
    fn rpc_outcomes_bucket_independently() {
        let m = Metrics::new();
        m.record_rpc_outcome(RpcOutcome::Ok, 100);
        m.record_rpc_outcome(RpcOutcome::NotFound, 50);
        assert_eq!(m.rpc_calls_total(), 2);
    }
}
