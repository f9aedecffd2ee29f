//! The process-wide shared state object (§9 design notes): the start
//! counter and load/unload lock (via `RecordingController`), both
//! association maps, both TTL caches, and the metrics relay handle, all
//! reachable from every request handler through one `Arc`, never through
//! process globals.

use std::sync::Arc;

use log::debug;

use crate::associations::Associations;
use crate::identity::IdentityResolver;
use crate::metrics::Metrics;
use crate::recording::RecordingController;
use crate::relay::{MetricRecord, MetricsSink};

pub struct AppState {
    pub node_name: String,
    pub associations: Associations,
    pub identity: IdentityResolver,
    pub recording: RecordingController,
    pub metrics_sink: Arc<dyn MetricsSink>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// `metrics` is constructed by the caller and also handed to the
    /// `IdentityResolver` so cluster-listing failures (§7) are counted
    /// through the same counters the event path uses.
    pub fn new(
        node_name: String,
        identity: IdentityResolver,
        recording: RecordingController,
        metrics_sink: Arc<dyn MetricsSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            node_name,
            associations: Associations::new(),
            identity,
            recording,
            metrics_sink,
            metrics,
        }
    }

    /// Attributes one `(pid, mntns)` record: resolves the container id
    /// owning `pid`, records the `M1` edge, opportunistically resolves
    /// the owning profile, and relays a metric if attribution succeeded
    /// (§4.3/§4.4/§4.7). A pid whose cgroup can't be resolved is dropped
    /// silently at verbose level, per §4.3.
    pub async fn handle_event(&self, pid: u32, mntns: u32) {
        self.metrics.inc_events_observed();

        let Some(container_id) = self.identity.container_id_for_pid(pid) else {
            debug!("pid {pid} cgroup miss; dropping event");
            self.metrics.inc_dropped_identity_miss();
            return;
        };

        self.associations
            .mntns_container
            .insert(mntns, container_id.clone());

        if let Some(profile) = self
            .identity
            .profile_for_container(&container_id, &self.associations.container_profile)
            .await
        {
            self.metrics_sink
                .send(MetricRecord {
                    node: self.node_name.clone(),
                    profile,
                    mount_namespace: mntns,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{PidToContainerCache, SyscallIdToNameCache};
    use crate::identity::{FakeCgroupReader, FakeClusterApi};
    use crate::relay::FakeMetricsSink;
    use std::collections::HashMap;
    use std::time::Duration;

    fn test_state(cgroup: FakeCgroupReader, cluster: FakeClusterApi) -> (AppState, Arc<FakeMetricsSink>) {
        let metrics = Arc::new(Metrics::new());
        let identity = IdentityResolver::new(
            Arc::new(cgroup),
            Arc::new(cluster),
            PidToContainerCache::new(1000, Duration::from_secs(3600)),
            SyscallIdToNameCache::new(1000, Duration::from_secs(3600)),
            "syscapd.io/profile-".to_string(),
            Arc::clone(&metrics),
        );
        let recording = RecordingController::new("SYSCAPD_BPF_PATH".to_string(), None, None);
        let sink = FakeMetricsSink::new();
        let state = AppState::new("node-1".to_string(), identity, recording, sink.clone(), metrics);
        (state, sink)
    }

    #[tokio::test]
    async fn handle_event_drops_on_cgroup_miss() {
        let (state, sink) = test_state(FakeCgroupReader::new(HashMap::new()), FakeClusterApi::new(vec![]));
        state.handle_event(1234, 4026532001).await;
        assert_eq!(state.metrics.dropped_total(), 1);
        assert!(sink.records.lock().await.is_empty());
        assert_eq!(state.associations.mntns_container.get(&4026532001), None);
    }

    #[tokio::test]
    async fn handle_event_records_mntns_edge_and_relays_metric_on_attribution() {
        use crate::identity::{ContainerStatus, Workload};

        let cgroup = FakeCgroupReader::new(
            [(1234, "1:devices:/docker/abc123def456abc123def456".to_string())].into(),
        );
        let workload = Workload {
            annotations: [(
                "syscapd.io/profile-web".to_string(),
                "myprofile".to_string(),
            )]
            .into(),
            containers: vec![ContainerStatus {
                name: "web".to_string(),
                status_id: "containerd://abc123def456abc123def456".to_string(),
            }],
        };
        let (state, sink) = test_state(cgroup, FakeClusterApi::new(vec![workload]));
        state.handle_event(1234, 4026532001).await;
        assert_eq!(
            state.associations.mntns_container.get(&4026532001),
            Some("abc123def456abc123def456".to_string())
        );
        let records = sink.records.lock().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].profile, "myprofile");
        assert_eq!(records[0].mount_namespace, 4026532001);
    }
}
