mod cgroup;
mod cluster;

pub use cgroup::{CgroupReader, FakeCgroupReader, ProcfsCgroupReader};
pub use cluster::{
    ClusterApi, ContainerStatus, FailingClusterApi, FakeClusterApi, KubernetesClusterApi, Workload,
};

use crate::cache::{PidToContainerCache, SyscallIdToNameCache};
use crate::metrics::Metrics;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Matches the container id embedded in a cgroup path or a container
/// runtime's status id, e.g. `.../docker-<id>.scope` or
/// `containerd://<id>`. Applied identically to both sources per the data
/// model.
static CONTAINER_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-f0-9]{64}|[a-f0-9]{12,63}").expect("valid container id regex"));

pub fn extract_container_id(input: &str) -> Option<String> {
    CONTAINER_ID_RE
        .find(input)
        .map(|m| m.as_str().to_string())
}

pub fn syscall_name_for_id(id: u32) -> Option<String> {
    syscalls::Sysno::new(id as usize).map(|sysno| sysno.name().to_string())
}

/// An "always retry" backoff loop bounded by an overall deadline, matching
/// the retry predicate this agent uses uniformly (§7/§9): initial delay,
/// a multiplicative factor, a step cap, and a hard deadline.
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub max_steps: u32,
    pub deadline: Duration,
}

impl Backoff {
    pub const CLUSTER_LOOKUP: Backoff = Backoff {
        initial: Duration::from_millis(100),
        factor: 1.2,
        max_steps: 20,
        deadline: Duration::from_secs(60),
    };

    pub const MNTNS_LOOKUP: Backoff = Backoff {
        initial: Duration::from_millis(20),
        factor: 1.5,
        max_steps: 8,
        deadline: Duration::from_secs(5),
    };

    /// Calls `attempt` until it returns `Some`, sleeping with exponential
    /// backoff between calls, up to `max_steps` attempts or until
    /// `deadline` has elapsed since the first attempt, whichever comes
    /// first.
    pub async fn retry<T, F, Fut>(&self, mut attempt: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Option<T>>,
    {
        let start = tokio::time::Instant::now();
        let mut delay = self.initial;
        for _ in 0..self.max_steps {
            if let Some(value) = attempt().await {
                return Some(value);
            }
            if start.elapsed() >= self.deadline {
                return None;
            }
            let remaining = self.deadline.saturating_sub(start.elapsed());
            sleep(delay.min(remaining)).await;
            delay = Duration::from_secs_f64(delay.as_secs_f64() * self.factor);
        }
        None
    }
}

/// Resolves pid -> container id -> profile label, caching both hops.
pub struct IdentityResolver {
    cgroup: Arc<dyn CgroupReader>,
    cluster: Arc<dyn ClusterApi>,
    pid_cache: PidToContainerCache,
    pub syscall_name_cache: SyscallIdToNameCache,
    annotation_prefix: String,
    metrics: Arc<Metrics>,
}

impl IdentityResolver {
    pub fn new(
        cgroup: Arc<dyn CgroupReader>,
        cluster: Arc<dyn ClusterApi>,
        pid_cache: PidToContainerCache,
        syscall_name_cache: SyscallIdToNameCache,
        annotation_prefix: String,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cgroup,
            cluster,
            pid_cache,
            syscall_name_cache,
            annotation_prefix,
            metrics,
        }
    }

    /// pid -> container id, consulting the cache first.
    pub fn container_id_for_pid(&self, pid: u32) -> Option<String> {
        if let Some(id) = self.pid_cache.get(pid) {
            return Some(id);
        }
        let cgroup_contents = self.cgroup.read_cgroup(pid).ok()?;
        let container_id = extract_container_id(&cgroup_contents)?;
        self.pid_cache.insert(pid, container_id.clone());
        Some(container_id)
    }

    /// container id -> profile label. Lists cluster workloads scheduled on
    /// this node and scans every container status, stopping as soon as the
    /// requested container id is found (warming `associations.container_profile`
    /// opportunistically for every annotated container seen along the way,
    /// not just the target).
    pub async fn profile_for_container(
        &self,
        container_id: &str,
        associations: &crate::associations::ContainerProfileMap,
    ) -> Option<String> {
        if let Some(label) = associations.get(&container_id.to_string()) {
            return Some(label);
        }

        Backoff::CLUSTER_LOOKUP
            .retry(|| async {
                let workloads = match self.cluster.list_node_workloads().await {
                    Ok(workloads) => workloads,
                    Err(err) => {
                        log::warn!("cluster workload listing failed: {err:#}");
                        self.metrics.inc_cluster_list_failure();
                        return None;
                    }
                };
                let mut found = None;
                for workload in &workloads {
                    for container in &workload.containers {
                        let Some(status_id) = extract_container_id(&container.status_id) else {
                            continue;
                        };
                        if let Some(label) = workload
                            .annotations
                            .get(&format!("{}{}", self.annotation_prefix, container.name))
                            .filter(|label| !label.is_empty())
                        {
                            associations.insert(status_id.clone(), label.clone());
                        }
                        if status_id == container_id {
                            found = associations.get(&status_id);
                            break;
                        }
                    }
                    if found.is_some() {
                        break;
                    }
                }
                found
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_docker_style_container_id() {
        let input = "12:devices:/docker/abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789";
        assert_eq!(
            extract_container_id(input),
            Some("abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789".to_string())
        );
    }

    #[test]
    fn extracts_containerd_style_status_id() {
        let input = "containerd://abc123def456abc123def456";
        assert_eq!(
            extract_container_id(input),
            Some("abc123def456abc123def456".to_string())
        );
    }

    #[test]
    fn no_match_returns_none() {
        assert_eq!(extract_container_id("no container id here"), None);
    }

    #[test]
    fn syscall_name_resolves_known_id() {
        // syscall 0 is read() on x86_64 and io_setup on some other arches;
        // either way it must resolve to a non-empty name.
        let name = syscall_name_for_id(0);
        assert!(name.is_some());
    }

    #[tokio::test]
    async fn container_id_for_pid_caches_after_first_resolution() {
        let cgroup = Arc::new(FakeCgroupReader::new(
            [(1234, "1:devices:/docker/abc123def456abc123def456".to_string())].into(),
        ));
        let cluster = Arc::new(FakeClusterApi::new(vec![]));
        let resolver = IdentityResolver::new(
            cgroup,
            cluster,
            PidToContainerCache::new(1000, Duration::from_secs(3600)),
            SyscallIdToNameCache::new(1000, Duration::from_secs(3600)),
            "syscapd.io/profile-".to_string(),
            Arc::new(Metrics::new()),
        );
        assert_eq!(
            resolver.container_id_for_pid(1234),
            Some("abc123def456abc123def456".to_string())
        );
        // cached path still returns the same answer even though the fake
        // reader only has one entry.
        assert_eq!(
            resolver.container_id_for_pid(1234),
            Some("abc123def456abc123def456".to_string())
        );
    }

    #[tokio::test]
    async fn profile_for_container_warms_cache_for_other_containers() {
        use cluster::ContainerStatus;

        let workload = Workload {
            annotations: [(
                "syscapd.io/profile-web".to_string(),
                "myprofile".to_string(),
            )]
            .into(),
            containers: vec![
                ContainerStatus {
                    name: "sidecar".to_string(),
                    status_id: "containerd://1111222233334444".to_string(),
                },
                ContainerStatus {
                    name: "web".to_string(),
                    status_id: "containerd://5555666677778888".to_string(),
                },
            ],
        };
        let cgroup = Arc::new(FakeCgroupReader::new([].into()));
        let cluster = Arc::new(FakeClusterApi::new(vec![workload]));
        let resolver = IdentityResolver::new(
            cgroup,
            cluster,
            PidToContainerCache::new(1000, Duration::from_secs(3600)),
            SyscallIdToNameCache::new(1000, Duration::from_secs(3600)),
            "syscapd.io/profile-".to_string(),
            Arc::new(Metrics::new()),
        );
        let associations = crate::associations::ContainerProfileMap::new();
        let label = resolver
            .profile_for_container("5555666677778888", &associations)
            .await;
        assert_eq!(label, Some("myprofile".to_string()));
        // The sidecar has no matching annotation, so it is never inserted.
        assert_eq!(
            associations.get(&"1111222233334444".to_string()),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn profile_for_container_counts_cluster_list_failures_until_deadline() {
        let metrics = Arc::new(Metrics::new());
        let resolver = IdentityResolver::new(
            Arc::new(FakeCgroupReader::new([].into())),
            Arc::new(FailingClusterApi),
            PidToContainerCache::new(1000, Duration::from_secs(3600)),
            SyscallIdToNameCache::new(1000, Duration::from_secs(3600)),
            "syscapd.io/profile-".to_string(),
            Arc::clone(&metrics),
        );
        let associations = crate::associations::ContainerProfileMap::new();
        let label = resolver
            .profile_for_container("never-found", &associations)
            .await;
        assert_eq!(label, None);
        assert!(metrics.cluster_list_failures() > 0);
    }
}
