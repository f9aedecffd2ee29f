use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

/// A single container's status as read off a workload's pod status.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    /// The runtime-reported container id, e.g. `containerd://<id>` or
    /// `docker://<id>`. Empty when the container hasn't started yet.
    #[serde(rename = "containerID", default)]
    pub status_id: String,
}

/// A workload scheduled on this node: its annotations and the container
/// statuses of every init- and main-container.
#[derive(Debug, Clone, Default)]
pub struct Workload {
    pub annotations: HashMap<String, String>,
    pub containers: Vec<ContainerStatus>,
}

/// Narrow capability over the cluster API's view of workloads scheduled on
/// this node, so the identity resolver can be tested without a real
/// cluster (§9 design notes).
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_node_workloads(&self) -> anyhow::Result<Vec<Workload>>;
}

/// Talks to the in-cluster Kubernetes API server over the service-account
/// token/CA bundle convention, listing pods scheduled on `node_name` and
/// flattening init- and main-container statuses into `Workload`s.
pub struct KubernetesClusterApi {
    client: reqwest::Client,
    api_server: String,
    node_name: String,
    token_path: PathBuf,
}

#[derive(Deserialize)]
struct PodList {
    items: Vec<Pod>,
}

#[derive(Deserialize)]
struct Pod {
    metadata: PodMetadata,
    status: Option<PodStatus>,
}

#[derive(Deserialize, Default)]
struct PodMetadata {
    #[serde(default)]
    annotations: HashMap<String, String>,
}

#[derive(Deserialize, Default)]
struct PodStatus {
    #[serde(rename = "initContainerStatuses", default)]
    init_container_statuses: Vec<ContainerStatus>,
    #[serde(rename = "containerStatuses", default)]
    container_statuses: Vec<ContainerStatus>,
}

impl KubernetesClusterApi {
    pub fn new(api_server: String, node_name: String, service_account_dir: PathBuf) -> anyhow::Result<Self> {
        let ca_path = service_account_dir.join("ca.crt");
        let mut builder = reqwest::Client::builder();
        if let Ok(ca_pem) = std::fs::read(&ca_path) {
            let cert = reqwest::Certificate::from_pem(&ca_pem)?;
            builder = builder.add_root_certificate(cert);
        }
        Ok(Self {
            client: builder.build()?,
            api_server,
            node_name,
            token_path: service_account_dir.join("token"),
        })
    }

    fn bearer_token(&self) -> anyhow::Result<String> {
        Ok(std::fs::read_to_string(&self.token_path)?.trim().to_string())
    }
}

#[async_trait]
impl ClusterApi for KubernetesClusterApi {
    async fn list_node_workloads(&self) -> anyhow::Result<Vec<Workload>> {
        let token = self.bearer_token()?;
        let url = format!(
            "{}/api/v1/pods?fieldSelector=spec.nodeName={}",
            self.api_server, self.node_name
        );
        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?;
        let list: PodList = resp.json().await?;
        Ok(list
            .items
            .into_iter()
            .map(|pod| {
                let status = pod.status.unwrap_or_default();
                let mut containers = status.init_container_statuses;
                containers.extend(status.container_statuses);
                Workload {
                    annotations: pod.metadata.annotations,
                    containers,
                }
            })
            .collect())
    }
}

/// In-memory fake for tests: returns a fixed listing every call.
pub struct FakeClusterApi {
    workloads: RwLock<Vec<Workload>>,
}

impl FakeClusterApi {
    pub fn new(workloads: Vec<Workload>) -> Self {
        Self {
            workloads: RwLock::new(workloads),
        }
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn list_node_workloads(&self) -> anyhow::Result<Vec<Workload>> {
        Ok(self.workloads.read().unwrap().clone())
    }
}

/// In-memory fake that always fails, for exercising the cluster-list
/// failure/retry path (§7).
pub struct FailingClusterApi;

#[async_trait]
impl ClusterApi for FailingClusterApi {
    async fn list_node_workloads(&self) -> anyhow::Result<Vec<Workload>> {
        Err(anyhow::anyhow!("cluster API unreachable"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_returns_configured_workloads() {
        let workload = Workload {
            annotations: [("syscapd.io/profile-web".to_string(), "p".to_string())].into(),
            containers: vec![ContainerStatus {
                name: "web".to_string(),
                status_id: "containerd://abc".to_string(),
            }],
        };
        let api = FakeClusterApi::new(vec![workload]);
        let listing = api.list_node_workloads().await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].containers[0].name, "web");
    }
}
