use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/syscapd/syscapd.toml";
const ENV_CONFIG_PATH: &str = "SYSCAPD_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `SYSCAPD_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RpcConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    #[serde(default = "default_socket_uid")]
    pub socket_uid: u32,
    #[serde(default = "default_socket_gid")]
    pub socket_gid: u32,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            socket_uid: default_socket_uid(),
            socket_gid: default_socket_gid(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_socket_path() -> String {
    "/run/syscapd/syscapd.sock".to_string()
}
fn default_socket_uid() -> u32 {
    65534 // nobody
}
fn default_socket_gid() -> u32 {
    65534 // nogroup
}
fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecordingConfig {
    #[serde(default = "default_filter_program_name")]
    pub filter_program_name: Option<String>,
    #[serde(default = "default_bpf_object_path_env")]
    pub bpf_object_env: String,
    #[serde(default = "default_pid_cache_ttl_secs")]
    pub pid_cache_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub pid_cache_capacity: u64,
    #[serde(default = "default_cache_capacity")]
    pub syscall_name_cache_capacity: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            filter_program_name: default_filter_program_name(),
            bpf_object_env: default_bpf_object_path_env(),
            pid_cache_ttl_secs: default_pid_cache_ttl_secs(),
            pid_cache_capacity: default_cache_capacity(),
            syscall_name_cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_filter_program_name() -> Option<String> {
    None
}
fn default_bpf_object_path_env() -> String {
    "SYSCAPD_BPF_PATH".to_string()
}
fn default_pid_cache_ttl_secs() -> u64 {
    3600
}
fn default_cache_capacity() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    #[serde(default = "default_node_name_env")]
    pub node_name_env: String,
    #[serde(default = "default_annotation_prefix")]
    pub annotation_prefix: String,
    #[serde(default = "default_api_server")]
    pub api_server: String,
    #[serde(default = "default_service_account_dir")]
    pub service_account_dir: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_name_env: default_node_name_env(),
            annotation_prefix: default_annotation_prefix(),
            api_server: default_api_server(),
            service_account_dir: default_service_account_dir(),
        }
    }
}

fn default_node_name_env() -> String {
    "NODE_NAME".to_string()
}
fn default_annotation_prefix() -> String {
    "syscapd.io/profile-".to_string()
}
fn default_api_server() -> String {
    "https://kubernetes.default.svc".to_string()
}
fn default_service_account_dir() -> PathBuf {
    PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount")
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_socket_path")]
    pub socket_path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socket_path: default_metrics_socket_path(),
        }
    }
}

fn default_metrics_socket_path() -> String {
    "/run/syscapd/metrics.sock".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"[rpc]
socket_path = "/tmp/syscapd.sock"
[recording]
filter_program_name = "nginx"
[cluster]
annotation_prefix = "syscapd.io/profile-"
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.rpc.socket_path, "/tmp/syscapd.sock");
        assert_eq!(cfg.rpc.max_body_bytes, 16 * 1024 * 1024);
        assert_eq!(
            cfg.recording.filter_program_name.as_deref(),
            Some("nginx")
        );
        assert_eq!(cfg.recording.pid_cache_ttl_secs, 3600);
        assert_eq!(cfg.recording.pid_cache_capacity, 1000);
        assert_eq!(cfg.cluster.annotation_prefix, "syscapd.io/profile-");
        assert!(!cfg.metrics.enabled);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, "/nonexistent/path/syscapd.toml");
        }
        let cfg = Config::load();
        assert_eq!(cfg.rpc.socket_path, default_socket_path());
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }

    #[test]
    fn env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[rpc]\nsocket_path = \"/tmp/custom.sock\"").unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, file.path());
        }
        let cfg = Config::load();
        assert_eq!(cfg.rpc.socket_path, "/tmp/custom.sock");
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }
}
