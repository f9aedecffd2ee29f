use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use caps::{CapSet, Capability};
use clap::Parser;
use log::{error, info};

use syscapd::cache::{PidToContainerCache, SyscallIdToNameCache};
use syscapd::identity::{IdentityResolver, KubernetesClusterApi, ProcfsCgroupReader};
use syscapd::loader;
use syscapd::recording::RecordingController;
use syscapd::relay::{MetricsSink, UnixSocketMetricsSink};
use syscapd::rpc;
use syscapd::state::AppState;
use syscapd::Config;

#[derive(Parser, Debug)]
#[command(name = "syscapd")]
#[command(about = "eBPF syscall recorder that attributes kernel syscalls to container workloads")]
struct Args {
    /// Override the config file path (also settable via SYSCAPD_CONFIG).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Skip the CAP_BPF/CAP_PERFMON/CAP_SYS_ADMIN and kernel version checks.
    #[arg(long)]
    skip_environment_checks: bool,
}

fn check_capabilities() -> Result<()> {
    let required = [
        Capability::CAP_BPF,
        Capability::CAP_PERFMON,
        Capability::CAP_SYS_ADMIN,
    ];
    for cap in &required {
        let has_cap = caps::has_cap(None, CapSet::Effective, *cap)
            .with_context(|| format!("failed to query capability {cap:?}"))?;
        if !has_cap {
            anyhow::bail!(
                "missing {:?} capability. Grant it with `sudo setcap cap_bpf,cap_perfmon,cap_sys_admin+ep $(command -v syscapd)` and restart.",
                cap
            );
        }
    }
    Ok(())
}

fn ensure_environment(config: &Config) -> Result<()> {
    check_capabilities()?;
    std::env::var(&config.cluster.node_name_env).with_context(|| {
        format!(
            "{} env var is required to identify this agent's host",
            config.cluster.node_name_env
        )
    })?;
    Ok(())
}

async fn build_state(config: &Config) -> Result<Arc<AppState>> {
    let node_name = std::env::var(&config.cluster.node_name_env).with_context(|| {
        format!(
            "{} env var is required to identify this agent's host",
            config.cluster.node_name_env
        )
    })?;

    let metrics = Arc::new(syscapd::metrics::Metrics::new());

    let cgroup = Arc::new(ProcfsCgroupReader);
    let cluster = Arc::new(KubernetesClusterApi::new(
        config.cluster.api_server.clone(),
        node_name.clone(),
        config.cluster.service_account_dir.clone(),
    )?);
    let identity = IdentityResolver::new(
        cgroup,
        cluster,
        PidToContainerCache::new(
            config.recording.pid_cache_capacity,
            std::time::Duration::from_secs(config.recording.pid_cache_ttl_secs),
        ),
        SyscallIdToNameCache::new(
            config.recording.syscall_name_cache_capacity,
            std::time::Duration::from_secs(config.recording.pid_cache_ttl_secs),
        ),
        config.cluster.annotation_prefix.clone(),
        Arc::clone(&metrics),
    );

    let recording = RecordingController::new(
        config.recording.bpf_object_env.clone(),
        None,
        config.recording.filter_program_name.clone(),
    );

    let metrics_sink: Arc<dyn MetricsSink> = if config.metrics.enabled {
        Arc::new(UnixSocketMetricsSink::connect(config.metrics.socket_path.clone()).await)
    } else {
        Arc::new(NoopMetricsSink)
    };

    Ok(Arc::new(AppState::new(
        node_name,
        identity,
        recording,
        metrics_sink,
        metrics,
    )))
}

/// A sink that drops every record, used when the metrics relay is disabled
/// in config.
struct NoopMetricsSink;

#[async_trait::async_trait]
impl MetricsSink for NoopMetricsSink {
    async fn send(&self, _record: syscapd::relay::MetricRecord) {}
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if let Some(path) = &args.config {
        // SAFETY: single-threaded at this point in startup, before any
        // task that might read the environment concurrently is spawned.
        unsafe {
            std::env::set_var("SYSCAPD_CONFIG", path);
        }
    }

    let config = Config::load();

    if !args.skip_environment_checks {
        if let Err(err) = ensure_environment(&config) {
            error!("environment check failed: {err:#}");
            return Err(err);
        }
    }

    let state = build_state(&config).await?;
    run(state, config).await
}

/// Self-tests the full load/attach/detach cycle once before serving RPC
/// traffic, so a broken BTF offset derivation or missing kernel object
/// fails startup loudly instead of surfacing on the first `Start` call.
async fn self_test_load_cycle(state: Arc<AppState>, config: &Config) -> Result<()> {
    let loaded = loader::load(
        &config.recording.bpf_object_env,
        None,
        config.recording.filter_program_name.as_deref(),
        state,
        false,
    )
    .await
    .context("startup self-test failed to load the recorder program")?;
    loader::unload(loaded);
    info!("startup self-test load/unload cycle succeeded");
    Ok(())
}

async fn run(state: Arc<AppState>, config: Config) -> Result<()> {
    self_test_load_cycle(Arc::clone(&state), &config).await?;

    rpc::serve(
        &config.rpc.socket_path,
        config.rpc.socket_uid,
        config.rpc.socket_gid,
        state,
        config.rpc.max_body_bytes,
        shutdown_signal(),
    )
    .await
}
