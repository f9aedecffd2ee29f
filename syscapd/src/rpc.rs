//! RPC surface (C8): a Unix-domain-socket HTTP front end exposing
//! `Start`/`Stop`/`SyscallsForProfile` (§4.8/§6).

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{DefaultBodyLimit, State};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::net::UnixListener;

use crate::error::RpcError;
use crate::metrics::RpcOutcome;
use crate::report;
use crate::state::AppState;

const REQUEST_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct Empty {}

#[derive(Deserialize)]
struct SyscallsForProfileRequest {
    name: String,
}

async fn start(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.recording.start(Arc::clone(&state)).await {
        Ok(()) => {
            state
                .metrics
                .set_recording_active_count(if state.recording.is_running() { 1 } else { 0 });
            Json(Empty {}).into_response()
        }
        Err(err) => {
            error!("Start failed: {err:#}");
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.recording.stop().await;
    Json(Empty {}).into_response()
}

async fn syscalls_for_profile(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyscallsForProfileRequest>,
) -> impl IntoResponse {
    let started = Instant::now();
    let result = tokio::time::timeout(
        REQUEST_DEADLINE,
        report::syscalls_for_profile(&state, &req.name),
    )
    .await
    .unwrap_or(Err(RpcError::NotFound));

    let outcome = match &result {
        Ok(_) => RpcOutcome::Ok,
        Err(RpcError::NotRunning) => RpcOutcome::NotRunning,
        Err(RpcError::NotFound) => RpcOutcome::NotFound,
        Err(RpcError::NoSyscallsForMntns) => RpcOutcome::NoSyscallsForMntns,
    };
    state
        .metrics
        .record_rpc_outcome(outcome, started.elapsed().as_micros() as u64);

    match result {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

pub fn router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/v1/start", post(start))
        .route("/v1/stop", post(stop))
        .route("/v1/syscalls_for_profile", post(syscalls_for_profile))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

/// Binds the RPC Unix socket, removing any stale file first, and serves
/// until the given future resolves (a termination signal, in production).
pub async fn serve(
    socket_path: &str,
    socket_uid: u32,
    socket_gid: u32,
    state: Arc<AppState>,
    max_body_bytes: usize,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = Path::new(socket_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    chown_socket(socket_path, socket_uid, socket_gid);

    info!("RPC surface listening on {socket_path}");
    let app = router(state, max_body_bytes);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn chown_socket(path: &str, uid: u32, gid: u32) {
    let c_path = match std::ffi::CString::new(path) {
        Ok(p) => p,
        Err(_) => return,
    };
    // SAFETY: `chown` is called on a path we just created via `bind`, with
    // a NUL-terminated buffer we just constructed.
    let result = unsafe { libc::chown(c_path.as_ptr(), uid, gid) };
    if result != 0 {
        log::warn!(
            "failed to chown {path} to {uid}:{gid}: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{PidToContainerCache, SyscallIdToNameCache};
    use crate::identity::{FakeCgroupReader, FakeClusterApi, IdentityResolver};
    use crate::metrics::Metrics;
    use crate::recording::RecordingController;
    use crate::relay::FakeMetricsSink;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashMap;
    use std::time::Duration as StdDuration;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let metrics = Arc::new(Metrics::new());
        let identity = IdentityResolver::new(
            Arc::new(FakeCgroupReader::new(HashMap::new())),
            Arc::new(FakeClusterApi::new(vec![])),
            PidToContainerCache::new(1000, StdDuration::from_secs(3600)),
            SyscallIdToNameCache::new(1000, StdDuration::from_secs(3600)),
            "syscapd.io/profile-".to_string(),
            Arc::clone(&metrics),
        );
        let recording = RecordingController::new("SYSCAPD_BPF_PATH".to_string(), None, None);
        Arc::new(AppState::new(
            "node-1".to_string(),
            identity,
            recording,
            FakeMetricsSink::new(),
            metrics,
        ))
    }

    #[tokio::test]
    async fn syscalls_for_profile_returns_not_running_when_counter_is_zero() {
        let state = test_state();
        let app = router(state, 16 * 1024 * 1024);
        let request = Request::builder()
            .method("POST")
            .uri("/v1/syscalls_for_profile")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"name":"ghost"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::CONFLICT);
    }
}
