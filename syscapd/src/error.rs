use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// The three RPC-facing error kinds named by the recording contract.
/// Every other failure is either fatal at startup or logged-and-ignored
/// internally; this is the only error surface clients observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    NotRunning,
    NotFound,
    NoSyscallsForMntns,
}

impl RpcError {
    fn status(&self) -> StatusCode {
        match self {
            RpcError::NotRunning => StatusCode::CONFLICT,
            RpcError::NotFound => StatusCode::NOT_FOUND,
            RpcError::NoSyscallsForMntns => StatusCode::NOT_FOUND,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            RpcError::NotRunning => "not-running",
            RpcError::NotFound => "not-found",
            RpcError::NoSyscallsForMntns => "no-syscalls-for-mntns",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let body = ErrorBody { error: self.code() };
        (self.status(), axum::Json(body)).into_response()
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl std::error::Error for RpcError {}
