use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use nix::sys::statvfs::statvfs;
use serde::Serialize;

use crate::config::size::format_size;
use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub git: CheckResult,
    pub disk: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: Option<String>) -> Self {
        Self { ok: true, detail }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

/// The proxy cannot serve anything without a working `git` binary.
async fn check_git() -> CheckResult {
    match tokio::process::Command::new("git")
        .arg("--version")
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            CheckResult::healthy(Some(version))
        }
        Ok(output) => CheckResult::unhealthy(format!("git --version exited {}", output.status)),
        Err(e) => CheckResult::unhealthy(format!("git not runnable: {e}")),
    }
}

/// Cache root must exist and its filesystem must be statable.
async fn check_disk(state: &AppState) -> CheckResult {
    let root = state.store.root().to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        statvfs(&root).map(|stat| stat.blocks_available() as u64 * stat.fragment_size() as u64)
    })
    .await;

    match result {
        Ok(Ok(available)) => {
            CheckResult::healthy(Some(format!("{} available", format_size(available))))
        }
        Ok(Err(e)) => CheckResult::unhealthy(format!("statvfs on cache root failed: {e}")),
        Err(e) => CheckResult::unhealthy(format!("disk check task failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler. Returns 200 when all checks pass, 503 otherwise.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (git, disk) = tokio::join!(check_git(), check_disk(&state));

    let checks = HealthChecks { git, disk };
    let status = if checks.git.ok && checks.disk.ok {
        HealthStatus::Ok
    } else {
        HealthStatus::Unhealthy
    };

    let http_status = match status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(HealthResponse { status, checks }))
}
