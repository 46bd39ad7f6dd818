//! Health check endpoints

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;

use crate::db::DbPool;
use crate::process::ProcessManager;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Readiness response
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub database: CheckResult,
    pub running_instances: usize,
}

/// Result of a single check
#[derive(Serialize)]
pub struct CheckResult {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckResult {
    const fn ok() -> Self {
        Self {
            status: "ok",
            message: None,
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            status: "fail",
            message: Some(message.into()),
        }
    }
}

#[derive(Clone)]
struct ReadyState {
    db: DbPool,
    processes: ProcessManager,
}

/// Liveness probe
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness probe: can the runner reach its database?
async fn ready(State(state): State<ReadyState>) -> (StatusCode, Json<ReadinessResponse>) {
    let database = check_database(&state.db);
    let ok = database.status == "ok";

    (
        if ok {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        },
        Json(ReadinessResponse {
            status: if ok { "ok" } else { "degraded" },
            database,
            running_instances: state.processes.running_count(),
        }),
    )
}

fn check_database(db: &DbPool) -> CheckResult {
    match db.get() {
        Ok(conn) => match conn.query_row("SELECT 1", [], |_| Ok(())) {
            Ok(()) => CheckResult::ok(),
            Err(e) => CheckResult::fail(format!("query failed: {e}")),
        },
        Err(e) => CheckResult::fail(format!("connection failed: {e}")),
    }
}

/// Liveness router, no state needed
pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

/// Readiness router backed by the runner's database and process table
pub fn ready_router(db: DbPool, processes: ProcessManager) -> Router {
    Router::new()
        .route("/ready", get(ready))
        .with_state(ReadyState { db, processes })
}
