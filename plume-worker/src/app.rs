use std::sync::Arc;

use axum::{
    extract::{Json, State},
    routing::{get, post},
    Router,
};
use plume_core::{JobHandler, JobResponse, Loader};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// A job as the serverless platform submits it.
#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub id: Option<String>,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Completed,
    Failed,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub id: String,
    pub status: JobStatus,
    pub output: JobResponse,
}

// Application state containing the job handler and the process shutdown token.
pub struct AppState<L: Loader> {
    pub handler: JobHandler<L>,
    pub shutdown: CancellationToken,
}

impl<L: Loader> AppState<L> {
    pub fn new(handler: JobHandler<L>, shutdown: CancellationToken) -> Self {
        Self { handler, shutdown }
    }

    /// Runs one job and answers it. A fatal failure also stops the worker.
    pub async fn execute(&self, request: RunRequest) -> RunResponse {
        let id = request
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let result = self.handler.run(&id, &request.input).await;
        let status = match &result {
            Ok(_) => JobStatus::Completed,
            Err(e) => {
                if e.is_fatal() {
                    tracing::error!(job = %id, "fatal error, shutting down worker");
                    self.shutdown.cancel();
                }
                JobStatus::Failed
            }
        };

        RunResponse {
            id,
            status,
            output: result.into(),
        }
    }
}

pub fn router<L: Loader>(state: Arc<AppState<L>>) -> Router {
    Router::new()
        .route("/runsync", post(runsync::<L>))
        .route("/health", get(health))
        .with_state(state)
}

async fn runsync<L: Loader>(
    State(state): State<Arc<AppState<L>>>,
    Json(request): Json<RunRequest>,
) -> Json<RunResponse> {
    Json(state.execute(request).await)
}

async fn health() -> &'static str {
    "ok"
}
