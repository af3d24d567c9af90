use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::capabilities::WorkerCapability;
use crate::error::QueueError;
use crate::models::{BucketId, JobId, WorkerId};
use crate::scheduler::{JobResults, JobState, QueueState};
use crate::server::QueueServer;
use crate::worker::{UtilizationPermission, WorkerStatus};

#[derive(Serialize)]
struct WorkerResponse {
    worker_id: WorkerId,
    status: WorkerStatus,
    in_working_condition: bool,
    utilization_permission: UtilizationPermission,
    bucket_ids_being_processed: Vec<BucketId>,
    capabilities: Vec<WorkerCapability>,
}

#[derive(Serialize)]
struct QueueSummaryResponse {
    ongoing_job_ids: Vec<JobId>,
    running: QueueState,
}

#[derive(Serialize)]
struct ActionResponse {
    success: bool,
    error: Option<String>,
}

/// Maps queue errors onto HTTP statuses.
struct ApiError(QueueError);

impl From<QueueError> for ApiError {
    fn from(error: QueueError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            QueueError::JobNotFound(_) | QueueError::WorkerNotRegistered(_) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::BAD_REQUEST,
        };
        (
            status,
            Json(ActionResponse {
                success: false,
                error: Some(self.0.to_string()),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(server: Arc<QueueServer>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/workers", get(list_workers_handler))
        .route("/api/workers/:worker_id/enable", post(enable_worker_handler))
        .route("/api/workers/:worker_id/disable", post(disable_worker_handler))
        .route("/api/queue", get(queue_summary_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route(
            "/api/jobs/:job_id",
            get(job_state_handler).delete(delete_job_handler),
        )
        .route("/api/jobs/:job_id/results", get(job_results_handler))
        .layer(cors)
        .with_state(server)
}

/// Serves the dashboard on an already bound listener until `shutdown` is cancelled.
pub async fn serve(
    listener: tokio::net::TcpListener,
    server: Arc<QueueServer>,
    shutdown: CancellationToken,
) {
    let app = router(server);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = result {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn list_workers_handler(State(server): State<Arc<QueueServer>>) -> impl IntoResponse {
    let workers: Vec<WorkerResponse> = server
        .worker_status()
        .into_iter()
        .map(|(worker_id, aliveness)| WorkerResponse {
            status: aliveness.status(),
            in_working_condition: aliveness.is_in_working_condition(),
            utilization_permission: aliveness.utilization_permission,
            bucket_ids_being_processed: aliveness.bucket_ids_being_processed.into_iter().collect(),
            capabilities: server.worker_capabilities(&worker_id),
            worker_id,
        })
        .collect();

    Json(workers)
}

async fn enable_worker_handler(
    State(server): State<Arc<QueueServer>>,
    Path(worker_id): Path<String>,
) -> ApiResult<ActionResponse> {
    server.enable_worker(&WorkerId::new(worker_id))?;
    Ok(Json(ActionResponse {
        success: true,
        error: None,
    }))
}

async fn disable_worker_handler(
    State(server): State<Arc<QueueServer>>,
    Path(worker_id): Path<String>,
) -> ApiResult<ActionResponse> {
    server.disable_worker(&WorkerId::new(worker_id))?;
    Ok(Json(ActionResponse {
        success: true,
        error: None,
    }))
}

async fn queue_summary_handler(State(server): State<Arc<QueueServer>>) -> impl IntoResponse {
    Json(QueueSummaryResponse {
        ongoing_job_ids: server.ongoing_job_ids().into_iter().collect(),
        running: server.balancing_queue().running_queue_state(),
    })
}

async fn list_jobs_handler(State(server): State<Arc<QueueServer>>) -> impl IntoResponse {
    Json(server.all_job_states())
}

async fn job_state_handler(
    State(server): State<Arc<QueueServer>>,
    Path(job_id): Path<String>,
) -> ApiResult<JobState> {
    Ok(Json(server.job_state(&JobId::new(job_id))?))
}

async fn job_results_handler(
    State(server): State<Arc<QueueServer>>,
    Path(job_id): Path<String>,
) -> ApiResult<JobResults> {
    Ok(Json(server.job_results(&JobId::new(job_id))?))
}

async fn delete_job_handler(
    State(server): State<Arc<QueueServer>>,
    Path(job_id): Path<String>,
) -> ApiResult<ActionResponse> {
    server.delete_job(&JobId::new(job_id))?;
    Ok(Json(ActionResponse {
        success: true,
        error: None,
    }))
}
