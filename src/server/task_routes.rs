//! Task routes: submission, listing, management and queue inspection.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, warn};

use super::request_user::RequestUser;
use super::state::{
    GuardedJobQueue, GuardedQueryService, GuardedSubmissionGateway, GuardedTaskController,
    ServerState,
};
use crate::jobs::{
    BatchOperation, BatchOutcome, JobError, JobFilter, JobPriority, JobStatus, JobType,
    SortColumn, SortDirection, SubmitRequest,
};

// =============================================================================
// Error Mapping
// =============================================================================

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        let status = match &self {
            JobError::NotFound(_) => StatusCode::NOT_FOUND,
            JobError::InvalidState(_) | JobError::Validation(_) => StatusCode::BAD_REQUEST,
            JobError::Permission(_) => StatusCode::FORBIDDEN,
            JobError::Transport(_) => StatusCode::BAD_GATEWAY,
            JobError::Database(_) | JobError::Internal(_) => {
                error!("Task request failed: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub priority: Option<String>,
    pub owner: Option<String>,
    pub queue: Option<String>,
    pub is_critical: Option<bool>,
    pub created_after: Option<i64>,
    pub created_before: Option<i64>,
    pub order_by: Option<String>,
    pub order: Option<SortDirection>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct StatisticsQuery {
    pub days: Option<u32>,
    pub owner: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReasonBody {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReasonQuery {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchBody {
    pub operation: BatchOperation,
    pub task_ids: Vec<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub results: Vec<BatchOutcome>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub id: String,
}

// =============================================================================
// Helpers
// =============================================================================

/// Parse a comma-separated set, rejecting unknown values.
fn parse_set<T>(
    raw: Option<&str>,
    field: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Vec<T>, JobError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            parse(s).ok_or_else(|| JobError::Validation(format!("unknown {} '{}'", field, s)))
        })
        .collect()
}

impl ListTasksQuery {
    fn into_filter(self) -> Result<JobFilter, JobError> {
        let order_by = match self.order_by.as_deref() {
            None => SortColumn::default(),
            Some(raw) => SortColumn::from_str(raw)
                .ok_or_else(|| JobError::Validation(format!("cannot order by '{}'", raw)))?,
        };
        Ok(JobFilter {
            statuses: parse_set(self.status.as_deref(), "status", JobStatus::from_str)?,
            types: parse_set(self.job_type.as_deref(), "type", JobType::from_str)?,
            priorities: parse_set(self.priority.as_deref(), "priority", JobPriority::from_str)?,
            owner_user_id: self.owner,
            queue_name: self.queue,
            is_critical: self.is_critical,
            created_after: self.created_after,
            created_before: self.created_before,
            order_by,
            direction: self.order.unwrap_or_default(),
            offset: self.offset,
            limit: self.limit,
        })
    }
}

// =============================================================================
// Task Handlers
// =============================================================================

/// POST /tasks
async fn submit_task(
    user: RequestUser,
    State(gateway): State<GuardedSubmissionGateway>,
    Json(body): Json<SubmitRequest>,
) -> Result<impl IntoResponse, JobError> {
    let record = gateway.submit(&user.user_id, body).await?;
    debug!("User {} submitted task {}", user.user_id, record.id);
    Ok((StatusCode::CREATED, Json(SubmitResponse { id: record.id })))
}

/// GET /tasks
async fn list_tasks(
    user: RequestUser,
    State(query): State<GuardedQueryService>,
    Query(params): Query<ListTasksQuery>,
) -> Result<impl IntoResponse, JobError> {
    let filter = params.into_filter()?;
    let page = query.list(&user.actor(), filter)?;
    Ok(Json(page))
}

/// GET /tasks/statistics
async fn get_statistics(
    user: RequestUser,
    State(query): State<GuardedQueryService>,
    Query(params): Query<StatisticsQuery>,
) -> Result<impl IntoResponse, JobError> {
    let owner = if user.is_admin {
        params.owner
    } else {
        Some(user.user_id.clone())
    };
    let stats = query.statistics(owner.as_deref(), params.days)?;
    Ok(Json(stats))
}

/// GET /tasks/{id}
async fn get_task(
    user: RequestUser,
    State(query): State<GuardedQueryService>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, JobError> {
    Ok(Json(query.get_for(&user.actor(), &task_id)?))
}

/// GET /tasks/{id}/statistics
async fn get_task_statistics(
    user: RequestUser,
    State(query): State<GuardedQueryService>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, JobError> {
    Ok(Json(query.task_statistics(&user.actor(), &task_id)?))
}

/// POST /tasks/{id}/retry
async fn retry_task(
    user: RequestUser,
    State(query): State<GuardedQueryService>,
    State(controller): State<GuardedTaskController>,
    Path(task_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, JobError> {
    query.get_for(&user.actor(), &task_id)?;
    // The body is optional.
    let reason = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<ReasonBody>(&body)
            .map_err(|e| JobError::Validation(format!("invalid retry body: {}", e)))?
            .reason
    };
    let record = controller.retry(&task_id, reason.as_deref()).await?;
    Ok(Json(record))
}

/// DELETE /tasks/{id}
async fn cancel_task(
    user: RequestUser,
    State(query): State<GuardedQueryService>,
    State(controller): State<GuardedTaskController>,
    Path(task_id): Path<String>,
    Query(params): Query<ReasonQuery>,
) -> Result<impl IntoResponse, JobError> {
    query.get_for(&user.actor(), &task_id)?;
    let record = controller.cancel(&task_id, params.reason.as_deref()).await?;
    Ok(Json(record))
}

/// POST /tasks/batch
async fn batch_tasks(
    user: RequestUser,
    State(controller): State<GuardedTaskController>,
    Json(body): Json<BatchBody>,
) -> impl IntoResponse {
    debug!(
        "User {} batch {:?} on {} tasks",
        user.user_id,
        body.operation,
        body.task_ids.len()
    );
    let results = controller
        .batch(
            body.operation,
            &body.task_ids,
            body.reason.as_deref(),
            &user.actor(),
        )
        .await;
    Json(BatchResponse { results })
}

// =============================================================================
// Admin Handlers
// =============================================================================

/// GET /admin/queue
async fn inspect_queue(
    user: RequestUser,
    State(queue): State<GuardedJobQueue>,
) -> Result<impl IntoResponse, JobError> {
    if !user.is_admin {
        return Err(JobError::Permission(
            "queue inspection requires the admin role".to_string(),
        ));
    }
    let inspected = async {
        Ok::<_, crate::jobs::QueueError>(json!({
            "active": queue.inspect_active().await?,
            "scheduled": queue.inspect_scheduled().await?,
            "reserved": queue.inspect_reserved().await?,
            "stats": queue.stats().await?,
        }))
    }
    .await;
    match inspected {
        Ok(body) => Ok(Json(body)),
        Err(e) => {
            warn!("Queue inspection failed: {}", e);
            Err(e.into())
        }
    }
}

// =============================================================================
// Router Construction
// =============================================================================

/// Build the task routes.
///
/// - POST /tasks
/// - GET /tasks
/// - GET /tasks/statistics
/// - POST /tasks/batch
/// - GET /tasks/{id}
/// - DELETE /tasks/{id}
/// - GET /tasks/{id}/statistics
/// - POST /tasks/{id}/retry
/// - GET /admin/queue (admin)
pub fn task_routes() -> Router<ServerState> {
    let task_routes = Router::new()
        .route("/", post(submit_task).get(list_tasks))
        .route("/statistics", get(get_statistics))
        .route("/batch", post(batch_tasks))
        .route("/{id}", get(get_task).delete(cancel_task))
        .route("/{id}/statistics", get(get_task_statistics))
        .route("/{id}/retry", post(retry_task));

    let admin_routes = Router::new().route("/queue", get(inspect_queue));

    Router::new()
        .nest("/tasks", task_routes)
        .nest("/admin", admin_routes)
}
