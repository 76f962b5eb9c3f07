use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use trove_core::error::AppError;
use trove_core::job::JobState;
use trove_db::{ProductQuery, ProductSort};

use crate::auth::require_api_key;
use crate::dto::{
    CancelJobResponse, CreateJobRequest, CreateJobResponse, DeleteProductsRequest,
    DeleteProductsResponse, ErrorResponse, HealthResponse, JobListResponse, JobStatusResponse,
    JobSummaryResponse, ListJobsQuery, ListProductsQuery, ProductListResponse, ProductResponse,
    SystemStatusResponse,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;
const MAX_DELETE_BATCH: usize = 1000;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/v1/jobs", get(list_jobs).post(create_job))
        .route("/v1/jobs/{id}", get(get_job).delete(cancel_job))
        .route("/v1/products", get(list_products).delete(delete_products))
        .route("/v1/system/status", get(system_status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(api).with_state(state)
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/jobs",
    request_body = CreateJobRequest,
    responses(
        (status = 202, description = "Job started", body = CreateJobResponse),
        (status = 400, description = "Invalid request", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body.into_request().map_err(AppError::ValidationError)?;
    let job_id = state.jobs.start(request)?;
    let job_state = state.jobs.status(job_id)?.summary.state;

    tracing::info!(%job_id, "Job accepted");
    let response = CreateJobResponse {
        job_id,
        state: job_state.to_string(),
    };
    Ok((StatusCode::ACCEPTED, axum::Json(response)))
}

#[utoipa::path(
    get,
    path = "/v1/jobs",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Jobs, newest first", body = JobListResponse),
        (status = 400, description = "Unknown state", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let state_filter = query
        .state
        .map(|s| s.parse::<JobState>().map_err(AppError::ValidationError))
        .transpose()?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);

    let jobs: Vec<JobSummaryResponse> = state
        .jobs
        .list(state_filter, limit)
        .into_iter()
        .map(Into::into)
        .collect();
    let total = jobs.len();

    Ok(axum::Json(JobListResponse { jobs, total }))
}

#[utoipa::path(
    get,
    path = "/v1/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job status and results so far", body = JobStatusResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.jobs.status(id)?;
    Ok(axum::Json(JobStatusResponse::from(snapshot)))
}

#[utoipa::path(
    delete,
    path = "/v1/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Cancellation requested (no-op for finished jobs)", body = CancelJobResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job_state = state.jobs.cancel(id)?;
    Ok(axum::Json(CancelJobResponse {
        job_id: id,
        state: job_state.to_string(),
    }))
}

// ---------------------------------------------------------------------------
// Products
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/products",
    params(ListProductsQuery),
    responses(
        (status = 200, description = "Stored products", body = ProductListResponse),
        (status = 400, description = "Invalid filters", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
        (status = 503, description = "No database configured", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "products"
)]
pub async fn list_products(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListProductsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(repo) = &state.products else {
        return Ok(storage_unavailable());
    };

    let sort = query
        .sort
        .as_deref()
        .map(str::parse::<ProductSort>)
        .transpose()?
        .unwrap_or_default();
    let page = repo
        .list(&ProductQuery {
            source: query.source,
            category: query.category,
            min_price: query.min_price,
            max_price: query.max_price,
            search: query.q,
            sort,
            limit: query.limit.unwrap_or(DEFAULT_LIST_LIMIT as u32),
            offset: query.offset.unwrap_or(0),
        })
        .await?;

    let response = ProductListResponse {
        total: page.total,
        products: page.products.into_iter().map(ProductResponse::from).collect(),
    };
    Ok(axum::Json(response).into_response())
}

#[utoipa::path(
    delete,
    path = "/v1/products",
    request_body = DeleteProductsRequest,
    responses(
        (status = 200, description = "Products deleted", body = DeleteProductsResponse),
        (status = 400, description = "Empty or oversized batch", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
        (status = 503, description = "No database configured", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "products"
)]
pub async fn delete_products(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<DeleteProductsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(repo) = &state.products else {
        return Ok(storage_unavailable());
    };
    if body.fingerprints.is_empty() {
        return Err(AppError::ValidationError("fingerprints must not be empty".into()).into());
    }
    if body.fingerprints.len() > MAX_DELETE_BATCH {
        return Err(AppError::ValidationError(format!(
            "at most {MAX_DELETE_BATCH} fingerprints per request"
        ))
        .into());
    }

    let deleted = repo.delete(&body.fingerprints).await?;
    Ok(axum::Json(DeleteProductsResponse { deleted }).into_response())
}

fn storage_unavailable() -> axum::response::Response {
    let body = ErrorResponse {
        error: "unavailable".to_string(),
        message: "Product storage is not configured (set DATABASE_URL)".to_string(),
    };
    (StatusCode::SERVICE_UNAVAILABLE, axum::Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/system/status",
    responses(
        (status = 200, description = "Engine status", body = SystemStatusResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "system"
)]
pub async fn system_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let response = SystemStatusResponse {
        sources: state.jobs.sources(),
        jobs: state.jobs.counts().into(),
        usable_identities: state.jobs.usable_identities(),
        identities: state
            .jobs
            .identity_stats()
            .into_iter()
            .map(Into::into)
            .collect(),
        rates: state.jobs.rate_stats().into_iter().map(Into::into).collect(),
        pending_images: state.jobs.pending_images(),
    };
    axum::Json(response)
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service healthy", body = HealthResponse),
        (status = 503, description = "Database unreachable", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = match &state.products {
        None => "disabled",
        Some(repo) => match repo.health_check().await {
            Ok(()) => "ok",
            Err(e) => {
                tracing::warn!(error = %e, "Database health check failed");
                "error"
            }
        },
    };

    let (status, label) = if database == "error" {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else {
        (StatusCode::OK, "healthy")
    };
    (
        status,
        axum::Json(HealthResponse {
            status: label,
            database,
        }),
    )
}
