//! HTTP handlers for job submission and job history.

use crate::{
    AppState,
    api::models::{
        jobs::{JobCreate, JobCreated, JobListResponse, JobResponse},
        pagination::CursorPagination,
    },
    auth::CurrentAccount,
    db::models::jobs::JobListFilter,
    errors::{Error, ErrorBody, Result},
    types::JobId,
};
use axum::{
    extract::{Path, Query, State, rejection::JsonRejection},
    response::Json,
};

/// Submit a job
#[utoipa::path(
    post,
    path = "/jobs",
    tag = "jobs",
    summary = "Submit a restyling job",
    description = "Charges the job (free quota first, then paid credits) and hands it to the execution channel. \
                   Poll the job by id for its outcome.",
    request_body = JobCreate,
    responses(
        (status = 200, description = "Job accepted", body = JobCreated),
        (status = 400, description = "Malformed submission", body = ErrorBody),
        (status = 401, description = "Unauthorized", body = ErrorBody),
        (status = 402, description = "Insufficient credits; no job was created", body = ErrorBody),
        (status = 502, description = "The job could not be enqueued; its charge was reversed", body = ErrorBody),
        (status = 500, description = "Internal server error", body = ErrorBody),
    ),
    security(("X-Restyle-Account" = []))
)]
#[tracing::instrument(skip_all, fields(account_id = %account.id))]
pub async fn create_job(
    State(state): State<AppState>,
    account: CurrentAccount,
    payload: std::result::Result<Json<JobCreate>, JsonRejection>,
) -> Result<Json<JobCreated>> {
    let Json(data) = payload?;
    let job_id = state.dispatcher.submit(&account.id, data.into()).await?;
    Ok(Json(JobCreated { job_id }))
}

/// Get a job with its outputs
#[utoipa::path(
    get,
    path = "/jobs/{job_id}",
    tag = "jobs",
    summary = "Get a job",
    params(
        ("job_id" = String, Path, description = "Job ID (UUID)"),
    ),
    responses(
        (status = 200, description = "Job status and outputs", body = JobResponse),
        (status = 401, description = "Unauthorized", body = ErrorBody),
        (status = 404, description = "Job not found", body = ErrorBody),
    ),
    security(("X-Restyle-Account" = []))
)]
#[tracing::instrument(skip_all, fields(account_id = %account.id))]
pub async fn get_job(State(state): State<AppState>, Path(job_id): Path<JobId>, account: CurrentAccount) -> Result<Json<JobResponse>> {
    let not_found = || Error::NotFound {
        resource: "Job".to_string(),
        id: job_id.to_string(),
    };

    let job = state.store.get_job(job_id).await?.ok_or_else(not_found)?;
    // Other accounts' jobs are indistinguishable from missing ones
    if job.account_id != account.id {
        return Err(not_found());
    }
    Ok(Json(job.into()))
}

/// List the caller's jobs, newest first
#[utoipa::path(
    get,
    path = "/jobs",
    tag = "jobs",
    summary = "List jobs",
    params(CursorPagination),
    responses(
        (status = 200, description = "A page of jobs with their outputs", body = JobListResponse),
        (status = 401, description = "Unauthorized", body = ErrorBody),
    ),
    security(("X-Restyle-Account" = []))
)]
#[tracing::instrument(skip_all, fields(account_id = %account.id))]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(pagination): Query<CursorPagination>,
    account: CurrentAccount,
) -> Result<Json<JobListResponse>> {
    let limit = pagination.limit();
    let jobs = state
        .store
        .list_jobs(&JobListFilter {
            account_id: account.id,
            before: pagination.before,
            limit,
        })
        .await?;

    let next_cursor = jobs.last().map(|job| job.created_at);

    Ok(Json(JobListResponse {
        items: jobs.into_iter().map(Into::into).collect(),
        next_cursor,
    }))
}
