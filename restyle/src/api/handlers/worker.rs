//! Worker entry point, called by the execution channel once per delivery.
//!
//! Deliveries are signed with the Standard Webhooks scheme; the signature is checked against the
//! raw body before anything is read from the store. Responses tell the channel whether to stop
//! retrying: any 2xx or 404 is final, a 5xx asks for redelivery.
//!
//! The run itself is spawned onto its own task. A channel that gives up waiting drops this
//! handler's future, but a job that reached `running` still finishes and records its outcome.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
};
use bytes::Bytes;
use metrics::counter;
use tracing::{Instrument, error, warn};

use crate::{
    AppState,
    api::models::worker::RunJobResponse,
    channel::{RunJobMessage, signing},
    errors::{Error, ErrorBody, Result},
    jobs::RunOutcome,
    metering::RefundOutcome,
};

/// Run a queued job
#[utoipa::path(
    post,
    path = "/internal/worker/run-job",
    tag = "worker",
    summary = "Run a job (execution channel only)",
    description = "Executes a queued job at most once. Repeated deliveries of a job that is no longer queued \
                   are acknowledged without doing any work.",
    request_body = RunJobMessage,
    responses(
        (status = 200, description = "Delivery handled; `ok` is false if the job failed", body = RunJobResponse),
        (status = 400, description = "Body is not a run-job message", body = ErrorBody),
        (status = 401, description = "Missing or invalid delivery signature", body = ErrorBody),
        (status = 404, description = "Unknown job", body = RunJobResponse),
        (status = 500, description = "Datastore error; the channel should redeliver", body = ErrorBody),
    ),
    security(("WebhookSignature" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn run_job(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<(StatusCode, Json<RunJobResponse>)> {
    let Some(secret) = state.config.worker.signing_secret.as_deref() else {
        return Err(Error::Unauthenticated {
            message: Some("Worker signing secret is not configured".to_string()),
        });
    };

    if let Err(e) = signing::verify_delivery(&headers, &body, secret, state.config.worker.timestamp_tolerance) {
        warn!(error = %e, "Rejected worker delivery");
        counter!("restyle_worker_deliveries_rejected_total").increment(1);
        return Err(Error::Unauthenticated {
            message: Some(format!("Invalid delivery signature: {e}")),
        });
    }

    let message: RunJobMessage = serde_json::from_slice(&body).map_err(|e| Error::BadRequest {
        message: format!("Invalid run-job message: {e}"),
    })?;

    let reconciler = state.reconciler.clone();
    let run = tokio::spawn(async move { reconciler.run(message.job_id).await }.in_current_span());
    let outcome = run.await.map_err(|e| {
        error!(error = %e, "Worker run task did not complete");
        Error::Internal {
            operation: "run job".to_string(),
        }
    })??;

    let (status, ack) = match outcome {
        RunOutcome::NotFound => (StatusCode::NOT_FOUND, RunJobResponse::not_ok()),
        RunOutcome::AlreadyHandled { .. } | RunOutcome::Succeeded { .. } => (StatusCode::OK, RunJobResponse::ok()),
        RunOutcome::Failed { refund, .. } => {
            let refunded = matches!(refund, Some(RefundOutcome::Refunded { .. } | RefundOutcome::AlreadyRefunded));
            (StatusCode::OK, RunJobResponse::failed(refunded))
        }
    };

    Ok((status, Json(ack)))
}
