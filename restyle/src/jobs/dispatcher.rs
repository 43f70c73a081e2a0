//! Job submission: charge, then hand off to the execution channel.
//!
//! ```text
//! submit(account, submission)
//!   ├─ upsert account
//!   ├─ decide eligibility ── none ──▶ InsufficientCredits (no job, no charge)
//!   ├─ create job (queued)
//!   ├─ charge (free_quota_used | job_charge)
//!   └─ enqueue ── error ──▶ queued → failed, refund, EnqueueFailed
//! ```

use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tracing::{info, instrument, warn};
use url::Url;
use uuid::Uuid;

use super::prompt;
use crate::{
    channel::{ChannelError, ExecutionChannel},
    config::GenerationConfig,
    db::{
        errors::DbError,
        models::jobs::{Intensity, JobCreateDBRequest, JobStatus, JobTransition},
    },
    metering::{CreditMeter, MeteringError},
    store::{AccountStore, JobStore, SharedStore},
    types::{JobId, abbrev_uuid},
};

/// What a client asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSubmission {
    pub input_image_url: String,
    pub room_type: String,
    pub style: String,
    pub intensity: Intensity,
}

impl JobSubmission {
    fn validate(&self) -> Result<(), SubmitError> {
        let invalid = |msg: &str| Err(SubmitError::InvalidRequest(msg.to_string()));

        match Url::parse(self.input_image_url.trim()) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => return invalid("input_image_url must be an http(s) URL"),
        }
        if self.room_type.trim().is_empty() {
            return invalid("room_type is required");
        }
        if self.style.trim().is_empty() {
            return invalid("style is required");
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid submission: {0}")]
    InvalidRequest(String),

    #[error("insufficient credits: a job costs {cost}")]
    InsufficientCredits { cost: i64 },

    /// The job was created and charged but never reached the channel. It has been failed and
    /// its charge reversed; the client may retry with a new submission.
    #[error("job {job_id} could not be enqueued: {source}")]
    EnqueueFailed {
        job_id: JobId,
        refunded: bool,
        #[source]
        source: ChannelError,
    },

    #[error(transparent)]
    Metering(MeteringError),

    #[error(transparent)]
    Database(#[from] DbError),
}

impl From<MeteringError> for SubmitError {
    fn from(err: MeteringError) -> Self {
        match err {
            MeteringError::Database(db) => SubmitError::Database(db),
            other => SubmitError::Metering(other),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    store: SharedStore,
    meter: CreditMeter,
    channel: Arc<dyn ExecutionChannel>,
    generation: GenerationConfig,
}

impl Dispatcher {
    pub fn new(store: SharedStore, meter: CreditMeter, channel: Arc<dyn ExecutionChannel>, generation: GenerationConfig) -> Self {
        Self {
            store,
            meter,
            channel,
            generation,
        }
    }

    /// Accept a job for `account_id`. On success the job is charged, `queued`, and the channel
    /// has accepted it.
    #[instrument(skip(self, submission), err)]
    pub async fn submit(&self, account_id: &str, submission: JobSubmission) -> Result<JobId, SubmitError> {
        if let Err(e) = submission.validate() {
            counter!("restyle_jobs_rejected_total", "reason" => "bad_request").increment(1);
            return Err(e);
        }

        let account = self.store.upsert_account(account_id).await?;
        let pricing = *self.meter.pricing();
        let cost = pricing.cost_per_job();

        let Some(mode) = self.meter.decide_eligibility(&account, cost).charge_mode() else {
            counter!("restyle_jobs_rejected_total", "reason" => "insufficient_credits").increment(1);
            info!(credits = account.credits, free_used = account.free_used, cost, "Rejecting job: insufficient credits");
            return Err(SubmitError::InsufficientCredits { cost });
        };

        let job = self
            .store
            .create_job(&JobCreateDBRequest {
                id: Uuid::new_v4(),
                account_id: account_id.to_string(),
                input_image_url: submission.input_image_url.trim().to_string(),
                room_type: submission.room_type.trim().to_string(),
                style: submission.style.trim().to_string(),
                intensity: submission.intensity,
                model: self.generation.model.clone(),
                params: prompt::job_params(&self.generation, pricing.images_per_job, submission.intensity),
            })
            .await?;
        let job_id = job.id;

        if let Err(e) = self.meter.charge(account_id, job_id, cost, mode).await {
            // Lost a race with another submission, or the ledger write failed. The charge
            // reverted itself; close the job so it does not sit in `queued`.
            let reason = match e {
                MeteringError::InsufficientCredits { .. } => "insufficient_credits",
                _ => "charge_failed",
            };
            if let Err(fail_err) = self.store.transition(job_id, JobStatus::Queued, &JobTransition::fail(reason)).await {
                warn!(job_id = %abbrev_uuid(&job_id), error = %fail_err, "Failed to close uncharged job");
            }
            counter!("restyle_jobs_rejected_total", "reason" => reason).increment(1);
            return Err(match e {
                MeteringError::InsufficientCredits { cost, .. } => SubmitError::InsufficientCredits { cost },
                other => other.into(),
            });
        }

        if let Err(source) = self.channel.enqueue(job_id).await {
            counter!("restyle_jobs_enqueue_failed_total").increment(1);
            warn!(job_id = %abbrev_uuid(&job_id), error = %source, "Enqueue failed, failing job and refunding");

            let moved = self
                .store
                .transition(job_id, JobStatus::Queued, &JobTransition::fail(format!("enqueue_failed: {source}")))
                .await?;
            let refunded = if moved {
                self.meter.refund_if_charged(account_id, job_id, cost).await?.is_refunded()
            } else {
                // Something else already moved the job on; it owns the outcome now
                warn!(job_id = %abbrev_uuid(&job_id), "Job left queued before enqueue failure was recorded");
                false
            };
            return Err(SubmitError::EnqueueFailed { job_id, refunded, source });
        }

        counter!("restyle_jobs_submitted_total", "mode" => mode.reason().as_str()).increment(1);
        info!(job_id = %abbrev_uuid(&job_id), cost, mode = %mode.reason(), "Job submitted");
        Ok(job_id)
    }
}
