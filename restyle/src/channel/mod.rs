//! Execution channels: how an accepted job reaches the worker entry point.
//!
//! A channel only carries the job id. Everything else is read back from the store by the
//! [`crate::jobs::reconciler::WorkerReconciler`] when the delivery arrives. Delivery is
//! at-least-once; duplicates are absorbed by the job state machine, not deduplicated here.
//!
//! `enqueue` reports failure from the dispatch call's own result: a job whose `enqueue` returned
//! `Ok` is considered handed off, and the dispatcher does not wait for any later confirmation.

pub mod local;
pub mod relay;
pub mod signing;

use crate::{
    config::{ChannelConfig, Config},
    types::JobId,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

/// Body of a worker delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RunJobMessage {
    #[serde(alias = "jobId")]
    #[schema(value_type = String, format = "uuid")]
    pub job_id: JobId,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("delivery buffer is full")]
    Full,

    #[error("delivery channel is closed")]
    Closed,

    #[error("signing secret is not a valid whsec_ secret")]
    InvalidSecret,

    #[error("publish rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait ExecutionChannel: Send + Sync {
    /// Hand a job to the channel. `Ok` means the channel accepted responsibility for delivery.
    async fn enqueue(&self, job_id: JobId) -> Result<(), ChannelError>;
}

/// Build the configured channel. The local channel spawns its sender task, which stops when
/// `shutdown` is cancelled.
pub fn create_channel(config: &Config, shutdown: CancellationToken) -> Result<Arc<dyn ExecutionChannel>, ChannelError> {
    let target = config.worker_endpoint();
    match &config.channel {
        ChannelConfig::Local(local) => {
            let secret = config.worker.signing_secret.clone().ok_or(ChannelError::InvalidSecret)?;
            Ok(Arc::new(local::LocalChannel::spawn(target, secret, local, shutdown)?))
        }
        ChannelConfig::Relay(relay) => Ok(Arc::new(relay::RelayChannel::new(target, relay)?)),
    }
}
