//! Execution channel backed by an external at-least-once message relay.
//!
//! The relay is given the worker URL and the message body; it owns retries and signs its own
//! deliveries with the shared `whsec_` secret.

use super::{ChannelError, ExecutionChannel, RunJobMessage};
use crate::{config::RelayChannelConfig, types::JobId};
use serde::Serialize;
use url::Url;

#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    url: &'a str,
    body: RunJobMessage,
}

pub struct RelayChannel {
    target: String,
    publish_url: Url,
    token: String,
    http_client: reqwest::Client,
}

impl RelayChannel {
    pub fn new(target: String, config: &RelayChannelConfig) -> Result<Self, ChannelError> {
        let http_client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            target,
            publish_url: config.publish_url.clone(),
            token: config.token.clone(),
            http_client,
        })
    }
}

#[async_trait::async_trait]
impl ExecutionChannel for RelayChannel {
    #[tracing::instrument(skip(self), err)]
    async fn enqueue(&self, job_id: JobId) -> Result<(), ChannelError> {
        let request = PublishRequest {
            url: &self.target,
            body: RunJobMessage { job_id },
        };

        let response = self
            .http_client
            .post(self.publish_url.clone())
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChannelError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
