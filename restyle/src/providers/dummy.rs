//! Dummy image provider
//!
//! Returns the configured URLs (or a fixed set of placeholders) after an optional delay. Useful
//! for local development without provider credentials.

use async_trait::async_trait;
use std::time::Duration;

use crate::{
    config::DummyProviderConfig,
    providers::{GenerationRequest, ImageProvider, ProviderError, Result},
};

pub struct DummyProvider {
    outputs: Vec<String>,
    fail_with: Option<String>,
    delay: Duration,
}

impl From<DummyProviderConfig> for DummyProvider {
    fn from(config: DummyProviderConfig) -> Self {
        Self {
            outputs: config.outputs,
            fail_with: config.fail_with,
            delay: config.delay,
        }
    }
}

#[async_trait]
impl ImageProvider for DummyProvider {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<String>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(message) = &self.fail_with {
            return Err(ProviderError::Failed(message.clone()));
        }

        tracing::info!(model = %request.model, "Dummy provider returning canned outputs");

        if self.outputs.is_empty() {
            // Echo the source image so the UI has something to show
            return Ok(vec![request.image_url.clone(); 4]);
        }
        Ok(self.outputs.clone())
    }
}
