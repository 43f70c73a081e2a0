//! Image generation provider abstraction.
//!
//! The worker only knows the [`ImageProvider`] contract: given a source image, a prompt and
//! provider parameters, return an ordered list of result URLs or fail. The error text of a
//! failure is recorded verbatim on the job.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProviderConfig;

pub mod dummy;
pub mod predictions;

/// Create an image provider from configuration
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn ImageProvider>> {
    match config {
        ProviderConfig::Predictions(predictions) => Ok(Arc::new(predictions::PredictionsProvider::new(predictions.clone())?)),
        ProviderConfig::Dummy(dummy) => Ok(Arc::new(dummy::DummyProvider::from(dummy.clone()))),
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider refused the request (quota, billing, validation...)
    #[error("provider API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// The prediction ran and reported failure
    #[error("{0}")]
    Failed(String),

    #[error("prediction did not finish within {0:?}")]
    Timeout(Duration),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Everything a provider needs to run one job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    /// `owner/name:version` or `owner/name`
    pub model: String,
    pub image_url: String,
    pub prompt: String,
    /// Extra provider input, a JSON object merged next to `image` and `prompt`
    pub params: serde_json::Value,
}

#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Run a generation and return the result URLs in provider order
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<String>>;
}
