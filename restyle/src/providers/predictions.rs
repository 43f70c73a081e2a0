//! Hosted predictions API client.
//!
//! ```text
//! POST /v1/predictions                          {version, input}   (model pinned to a version)
//! POST /v1/models/{owner}/{name}/predictions    {input}            (latest version)
//!   └─ Prefer: wait  → may already be terminal
//! GET  /v1/predictions/{id}  every poll_interval until succeeded | failed | canceled
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use url::Url;

use crate::{
    config::PredictionsConfig,
    providers::{GenerationRequest, ImageProvider, ProviderError, Result},
};

pub struct PredictionsProvider {
    config: PredictionsConfig,
    http_client: reqwest::Client,
}

impl PredictionsProvider {
    pub fn new(config: PredictionsConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder().build()?;
        Ok(Self { config, http_client })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.config
            .base_url
            .join(path)
            .map_err(|e| ProviderError::InvalidResponse(format!("bad endpoint {path}: {e}")))
    }

    /// Endpoint and body for creating a prediction for `model`
    fn create_call(&self, model: &str, input: Value) -> Result<(Url, CreatePrediction)> {
        match model.split_once(':') {
            Some((_, version)) => Ok((
                self.endpoint("/v1/predictions")?,
                CreatePrediction {
                    version: Some(version.to_string()),
                    input,
                },
            )),
            None => {
                let (owner, name) = model
                    .split_once('/')
                    .ok_or_else(|| ProviderError::InvalidResponse(format!("model {model:?} is not owner/name")))?;
                Ok((
                    self.endpoint(&format!("/v1/models/{owner}/{name}/predictions"))?,
                    CreatePrediction { version: None, input },
                ))
            }
        }
    }

    async fn read_prediction(response: reqwest::Response) -> Result<Prediction> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: api_error_message(&body),
            });
        }
        Ok(response.json().await?)
    }
}

#[derive(Debug, Serialize)]
struct CreatePrediction {
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    input: Value,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: PredictionStatus,
    #[serde(default)]
    output: Value,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    Aborted,
}

/// Provider input: `image` and `prompt` next to the job's stored params
fn build_input(request: &GenerationRequest) -> Value {
    let mut input = serde_json::Map::new();
    input.insert("image".to_string(), Value::String(request.image_url.clone()));
    input.insert("prompt".to_string(), Value::String(request.prompt.clone()));
    if let Value::Object(params) = &request.params {
        for (key, value) in params {
            input.insert(key.clone(), value.clone());
        }
    }
    Value::Object(input)
}

/// Pull result URLs out of a prediction's `output`: a list, a single URL, or `{output: [...]}`
pub fn extract_outputs(output: &Value) -> Vec<String> {
    match output {
        Value::String(url) => vec![url.clone()],
        Value::Array(items) => items.iter().filter_map(|item| item.as_str().map(str::to_string)).collect(),
        Value::Object(map) => map.get("output").map(extract_outputs).unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// `detail` from a JSON error body, else the raw body
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

fn error_text(error: Option<Value>) -> String {
    match error {
        Some(Value::String(message)) => message,
        Some(Value::Null) | None => "prediction failed".to_string(),
        Some(other) => other.to_string(),
    }
}

#[async_trait]
impl ImageProvider for PredictionsProvider {
    #[tracing::instrument(skip_all, fields(model = %request.model))]
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<String>> {
        let started = Instant::now();
        let (url, body) = self.create_call(&request.model, build_input(request))?;

        let response = self
            .http_client
            .post(url)
            .bearer_auth(&self.config.api_token)
            .header("Prefer", "wait")
            .timeout(self.config.timeout)
            .json(&body)
            .send()
            .await?;
        let mut prediction = Self::read_prediction(response).await?;
        tracing::debug!(prediction_id = %prediction.id, status = ?prediction.status, "Prediction created");

        loop {
            match prediction.status {
                PredictionStatus::Succeeded => return Ok(extract_outputs(&prediction.output)),
                PredictionStatus::Failed => return Err(ProviderError::Failed(error_text(prediction.error))),
                PredictionStatus::Canceled | PredictionStatus::Aborted => {
                    return Err(ProviderError::Failed(format!("prediction {}", error_text(prediction.error))));
                }
                PredictionStatus::Starting | PredictionStatus::Processing => {}
            }

            if started.elapsed() >= self.config.timeout {
                return Err(ProviderError::Timeout(self.config.timeout));
            }
            tokio::time::sleep(self.config.poll_interval).await;

            let response = self
                .http_client
                .get(self.endpoint(&format!("/v1/predictions/{}", prediction.id))?)
                .bearer_auth(&self.config.api_token)
                .timeout(self.config.timeout)
                .send()
                .await?;
            prediction = Self::read_prediction(response).await?;
        }
    }
}
