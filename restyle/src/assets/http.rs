//! Signed upload API (Cloudinary-compatible).
//!
//! Uploads are signed with SHA-256 over the sorted `key=value` parameters followed by the API
//! secret. The store first asks the upload API to ingest the remote URL directly; if that
//! fails it fetches the image itself and uploads the bytes as a base64 data URI.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write;

use super::{AssetError, AssetPath, AssetStore, Result};
use crate::config::HttpAssetsConfig;

pub struct HttpAssetStore {
    config: HttpAssetsConfig,
    http_client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    secure_url: Option<String>,
}

impl HttpAssetStore {
    pub fn new(config: HttpAssetsConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, http_client })
    }

    /// Signed parameters for `path`, without `file`
    fn signed_params(&self, path: &AssetPath, timestamp: i64) -> BTreeMap<&'static str, String> {
        let mut params = BTreeMap::new();
        params.insert("folder", format!("{}/{}/{}", self.config.folder_prefix, path.account_id, path.job_id));
        params.insert("public_id", format!("v{}", path.index));
        params.insert("overwrite", "true".to_string());
        params.insert("timestamp", timestamp.to_string());

        let signature = sign_params(&params, &self.config.api_secret);
        params.insert("signature", signature);
        params.insert("signature_algorithm", "sha256".to_string());
        params.insert("api_key", self.config.api_key.clone());
        params
    }

    async fn upload(&self, file: &str, path: &AssetPath) -> Result<String> {
        let mut body = self.signed_params(path, Utc::now().timestamp());
        body.insert("file", file.to_string());

        let response = self.http_client.post(self.config.upload_url.clone()).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AssetError::Upload {
                status: status.as_u16(),
                message,
            });
        }

        let uploaded: UploadResponse = response.json().await?;
        uploaded
            .secure_url
            .ok_or_else(|| AssetError::InvalidResponse("missing secure_url".to_string()))
    }

    /// Download `source` and encode it as a data URI
    async fn fetch_as_data_uri(&self, source: &str) -> Result<String> {
        let response = self.http_client.get(source).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AssetError::Fetch(format!("HTTP {status} from {source}")));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/png")
            .to_string();
        let bytes = response.bytes().await?;
        Ok(format!("data:{content_type};base64,{}", BASE64_STANDARD.encode(&bytes)))
    }
}

/// Hex SHA-256 over `k=v&k=v...` (keys sorted) followed by the secret
pub fn sign_params(params: &BTreeMap<&'static str, String>, secret: &str) -> String {
    let to_sign = params.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&");

    let mut hasher = Sha256::new();
    hasher.update(to_sign.as_bytes());
    hasher.update(secret.as_bytes());

    hasher.finalize().iter().fold(String::with_capacity(64), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[async_trait]
impl AssetStore for HttpAssetStore {
    #[tracing::instrument(skip_all, fields(path = %path))]
    async fn persist(&self, source: &str, path: &AssetPath) -> Result<String> {
        match self.upload(source, path).await {
            Ok(url) => Ok(url),
            Err(e) => {
                tracing::warn!(error = %e, "Remote ingestion failed, falling back to fetch-then-upload");
                let data_uri = self.fetch_as_data_uri(source).await?;
                self.upload(&data_uri, path).await
            }
        }
    }
}
