//! Asset persistence: turning a provider's (often short-lived) result URL into a durable one.

use async_trait::async_trait;
use std::sync::Arc;

use crate::{
    config::AssetsConfig,
    types::{JobId, abbrev_uuid},
};

pub mod http;
pub mod passthrough;

pub fn create_asset_store(config: &AssetsConfig) -> Result<Arc<dyn AssetStore>> {
    match config {
        AssetsConfig::Http(http) => Ok(Arc::new(http::HttpAssetStore::new(http.clone())?)),
        AssetsConfig::Passthrough => Ok(Arc::new(passthrough::PassthroughAssetStore)),
    }
}

pub type Result<T> = std::result::Result<T, AssetError>;

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("upload rejected (HTTP {status}): {message}")]
    Upload { status: u16, message: String },

    #[error("could not fetch source image: {0}")]
    Fetch(String),

    #[error("invalid upload response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Where an output lands: one slot per (account, job, index)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPath {
    pub account_id: String,
    pub job_id: JobId,
    pub index: usize,
}

impl std::fmt::Display for AssetPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/v{}", self.account_id, abbrev_uuid(&self.job_id), self.index)
    }
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Store `source` at `path` and return its durable public URL. Persisting the same path
    /// twice overwrites.
    async fn persist(&self, source: &str, path: &AssetPath) -> Result<String>;
}
