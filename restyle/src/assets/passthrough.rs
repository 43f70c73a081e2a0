//! Keeps provider URLs as they are. For development only: provider URLs typically expire.

use async_trait::async_trait;

use super::{AssetPath, AssetStore, Result};

pub struct PassthroughAssetStore;

#[async_trait]
impl AssetStore for PassthroughAssetStore {
    async fn persist(&self, source: &str, path: &AssetPath) -> Result<String> {
        tracing::debug!(%path, "Passthrough asset store keeping provider URL");
        Ok(source.to_string())
    }
}
