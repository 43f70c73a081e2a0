//! Test utilities: in-memory collaborators and a fully wired test server.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum_test::TestServer;
use chrono::Utc;
use serde_json::{Value, json};

use crate::{
    AppState,
    assets::{self, AssetError, AssetPath, AssetStore},
    channel::{ChannelError, ExecutionChannel, signing},
    config::{Config, DatabaseConfig, WorkerConfig},
    providers::{self, GenerationRequest, ImageProvider, ProviderError},
    store::MemoryStore,
    types::JobId,
};

/// A valid `whsec_` secret shared by the test config and signed deliveries
pub const TEST_SECRET: &str = "whsec_c2VjcmV0LWtleS1mb3ItdGVzdGluZw==";

pub const ACCOUNT_HEADER: &str = "x-restyle-account";

pub fn create_test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        public_url: "http://localhost:3001".to_string(),
        database: DatabaseConfig::Memory,
        worker: WorkerConfig {
            signing_secret: Some(TEST_SECRET.to_string()),
            ..Default::default()
        },
        enable_metrics: false,
        enable_otel_export: false,
        ..Default::default()
    }
}

/// State over a fresh memory store and inert collaborators, for extractor tests
pub fn create_test_state(config: Config) -> AppState {
    AppState::assemble(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(RecordingChannel::default()),
        Arc::new(ScriptedProvider::succeeding(vec![])),
        Arc::new(RecordingAssetStore::default()),
    )
}

/// Channel that records what was enqueued instead of delivering it
#[derive(Default)]
pub struct RecordingChannel {
    fail: bool,
    enqueued: Mutex<Vec<JobId>>,
}

impl RecordingChannel {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn enqueued(&self) -> Vec<JobId> {
        self.enqueued.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionChannel for RecordingChannel {
    async fn enqueue(&self, job_id: JobId) -> Result<(), ChannelError> {
        if self.fail {
            return Err(ChannelError::Rejected {
                status: 503,
                body: "queue unavailable".to_string(),
            });
        }
        self.enqueued.lock().unwrap().push(job_id);
        Ok(())
    }
}

/// Provider returning a fixed result and counting calls
pub struct ScriptedProvider {
    result: Result<Vec<String>, String>,
    delay: Duration,
    calls: AtomicUsize,
    last_request: Mutex<Option<GenerationRequest>>,
}

impl ScriptedProvider {
    pub fn succeeding(urls: Vec<String>) -> Self {
        Self {
            result: Ok(urls),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Sleep this long before answering, like a real prediction
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageProvider for ScriptedProvider {
    async fn generate(&self, request: &GenerationRequest) -> providers::Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.result.clone().map_err(ProviderError::Failed)
    }
}

/// Asset store that "persists" to a deterministic URL per path
#[derive(Default)]
pub struct RecordingAssetStore {
    fail: bool,
    sources: Mutex<Vec<(String, usize)>>,
}

impl RecordingAssetStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// `(source url, output index)` for every persisted output
    pub fn sources(&self) -> Vec<(String, usize)> {
        self.sources.lock().unwrap().clone()
    }

    pub fn url_for(account_id: &str, job_id: JobId, index: usize) -> String {
        let path = AssetPath {
            account_id: account_id.to_string(),
            job_id,
            index,
        };
        format!("https://assets.test/{path}")
    }
}

#[async_trait]
impl AssetStore for RecordingAssetStore {
    async fn persist(&self, source: &str, path: &AssetPath) -> assets::Result<String> {
        if self.fail {
            return Err(AssetError::Upload {
                status: 500,
                message: "storage offline".to_string(),
            });
        }
        self.sources.lock().unwrap().push((source.to_string(), path.index));
        Ok(Self::url_for(&path.account_id, path.job_id, path.index))
    }
}

pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub channel: Arc<RecordingChannel>,
    pub provider: Arc<ScriptedProvider>,
    pub assets: Arc<RecordingAssetStore>,
}

pub fn create_test_app() -> TestApp {
    build_test_app(create_test_config(), RecordingChannel::default(), ScriptedProvider::succeeding(provider_urls(4)))
}

pub fn create_test_app_with_failing_channel() -> TestApp {
    build_test_app(create_test_config(), RecordingChannel::failing(), ScriptedProvider::succeeding(provider_urls(4)))
}

pub fn create_test_app_with_provider(provider: ScriptedProvider) -> TestApp {
    build_test_app(create_test_config(), RecordingChannel::default(), provider)
}

pub fn build_test_app(config: Config, channel: RecordingChannel, provider: ScriptedProvider) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let channel = Arc::new(channel);
    let provider = Arc::new(provider);
    let assets = Arc::new(RecordingAssetStore::default());

    let state = AppState::assemble(config, store.clone(), channel.clone(), provider.clone(), assets.clone());
    let router = crate::build_router(&state).expect("Failed to build router");
    let server = TestServer::new(router).expect("Failed to create test server");

    TestApp {
        server,
        state,
        store,
        channel,
        provider,
        assets,
    }
}

pub fn provider_urls(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("https://provider/out-{i}.png")).collect()
}

/// A valid `POST /api/jobs` body
pub fn submit_body() -> Value {
    json!({
        "input_image_url": "https://img.example.com/room.jpg",
        "room_type": "Living Room",
        "style": "Scandinavian",
        "intensity": "medium",
    })
}

/// Standard Webhooks headers signing `body` with [`TEST_SECRET`] at the current time
pub fn signed_headers(body: &str) -> Vec<(&'static str, String)> {
    signed_headers_at(body, Utc::now().timestamp())
}

pub fn signed_headers_at(body: &str, timestamp: i64) -> Vec<(&'static str, String)> {
    let msg_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
    let signature = signing::sign_payload(&msg_id, timestamp, body.as_bytes(), TEST_SECRET).expect("test secret is valid");
    vec![
        (signing::HEADER_ID, msg_id),
        (signing::HEADER_TIMESTAMP, timestamp.to_string()),
        (signing::HEADER_SIGNATURE, signature),
    ]
}
