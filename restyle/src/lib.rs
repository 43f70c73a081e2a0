//! # restyle: paid asynchronous interior restyling jobs
//!
//! `restyle` accepts a photo of a room plus a room type, a style and an intensity, charges the
//! caller's credits, and hands the job to an at-least-once execution channel. A worker entry
//! point later runs the job against an image generation provider, persists the outputs, and
//! records success or failure. A job that never produces outputs has its charge reversed.
//!
//! ## Architecture
//!
//! The application is built on [Axum](https://github.com/tokio-rs/axum) for the HTTP layer and
//! uses PostgreSQL for persistence (or an in-process store for development).
//!
//! ### Request Flow
//!
//! ```text
//! POST /api/jobs ──▶ Dispatcher
//!                      ├─ eligibility (free quota first, then paid credits)
//!                      ├─ create job (queued) + charge ledger entry
//!                      └─ ExecutionChannel::enqueue ── fails ──▶ job failed, charge refunded
//!
//! channel ──▶ POST /internal/worker/run-job (signed) ──▶ WorkerReconciler
//!                      ├─ CAS queued → running (duplicates stop here)
//!                      ├─ provider → assets → outputs
//!                      └─ CAS running → succeeded | failed (+ idempotent refund)
//! ```
//!
//! ### Core Components
//!
//! - **[`api`]**: HTTP handlers and request/response models
//! - **[`auth`]**: Account identity from the trusted proxy header
//! - **[`metering`]**: Eligibility, charge, refund, grants and ledger reconciliation
//! - **[`jobs`]**: Submission and worker-side execution
//! - **[`channel`]**, **[`providers`]**, **[`assets`]**: The three external collaborators
//! - **[`store`]** / **[`db`]**: Persistence behind traits, PostgreSQL or in-memory
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use restyle::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = restyle::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     restyle::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod api;
pub mod assets;
pub mod auth;
pub mod channel;
pub mod config;
pub mod db;
pub mod errors;
pub mod jobs;
pub mod metering;
mod openapi;
pub mod providers;
pub mod store;
pub mod telemetry;
pub mod types;

#[cfg(test)]
pub mod test_utils;

use axum::{
    Json, Router,
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info, warn};
use utoipa::OpenApi;

pub use config::Config;

use crate::{
    assets::AssetStore,
    channel::ExecutionChannel,
    config::{DatabaseConfig, PoolSettings, WORKER_RUN_JOB_PATH},
    jobs::{Dispatcher, WorkerReconciler},
    metering::{CreditMeter, Pricing},
    openapi::ApiDoc,
    providers::ImageProvider,
    store::{MemoryStore, PgStore, SharedStore},
};

/// Application state shared across all request handlers.
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .store(store)
///     .meter(meter)
///     .dispatcher(dispatcher)
///     .reconciler(reconciler)
///     .config(config)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub store: SharedStore,
    pub meter: CreditMeter,
    pub dispatcher: Dispatcher,
    pub reconciler: WorkerReconciler,
    pub config: Config,
}

impl AppState {
    /// Wire the services over the given store and collaborators
    pub fn assemble(
        config: Config,
        store: SharedStore,
        channel: Arc<dyn ExecutionChannel>,
        provider: Arc<dyn ImageProvider>,
        assets: Arc<dyn AssetStore>,
    ) -> Self {
        let meter = CreditMeter::new(store.clone(), Pricing::from(&config.credits));
        let dispatcher = Dispatcher::new(store.clone(), meter.clone(), channel, config.generation.clone());
        let reconciler = WorkerReconciler::new(store.clone(), meter.clone(), provider, assets);

        AppState::builder()
            .store(store)
            .meter(meter)
            .dispatcher(dispatcher)
            .reconciler(reconciler)
            .config(config)
            .build()
    }
}

/// Get the restyle database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

async fn connect_pool(url: &str, settings: &PoolSettings) -> anyhow::Result<PgPool> {
    let non_zero = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
        .idle_timeout(non_zero(settings.idle_timeout_secs))
        .max_lifetime(non_zero(settings.max_lifetime_secs))
        .connect(url)
        .await?;

    Ok(pool)
}

/// Open the configured store, running migrations for PostgreSQL
async fn setup_store(config: &Config) -> anyhow::Result<(SharedStore, Option<PgPool>)> {
    match &config.database {
        DatabaseConfig::Memory => {
            warn!("Using in-memory store: all jobs and balances are lost on shutdown");
            Ok((Arc::new(MemoryStore::new()), None))
        }
        DatabaseConfig::External { url, pool } => {
            info!("Using external database");
            let pool = connect_pool(url, pool).await?;
            migrator().run(&pool).await?;
            Ok((Arc::new(PgStore::new(pool.clone())), Some(pool)))
        }
    }
}

/// Build the HTTP router.
///
/// - `/api/*`: user-facing API (proxy-authenticated)
/// - `/admin/api/v1/*`: admin API
/// - `/internal/worker/run-job`: signed worker entry point
/// - `/internal/metrics`: Prometheus metrics, when enabled
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    let api_routes = Router::new()
        .route(
            "/jobs",
            post(api::handlers::jobs::create_job).get(api::handlers::jobs::list_jobs),
        )
        .route("/jobs/{job_id}", get(api::handlers::jobs::get_job))
        .route("/account", get(api::handlers::accounts::get_account))
        .route("/account/ledger", get(api::handlers::accounts::list_ledger))
        .route("/account/reconciliation", get(api::handlers::accounts::get_reconciliation))
        .route("/presets", get(api::handlers::presets::list_presets))
        .route("/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .with_state(state.clone());

    let admin_routes = Router::new()
        .route(
            "/accounts/{account_id}/credits",
            post(api::handlers::accounts::grant_credits),
        )
        .with_state(state.clone());

    let mut router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route(WORKER_RUN_JOB_PATH, post(api::handlers::worker::run_job))
        .with_state(state.clone())
        .nest("/api", api_routes)
        .nest("/admin/api/v1", admin_routes);

    if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/internal/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// Background tasks running alongside the HTTP server (the local channel's sender).
///
/// Dropping this cancels the shutdown token through `drop_guard`.
pub struct BackgroundServices {
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<tokio_util::sync::DropGuard>,
}

impl BackgroundServices {
    fn new(shutdown_token: CancellationToken) -> Self {
        Self {
            drop_guard: Some(shutdown_token.clone().drop_guard()),
            shutdown_token,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Signal background tasks to stop. Buffered deliveries are dropped.
    pub fn shutdown(self) {
        self.shutdown_token.cancel();
    }
}

/// The assembled service: router, state and background tasks.
///
/// 1. **Create**: [`Application::new`] opens the store, runs migrations, and builds the
///    collaborators from configuration
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and handles requests
/// 3. **Shutdown**: when the shutdown future resolves, stops background tasks and closes the pool
pub struct Application {
    router: Router,
    config: Config,
    pool: Option<PgPool>,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting restyle with configuration: {:#?}", config);

        let (store, pool) = setup_store(&config).await?;

        let bg_services = BackgroundServices::new(CancellationToken::new());
        let channel = channel::create_channel(&config, bg_services.shutdown_token())?;
        let provider = providers::create_provider(&config.provider)?;
        let assets = assets::create_asset_store(&config.assets)?;

        let app_state = AppState::assemble(config.clone(), store, channel, provider, assets);
        let router = build_router(&app_state)?;

        Ok(Self {
            router,
            config,
            pool,
            bg_services,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "restyle listening on http://{}, worker deliveries go to {}",
            bind_addr,
            self.config.worker_endpoint()
        );

        axum::serve(listener, self.router).with_graceful_shutdown(shutdown).await?;

        self.bg_services.shutdown();

        if let Some(pool) = self.pool {
            info!("Closing database connections...");
            pool.close().await;
        }

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        api::models::jobs::JobCreated,
        db::models::jobs::JobStatus,
        store::JobStore,
        test_utils::{ACCOUNT_HEADER, create_test_app, create_test_config, signed_headers, submit_body},
    };
    use serde_json::{Value, json};

    #[tokio::test]
    async fn test_healthz() {
        let app = create_test_app();
        let response = app.server.get("/healthz").await;
        response.assert_status_ok();
        response.assert_text("OK");
    }

    #[tokio::test]
    async fn test_openapi_document_is_served() {
        let app = create_test_app();
        let response = app.server.get("/api/openapi.json").await;
        response.assert_status_ok();
        let doc: Value = response.json();
        assert!(doc["paths"]["/api/jobs"].is_object());
    }

    #[tokio::test]
    async fn test_metrics_endpoint_absent_when_disabled() {
        let app = create_test_app();
        app.server.get("/internal/metrics").await.assert_status_not_found();
    }

    #[test_log::test(tokio::test)]
    async fn test_application_with_memory_store() {
        let config = create_test_config();
        let app = Application::new(config).await.expect("Failed to create application");
        let (server, bg_services) = app.into_test_server();

        let response = server.get("/api/account").add_header(ACCOUNT_HEADER, "alice").await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["free_remaining"], 5);

        bg_services.shutdown();
    }

    /// Submit, deliver, and read the result back through the HTTP surface
    #[test_log::test(tokio::test)]
    async fn test_job_end_to_end() {
        let app = create_test_app();

        let created: JobCreated = app
            .server
            .post("/api/jobs")
            .add_header(ACCOUNT_HEADER, "alice")
            .json(&submit_body())
            .await
            .json();
        assert_eq!(app.channel.enqueued(), vec![created.job_id]);

        let body = json!({ "job_id": created.job_id }).to_string();
        let mut delivery = app.server.post(WORKER_RUN_JOB_PATH).bytes(body.clone().into());
        for (name, value) in signed_headers(&body) {
            delivery = delivery.add_header(name, value);
        }
        delivery.await.assert_status_ok();

        let job: Value = app
            .server
            .get(&format!("/api/jobs/{}", created.job_id))
            .add_header(ACCOUNT_HEADER, "alice")
            .await
            .json();
        assert_eq!(job["status"], "succeeded");
        assert_eq!(job["outputs"].as_array().unwrap().len(), 4);
        assert_eq!(job["outputs"][0]["index"], 0);

        let stored = app.store.get_job(created.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert!(stored.started_at.is_some() && stored.finished_at.is_some());
    }
}
