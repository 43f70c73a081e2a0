//! OpenAPI documentation, served at `/api/openapi.json`.
//!
//! The user-facing API lives under `/api`, credit grants under `/admin/api/v1`, and the worker
//! entry point at the root.

use utoipa::{
    Modify, OpenApi,
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
};

use crate::{
    api::{
        self,
        models::{
            accounts::{AccountResponse, CreditGrantRequest, CreditGrantResponse, LedgerEntryResponse},
            jobs::{JobCreate, JobCreated, JobListResponse, JobOutputResponse, JobResponse, PresetsResponse},
            worker::RunJobResponse,
        },
    },
    channel::RunJobMessage,
    db::models::{
        jobs::{Intensity, JobStatus},
        ledger::LedgerReason,
    },
    errors::ErrorBody,
    jobs::prompt::{IntensityPreset, RoomTypePreset, StylePreset},
    metering::Reconciliation,
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.security_schemes.insert(
                "X-Restyle-Account".to_string(),
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "x-restyle-account",
                    "Account id forwarded by the authenticating proxy. Requests that did not pass through the proxy \
                     must never reach this service.",
                ))),
            );
            components.security_schemes.insert(
                "WebhookSignature".to_string(),
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "webhook-signature",
                    "Standard Webhooks signature over `webhook-id`, `webhook-timestamp` and the raw body.",
                ))),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::jobs::create_job,
        api::handlers::jobs::get_job,
        api::handlers::jobs::list_jobs,
        api::handlers::accounts::get_account,
        api::handlers::accounts::list_ledger,
        api::handlers::accounts::get_reconciliation,
        api::handlers::presets::list_presets,
    ),
    components(schemas(
        JobCreate,
        JobCreated,
        JobResponse,
        JobOutputResponse,
        JobListResponse,
        JobStatus,
        Intensity,
        PresetsResponse,
        RoomTypePreset,
        StylePreset,
        IntensityPreset,
        AccountResponse,
        LedgerEntryResponse,
        LedgerReason,
        Reconciliation,
        ErrorBody,
    ))
)]
struct PublicApi;

#[derive(OpenApi)]
#[openapi(
    paths(api::handlers::accounts::grant_credits),
    components(schemas(CreditGrantRequest, CreditGrantResponse))
)]
struct AdminApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Restyle",
        description = "Paid asynchronous interior restyling jobs with an append-only credit ledger."
    ),
    modifiers(&SecurityAddon),
    nest(
        (path = "/api", api = PublicApi),
        (path = "/admin/api/v1", api = AdminApi),
    ),
    paths(api::handlers::worker::run_job),
    components(schemas(RunJobMessage, RunJobResponse, ErrorBody)),
    tags(
        (name = "jobs", description = "Submit restyling jobs and follow their outcome"),
        (name = "account", description = "Balance and credit ledger"),
        (name = "presets", description = "UI presets"),
        (name = "admin", description = "Credit administration"),
        (name = "worker", description = "Execution channel callback"),
    )
)]
pub struct ApiDoc;
