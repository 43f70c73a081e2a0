//! API layer for HTTP request handling and data models.
//!
//! - **[`handlers`]**: Axum route handlers for all API endpoints
//! - **[`models`]**: Request/response data structures for API communication
//!
//! # API Structure
//!
//! - **Jobs** (`/api/jobs/*`): Submission, status and history
//! - **Account** (`/api/account/*`): Balance, ledger and reconciliation
//! - **Presets** (`/api/presets`): UI presets
//! - **Admin** (`/admin/api/v1/accounts/{id}/credits`): Credit grants
//! - **Worker** (`/internal/worker/run-job`): Signed deliveries from the execution channel
//!
//! # OpenAPI Documentation
//!
//! The OpenAPI document is served at `/api/openapi.json`.

pub mod handlers;
pub mod models;
