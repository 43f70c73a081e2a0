//! API request/response models for balances, the ledger and credit grants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    db::models::{accounts::AccountDBResponse, ledger::LedgerEntryDBResponse, ledger::LedgerReason},
    metering::Pricing,
    types::JobId,
};

/// Balance as the UI shows it
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AccountResponse {
    pub id: String,
    pub credits: i64,
    pub free_used: i64,
    pub free_quota: i64,
    pub free_remaining: i64,
    pub cost_per_job: i64,
}

impl AccountResponse {
    pub fn new(account: AccountDBResponse, pricing: &Pricing) -> Self {
        Self {
            free_remaining: (pricing.free_quota - account.free_used).max(0),
            free_quota: pricing.free_quota,
            cost_per_job: pricing.cost_per_job(),
            id: account.id,
            credits: account.credits,
            free_used: account.free_used,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LedgerEntryResponse {
    pub id: i64,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub job_id: Option<JobId>,
    pub delta: i64,
    pub reason: LedgerReason,
    pub source_id: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<LedgerEntryDBResponse> for LedgerEntryResponse {
    fn from(entry: LedgerEntryDBResponse) -> Self {
        Self {
            id: entry.id,
            job_id: entry.job_id,
            delta: entry.delta,
            reason: entry.reason,
            source_id: entry.source_id,
            description: entry.description,
            created_at: entry.created_at,
        }
    }
}

/// Add paid credits to an account
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreditGrantRequest {
    /// Positive number of credits
    pub amount: i64,
    /// Idempotency key, e.g. a payment session id. A repeated key is not applied twice.
    pub source_id: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreditGrantResponse {
    pub account_id: String,
    pub entry: LedgerEntryResponse,
    /// True if `source_id` had already been applied and nothing changed
    pub duplicate: bool,
}
