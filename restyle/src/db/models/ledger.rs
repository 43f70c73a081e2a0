//! Database models for the append-only credit ledger.

use crate::types::{AccountId, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use utoipa::ToSchema;

/// Partial unique index allowing one charge entry per job
pub const ONE_CHARGE_PER_JOB: &str = "credit_ledger_one_charge_per_job";
/// Partial unique index allowing one refund entry per job
pub const ONE_REFUND_PER_JOB: &str = "credit_ledger_one_refund_per_job";
/// Unique index on grant source ids
pub const SOURCE_ID_UNIQUE: &str = "credit_ledger_source_id_unique";

/// Ledger reason stored as TEXT in database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    /// Paid credits debited for a job
    JobCharge,
    /// Free quota consumed by a job
    FreeQuotaUsed,
    /// Compensates a [`LedgerReason::JobCharge`]
    JobRefundFailed,
    /// Compensates a [`LedgerReason::FreeQuotaUsed`]
    FreeQuotaRefundFailed,
    /// Paid credits added from outside the job pipeline
    CreditGrant,
}

impl LedgerReason {
    pub const CHARGES: [LedgerReason; 2] = [LedgerReason::JobCharge, LedgerReason::FreeQuotaUsed];
    pub const REFUNDS: [LedgerReason; 2] = [LedgerReason::JobRefundFailed, LedgerReason::FreeQuotaRefundFailed];

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerReason::JobCharge => "job_charge",
            LedgerReason::FreeQuotaUsed => "free_quota_used",
            LedgerReason::JobRefundFailed => "job_refund_failed",
            LedgerReason::FreeQuotaRefundFailed => "free_quota_refund_failed",
            LedgerReason::CreditGrant => "credit_grant",
        }
    }

    pub fn is_charge(&self) -> bool {
        Self::CHARGES.contains(self)
    }

    pub fn is_refund(&self) -> bool {
        Self::REFUNDS.contains(self)
    }

    /// The compensating reason for a charge reason
    pub fn refund_reason(&self) -> Option<LedgerReason> {
        match self {
            LedgerReason::JobCharge => Some(LedgerReason::JobRefundFailed),
            LedgerReason::FreeQuotaUsed => Some(LedgerReason::FreeQuotaRefundFailed),
            _ => None,
        }
    }
}

impl fmt::Display for LedgerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Database request for appending a ledger entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntryCreateDBRequest {
    pub account_id: AccountId,
    pub job_id: Option<JobId>,
    pub delta: i64,
    pub reason: LedgerReason,
    pub source_id: Option<String>,
    pub description: Option<String>,
}

impl LedgerEntryCreateDBRequest {
    /// A debit of `cost` against a job. `reason` must be a charge reason.
    pub fn charge(account_id: AccountId, job_id: JobId, reason: LedgerReason, cost: i64) -> Self {
        Self {
            account_id,
            job_id: Some(job_id),
            delta: -cost,
            reason,
            source_id: None,
            description: None,
        }
    }

    /// A credit of `amount` compensating a job's charge. `reason` must be a refund reason.
    pub fn refund(account_id: AccountId, job_id: JobId, reason: LedgerReason, amount: i64) -> Self {
        Self {
            account_id,
            job_id: Some(job_id),
            delta: amount,
            reason,
            source_id: None,
            description: None,
        }
    }

    pub fn grant(account_id: AccountId, amount: i64, source_id: String, description: Option<String>) -> Self {
        Self {
            account_id,
            job_id: None,
            delta: amount,
            reason: LedgerReason::CreditGrant,
            source_id: Some(source_id),
            description,
        }
    }
}

/// Database response for a ledger entry
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct LedgerEntryDBResponse {
    pub id: i64,
    pub account_id: AccountId,
    pub job_id: Option<JobId>,
    pub delta: i64,
    pub reason: LedgerReason,
    pub source_id: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}
