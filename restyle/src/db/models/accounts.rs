//! Database models for accounts.

use crate::types::AccountId;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Database response for an account row.
///
/// `credits` and `free_used` are a cached projection of the ledger, see
/// [`crate::metering::CreditMeter::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct AccountDBResponse {
    pub id: AccountId,
    pub credits: i64,
    pub free_used: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
