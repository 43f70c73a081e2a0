use crate::{
    db::{
        errors::Result,
        models::ledger::{LedgerEntryCreateDBRequest, LedgerEntryDBResponse, LedgerReason},
    },
    types::JobId,
};
use sqlx::PgConnection;

const LEDGER_COLUMNS: &str = "id, account_id, job_id, delta, reason, source_id, description, created_at";

pub struct Ledger<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Ledger<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Append an entry. Per-job and per-source uniqueness is enforced by partial unique indexes,
    /// so a duplicate surfaces as [`crate::db::errors::DbError::UniqueViolation`].
    pub async fn insert(&mut self, request: &LedgerEntryCreateDBRequest) -> Result<LedgerEntryDBResponse> {
        let entry = sqlx::query_as::<_, LedgerEntryDBResponse>(&format!(
            r#"
            INSERT INTO credit_ledger (account_id, job_id, delta, reason, source_id, description)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {LEDGER_COLUMNS}
            "#
        ))
        .bind(&request.account_id)
        .bind(request.job_id)
        .bind(request.delta)
        .bind(request.reason)
        .bind(&request.source_id)
        .bind(&request.description)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(entry)
    }

    /// The first entry for a job with one of the given reasons
    pub async fn find_for_job(&mut self, account_id: &str, job_id: JobId, reasons: &[LedgerReason]) -> Result<Option<LedgerEntryDBResponse>> {
        let reasons: Vec<String> = reasons.iter().map(|r| r.as_str().to_string()).collect();

        let entry = sqlx::query_as::<_, LedgerEntryDBResponse>(&format!(
            r#"
            SELECT {LEDGER_COLUMNS} FROM credit_ledger
            WHERE account_id = $1 AND job_id = $2 AND reason = ANY($3)
            ORDER BY id ASC
            LIMIT 1
            "#
        ))
        .bind(account_id)
        .bind(job_id)
        .bind(reasons)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(entry)
    }

    pub async fn find_by_source_id(&mut self, source_id: &str) -> Result<Option<LedgerEntryDBResponse>> {
        let entry = sqlx::query_as::<_, LedgerEntryDBResponse>(&format!("SELECT {LEDGER_COLUMNS} FROM credit_ledger WHERE source_id = $1"))
            .bind(source_id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(entry)
    }

    /// List an account's entries newest first
    pub async fn list_for_account(&mut self, account_id: &str, skip: i64, limit: i64) -> Result<Vec<LedgerEntryDBResponse>> {
        let entries = sqlx::query_as::<_, LedgerEntryDBResponse>(&format!(
            r#"
            SELECT {LEDGER_COLUMNS} FROM credit_ledger
            WHERE account_id = $1
            ORDER BY created_at DESC, id DESC
            OFFSET $2 LIMIT $3
            "#
        ))
        .bind(account_id)
        .bind(skip)
        .bind(limit)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(entries)
    }

    /// Sum of deltas per reason for an account
    pub async fn totals_by_reason(&mut self, account_id: &str) -> Result<Vec<(LedgerReason, i64)>> {
        let totals = sqlx::query_as::<_, (LedgerReason, i64)>(
            r#"
            SELECT reason, COALESCE(SUM(delta), 0)::BIGINT
            FROM credit_ledger
            WHERE account_id = $1
            GROUP BY reason
            "#,
        )
        .bind(account_id)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(totals)
    }
}
