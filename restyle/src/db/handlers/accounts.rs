use crate::db::{errors::Result, models::accounts::AccountDBResponse};
use sqlx::PgConnection;

const ACCOUNT_COLUMNS: &str = "id, credits, free_used, created_at, updated_at";

pub struct Accounts<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Accounts<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Create the account if it does not exist yet, returning the current row either way
    pub async fn upsert(&mut self, id: &str) -> Result<AccountDBResponse> {
        // The no-op update makes RETURNING yield the existing row on conflict
        let account = sqlx::query_as::<_, AccountDBResponse>(&format!(
            r#"
            INSERT INTO accounts (id) VALUES ($1)
            ON CONFLICT (id) DO UPDATE SET id = EXCLUDED.id
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(account)
    }

    pub async fn get(&mut self, id: &str) -> Result<Option<AccountDBResponse>> {
        let account = sqlx::query_as::<_, AccountDBResponse>(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(account)
    }

    /// Add `delta` to the paid balance. Returns `None` if the account is missing or the result
    /// would go negative; the guard is part of the UPDATE so concurrent debits cannot overdraw.
    pub async fn adjust_credits(&mut self, id: &str, delta: i64) -> Result<Option<AccountDBResponse>> {
        let account = sqlx::query_as::<_, AccountDBResponse>(&format!(
            r#"
            UPDATE accounts
            SET credits = credits + $2, updated_at = NOW()
            WHERE id = $1 AND credits + $2 >= 0
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(delta)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(account)
    }

    /// Add `delta` to the free-quota counter, flooring at zero. With a `ceiling`, returns `None`
    /// instead of going above it.
    pub async fn adjust_free_used(&mut self, id: &str, delta: i64, ceiling: Option<i64>) -> Result<Option<AccountDBResponse>> {
        let account = sqlx::query_as::<_, AccountDBResponse>(&format!(
            r#"
            UPDATE accounts
            SET free_used = GREATEST(free_used + $2, 0), updated_at = NOW()
            WHERE id = $1 AND ($3::BIGINT IS NULL OR free_used + $2 <= $3)
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(delta)
        .bind(ceiling)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(account)
    }
}
