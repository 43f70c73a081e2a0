//! Storage traits the services are written against.
//!
//! The services ([`crate::metering`], [`crate::jobs`]) only ever see a [`SharedStore`]. Two
//! implementations exist:
//!
//! - [`PgStore`]: pool-backed, delegating to the repositories in [`crate::db::handlers`]
//! - [`MemoryStore`]: in-process tables for development and tests
//!
//! Both enforce the same rules: conditional job transitions, one charge and one refund ledger
//! entry per job, unique grant source ids, non-negative balances and referential integrity.

pub mod memory;

use crate::{
    db::{
        errors::{DbError, Result},
        handlers::{Accounts, Jobs, Ledger},
        models::{
            accounts::AccountDBResponse,
            jobs::{JobCreateDBRequest, JobDBResponse, JobListFilter, JobOutputCreateDBRequest, JobOutputDBResponse, JobStatus, JobTransition},
            ledger::{LedgerEntryCreateDBRequest, LedgerEntryDBResponse, LedgerReason},
        },
    },
    types::JobId,
};
use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;

pub use memory::MemoryStore;

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Create the account if missing; returns the current row
    async fn upsert_account(&self, id: &str) -> Result<AccountDBResponse>;

    async fn get_account(&self, id: &str) -> Result<Option<AccountDBResponse>>;

    /// Apply `delta` to `credits`. `None` if the account is missing or the balance would go
    /// negative.
    async fn adjust_credits(&self, id: &str, delta: i64) -> Result<Option<AccountDBResponse>>;

    /// Apply `delta` to `free_used`, floored at zero. `None` if the account is missing or the
    /// result would exceed `ceiling`.
    async fn adjust_free_used(&self, id: &str, delta: i64, ceiling: Option<i64>) -> Result<Option<AccountDBResponse>>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, request: &JobCreateDBRequest) -> Result<JobDBResponse>;

    /// Job with outputs ordered by index
    async fn get_job(&self, id: JobId) -> Result<Option<JobDBResponse>>;

    /// Atomic compare-and-set on the job's status.
    ///
    /// Returns `Ok(false)` (and changes nothing) when the persisted status is not `from`, which
    /// is how a duplicate worker delivery loses the race. Returns
    /// [`DbError::InvalidTransition`] if the state machine has no `from -> target` edge at all.
    async fn transition(&self, id: JobId, from: JobStatus, change: &JobTransition) -> Result<bool>;

    async fn insert_outputs(&self, job_id: JobId, outputs: &[JobOutputCreateDBRequest]) -> Result<Vec<JobOutputDBResponse>>;

    async fn list_jobs(&self, filter: &JobListFilter) -> Result<Vec<JobDBResponse>>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append an entry. Duplicates on the per-job or per-source indexes fail with
    /// [`DbError::UniqueViolation`] naming the index.
    async fn insert_entry(&self, request: &LedgerEntryCreateDBRequest) -> Result<LedgerEntryDBResponse>;

    async fn find_job_entry(&self, account_id: &str, job_id: JobId, reasons: &[LedgerReason]) -> Result<Option<LedgerEntryDBResponse>>;

    async fn find_entry_by_source(&self, source_id: &str) -> Result<Option<LedgerEntryDBResponse>>;

    /// Newest first
    async fn list_entries(&self, account_id: &str, skip: i64, limit: i64) -> Result<Vec<LedgerEntryDBResponse>>;

    async fn ledger_totals(&self, account_id: &str) -> Result<Vec<(LedgerReason, i64)>>;
}

/// Everything the services need from persistence
pub trait Store: AccountStore + JobStore + LedgerStore {}

impl<T: AccountStore + JobStore + LedgerStore> Store for T {}

pub type SharedStore = Arc<dyn Store>;

/// [`Store`] over a PostgreSQL pool. Each call checks out its own connection.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn conn(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>> {
        self.pool.acquire().await.map_err(DbError::from)
    }
}

#[async_trait]
impl AccountStore for PgStore {
    async fn upsert_account(&self, id: &str) -> Result<AccountDBResponse> {
        let mut conn = self.conn().await?;
        Accounts::new(&mut conn).upsert(id).await
    }

    async fn get_account(&self, id: &str) -> Result<Option<AccountDBResponse>> {
        let mut conn = self.conn().await?;
        Accounts::new(&mut conn).get(id).await
    }

    async fn adjust_credits(&self, id: &str, delta: i64) -> Result<Option<AccountDBResponse>> {
        let mut conn = self.conn().await?;
        Accounts::new(&mut conn).adjust_credits(id, delta).await
    }

    async fn adjust_free_used(&self, id: &str, delta: i64, ceiling: Option<i64>) -> Result<Option<AccountDBResponse>> {
        let mut conn = self.conn().await?;
        Accounts::new(&mut conn).adjust_free_used(id, delta, ceiling).await
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn create_job(&self, request: &JobCreateDBRequest) -> Result<JobDBResponse> {
        let mut conn = self.conn().await?;
        Jobs::new(&mut conn).create(request).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobDBResponse>> {
        let mut conn = self.conn().await?;
        Jobs::new(&mut conn).get(id).await
    }

    async fn transition(&self, id: JobId, from: JobStatus, change: &JobTransition) -> Result<bool> {
        let mut conn = self.conn().await?;
        Jobs::new(&mut conn).transition(id, from, change).await
    }

    async fn insert_outputs(&self, job_id: JobId, outputs: &[JobOutputCreateDBRequest]) -> Result<Vec<JobOutputDBResponse>> {
        let mut conn = self.conn().await?;
        Jobs::new(&mut conn).insert_outputs(job_id, outputs).await
    }

    async fn list_jobs(&self, filter: &JobListFilter) -> Result<Vec<JobDBResponse>> {
        let mut conn = self.conn().await?;
        Jobs::new(&mut conn).list(filter).await
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn insert_entry(&self, request: &LedgerEntryCreateDBRequest) -> Result<LedgerEntryDBResponse> {
        let mut conn = self.conn().await?;
        Ledger::new(&mut conn).insert(request).await
    }

    async fn find_job_entry(&self, account_id: &str, job_id: JobId, reasons: &[LedgerReason]) -> Result<Option<LedgerEntryDBResponse>> {
        let mut conn = self.conn().await?;
        Ledger::new(&mut conn).find_for_job(account_id, job_id, reasons).await
    }

    async fn find_entry_by_source(&self, source_id: &str) -> Result<Option<LedgerEntryDBResponse>> {
        let mut conn = self.conn().await?;
        Ledger::new(&mut conn).find_by_source_id(source_id).await
    }

    async fn list_entries(&self, account_id: &str, skip: i64, limit: i64) -> Result<Vec<LedgerEntryDBResponse>> {
        let mut conn = self.conn().await?;
        Ledger::new(&mut conn).list_for_account(account_id, skip, limit).await
    }

    async fn ledger_totals(&self, account_id: &str) -> Result<Vec<(LedgerReason, i64)>> {
        let mut conn = self.conn().await?;
        Ledger::new(&mut conn).totals_by_reason(account_id).await
    }
}
