//! In-process [`Store`](super::Store) used for `database.type: memory` and the test-suite.
//!
//! All tables live behind one mutex, so every operation is atomic with respect to the others,
//! which is at least as strong as the per-statement guarantees of the PostgreSQL store.

use super::{AccountStore, JobStore, LedgerStore};
use crate::{
    db::{
        errors::{DbError, Result},
        models::{
            accounts::AccountDBResponse,
            jobs::{JobCreateDBRequest, JobDBResponse, JobListFilter, JobOutputCreateDBRequest, JobOutputDBResponse, JobStatus, JobTransition},
            ledger::{LedgerEntryCreateDBRequest, LedgerEntryDBResponse, LedgerReason, ONE_CHARGE_PER_JOB, ONE_REFUND_PER_JOB, SOURCE_ID_UNIQUE},
        },
    },
    types::JobId,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct Tables {
    accounts: HashMap<String, AccountDBResponse>,
    jobs: HashMap<JobId, JobDBResponse>,
    outputs: HashMap<JobId, Vec<JobOutputDBResponse>>,
    ledger: Vec<LedgerEntryDBResponse>,
}

impl Tables {
    fn job_with_outputs(&self, id: JobId) -> Option<JobDBResponse> {
        self.jobs.get(&id).map(|job| {
            let mut job = job.clone();
            job.outputs = self.outputs.get(&id).cloned().unwrap_or_default();
            job
        })
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unique_violation(table: &str, constraint: &str) -> DbError {
    DbError::UniqueViolation {
        constraint: Some(constraint.to_string()),
        table: Some(table.to_string()),
        message: format!("duplicate key value violates unique constraint \"{constraint}\""),
    }
}

fn foreign_key_violation(table: &str, constraint: &str) -> DbError {
    DbError::ForeignKeyViolation {
        constraint: Some(constraint.to_string()),
        table: Some(table.to_string()),
        message: format!("insert or update on table \"{table}\" violates foreign key constraint \"{constraint}\""),
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn upsert_account(&self, id: &str) -> Result<AccountDBResponse> {
        let mut tables = self.tables.lock().await;
        let account = tables.accounts.entry(id.to_string()).or_insert_with(|| {
            let now = Utc::now();
            AccountDBResponse {
                id: id.to_string(),
                credits: 0,
                free_used: 0,
                created_at: now,
                updated_at: now,
            }
        });
        Ok(account.clone())
    }

    async fn get_account(&self, id: &str) -> Result<Option<AccountDBResponse>> {
        Ok(self.tables.lock().await.accounts.get(id).cloned())
    }

    async fn adjust_credits(&self, id: &str, delta: i64) -> Result<Option<AccountDBResponse>> {
        let mut tables = self.tables.lock().await;
        let Some(account) = tables.accounts.get_mut(id) else {
            return Ok(None);
        };
        if account.credits + delta < 0 {
            return Ok(None);
        }
        account.credits += delta;
        account.updated_at = Utc::now();
        Ok(Some(account.clone()))
    }

    async fn adjust_free_used(&self, id: &str, delta: i64, ceiling: Option<i64>) -> Result<Option<AccountDBResponse>> {
        let mut tables = self.tables.lock().await;
        let Some(account) = tables.accounts.get_mut(id) else {
            return Ok(None);
        };
        if ceiling.is_some_and(|ceiling| account.free_used + delta > ceiling) {
            return Ok(None);
        }
        account.free_used = (account.free_used + delta).max(0);
        account.updated_at = Utc::now();
        Ok(Some(account.clone()))
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, request: &JobCreateDBRequest) -> Result<JobDBResponse> {
        let mut tables = self.tables.lock().await;
        if !tables.accounts.contains_key(&request.account_id) {
            return Err(foreign_key_violation("jobs", "jobs_account_id_fkey"));
        }
        if tables.jobs.contains_key(&request.id) {
            return Err(unique_violation("jobs", "jobs_pkey"));
        }

        let job = JobDBResponse {
            id: request.id,
            account_id: request.account_id.clone(),
            status: JobStatus::Queued,
            error: None,
            input_image_url: request.input_image_url.clone(),
            room_type: request.room_type.clone(),
            style: request.style.clone(),
            intensity: request.intensity,
            model: request.model.clone(),
            params: request.params.clone(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            outputs: Vec::new(),
        };
        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobDBResponse>> {
        Ok(self.tables.lock().await.job_with_outputs(id))
    }

    async fn transition(&self, id: JobId, from: JobStatus, change: &JobTransition) -> Result<bool> {
        let to = change.target();
        if !from.can_transition_to(to) {
            return Err(DbError::InvalidTransition { from, to });
        }

        let mut tables = self.tables.lock().await;
        let Some(job) = tables.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != from {
            return Ok(false);
        }

        job.status = to;
        match change {
            JobTransition::Start { started_at } => job.started_at = Some(*started_at),
            JobTransition::Succeed { finished_at } => {
                job.finished_at = Some(*finished_at);
                job.error = None;
            }
            JobTransition::Fail { error, finished_at } => {
                job.finished_at = Some(*finished_at);
                job.error = Some(error.clone());
            }
        }
        Ok(true)
    }

    async fn insert_outputs(&self, job_id: JobId, outputs: &[JobOutputCreateDBRequest]) -> Result<Vec<JobOutputDBResponse>> {
        let mut tables = self.tables.lock().await;
        if !tables.jobs.contains_key(&job_id) {
            return Err(foreign_key_violation("job_outputs", "job_outputs_job_id_fkey"));
        }

        let existing = tables.outputs.get(&job_id).map(Vec::as_slice).unwrap_or_default();
        let mut seen: Vec<i32> = existing.iter().map(|o| o.index).collect();
        for output in outputs {
            if seen.contains(&output.index) {
                return Err(unique_violation("job_outputs", "job_outputs_pkey"));
            }
            seen.push(output.index);
        }

        let now = Utc::now();
        let mut inserted: Vec<JobOutputDBResponse> = outputs
            .iter()
            .map(|o| JobOutputDBResponse {
                job_id,
                index: o.index,
                image_url: o.image_url.clone(),
                created_at: now,
            })
            .collect();
        inserted.sort_by_key(|o| o.index);

        let rows = tables.outputs.entry(job_id).or_default();
        rows.extend(inserted.iter().cloned());
        rows.sort_by_key(|o| o.index);
        Ok(inserted)
    }

    async fn list_jobs(&self, filter: &JobListFilter) -> Result<Vec<JobDBResponse>> {
        let tables = self.tables.lock().await;
        let mut jobs: Vec<&JobDBResponse> = tables
            .jobs
            .values()
            .filter(|job| job.account_id == filter.account_id)
            .filter(|job| filter.before.is_none_or(|before| job.created_at < before))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(jobs
            .into_iter()
            .take(filter.limit.max(0) as usize)
            .filter_map(|job| tables.job_with_outputs(job.id))
            .collect())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn insert_entry(&self, request: &LedgerEntryCreateDBRequest) -> Result<LedgerEntryDBResponse> {
        let mut tables = self.tables.lock().await;
        if !tables.accounts.contains_key(&request.account_id) {
            return Err(foreign_key_violation("credit_ledger", "credit_ledger_account_id_fkey"));
        }

        let grant = request.reason == LedgerReason::CreditGrant;
        if grant != request.job_id.is_none() || (grant && request.source_id.is_none()) {
            return Err(DbError::CheckViolation {
                constraint: Some("credit_ledger_job_reference".to_string()),
                table: Some("credit_ledger".to_string()),
                message: "new row for relation \"credit_ledger\" violates check constraint".to_string(),
            });
        }

        if let Some(job_id) = request.job_id {
            if !tables.jobs.contains_key(&job_id) {
                return Err(foreign_key_violation("credit_ledger", "credit_ledger_job_id_fkey"));
            }
            let same_job = |reasons: &[LedgerReason]| {
                tables
                    .ledger
                    .iter()
                    .any(|e| e.job_id == Some(job_id) && reasons.contains(&e.reason))
            };
            if request.reason.is_charge() && same_job(&LedgerReason::CHARGES) {
                return Err(unique_violation("credit_ledger", ONE_CHARGE_PER_JOB));
            }
            if request.reason.is_refund() && same_job(&LedgerReason::REFUNDS) {
                return Err(unique_violation("credit_ledger", ONE_REFUND_PER_JOB));
            }
        }

        if let Some(source_id) = &request.source_id
            && tables.ledger.iter().any(|e| e.source_id.as_ref() == Some(source_id))
        {
            return Err(unique_violation("credit_ledger", SOURCE_ID_UNIQUE));
        }

        let entry = LedgerEntryDBResponse {
            id: tables.ledger.len() as i64 + 1,
            account_id: request.account_id.clone(),
            job_id: request.job_id,
            delta: request.delta,
            reason: request.reason,
            source_id: request.source_id.clone(),
            description: request.description.clone(),
            created_at: Utc::now(),
        };
        tables.ledger.push(entry.clone());
        Ok(entry)
    }

    async fn find_job_entry(&self, account_id: &str, job_id: JobId, reasons: &[LedgerReason]) -> Result<Option<LedgerEntryDBResponse>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .ledger
            .iter()
            .find(|e| e.account_id == account_id && e.job_id == Some(job_id) && reasons.contains(&e.reason))
            .cloned())
    }

    async fn find_entry_by_source(&self, source_id: &str) -> Result<Option<LedgerEntryDBResponse>> {
        let tables = self.tables.lock().await;
        Ok(tables.ledger.iter().find(|e| e.source_id.as_deref() == Some(source_id)).cloned())
    }

    async fn list_entries(&self, account_id: &str, skip: i64, limit: i64) -> Result<Vec<LedgerEntryDBResponse>> {
        let tables = self.tables.lock().await;
        // Ids are assigned in insertion order, so reverse id order is newest first
        Ok(tables
            .ledger
            .iter()
            .rev()
            .filter(|e| e.account_id == account_id)
            .skip(skip.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn ledger_totals(&self, account_id: &str) -> Result<Vec<(LedgerReason, i64)>> {
        let tables = self.tables.lock().await;
        let mut totals: HashMap<LedgerReason, i64> = HashMap::new();
        for entry in tables.ledger.iter().filter(|e| e.account_id == account_id) {
            *totals.entry(entry.reason).or_default() += entry.delta;
        }
        Ok(totals.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::jobs::Intensity;

    fn job_request(account: &str) -> JobCreateDBRequest {
        JobCreateDBRequest {
            id: JobId::new_v4(),
            account_id: account.to_string(),
            input_image_url: "https://img.example.com/in.jpg".to_string(),
            room_type: "Bedroom".to_string(),
            style: "Japandi".to_string(),
            intensity: Intensity::Medium,
            model: "test-model".to_string(),
            params: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = MemoryStore::new();
        store.upsert_account("a").await.unwrap();
        store.adjust_credits("a", 10).await.unwrap();
        let again = store.upsert_account("a").await.unwrap();
        assert_eq!(again.credits, 10);
    }

    #[tokio::test]
    async fn credits_never_go_negative() {
        let store = MemoryStore::new();
        store.upsert_account("a").await.unwrap();
        store.adjust_credits("a", 3).await.unwrap();
        assert!(store.adjust_credits("a", -4).await.unwrap().is_none());
        assert_eq!(store.get_account("a").await.unwrap().unwrap().credits, 3);
        assert!(store.adjust_credits("missing", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn free_used_floors_at_zero_and_respects_ceiling() {
        let store = MemoryStore::new();
        store.upsert_account("a").await.unwrap();
        assert_eq!(store.adjust_free_used("a", 4, Some(5)).await.unwrap().unwrap().free_used, 4);
        assert!(store.adjust_free_used("a", 4, Some(5)).await.unwrap().is_none());
        assert_eq!(store.adjust_free_used("a", -10, None).await.unwrap().unwrap().free_used, 0);
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = MemoryStore::new();
        store.upsert_account("a").await.unwrap();
        let job = store.create_job(&job_request("a")).await.unwrap();

        assert!(store.transition(job.id, JobStatus::Queued, &JobTransition::start()).await.unwrap());
        // second delivery sees running, not queued
        assert!(!store.transition(job.id, JobStatus::Queued, &JobTransition::start()).await.unwrap());
        assert!(store.transition(job.id, JobStatus::Running, &JobTransition::fail("boom")).await.unwrap());
        assert!(!store.transition(job.id, JobStatus::Running, &JobTransition::succeed()).await.unwrap());

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(job.started_at.is_some() && job.finished_at.is_some());
    }

    #[tokio::test]
    async fn transition_out_of_terminal_state_is_invalid() {
        let store = MemoryStore::new();
        let err = store
            .transition(JobId::new_v4(), JobStatus::Succeeded, &JobTransition::fail("x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::InvalidTransition {
                from: JobStatus::Succeeded,
                to: JobStatus::Failed
            }
        ));
    }

    #[tokio::test]
    async fn job_requires_account() {
        let store = MemoryStore::new();
        let err = store.create_job(&job_request("nobody")).await.unwrap_err();
        assert!(matches!(err, DbError::ForeignKeyViolation { .. }));
    }

    #[tokio::test]
    async fn outputs_are_unique_per_index() {
        let store = MemoryStore::new();
        store.upsert_account("a").await.unwrap();
        let job = store.create_job(&job_request("a")).await.unwrap();
        let outputs: Vec<_> = (0..4)
            .rev()
            .map(|i| JobOutputCreateDBRequest {
                index: i,
                image_url: format!("https://cdn/{i}"),
            })
            .collect();

        let inserted = store.insert_outputs(job.id, &outputs).await.unwrap();
        assert_eq!(inserted.iter().map(|o| o.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(store.insert_outputs(job.id, &outputs).await.unwrap_err().is_unique_violation(None));
        assert_eq!(store.get_job(job.id).await.unwrap().unwrap().outputs.len(), 4);
    }

    #[tokio::test]
    async fn one_charge_and_one_refund_per_job() {
        let store = MemoryStore::new();
        store.upsert_account("a").await.unwrap();
        let job = store.create_job(&job_request("a")).await.unwrap();

        let charge = LedgerEntryCreateDBRequest::charge("a".into(), job.id, LedgerReason::FreeQuotaUsed, 4);
        store.insert_entry(&charge).await.unwrap();
        let paid = LedgerEntryCreateDBRequest::charge("a".into(), job.id, LedgerReason::JobCharge, 4);
        assert!(store.insert_entry(&paid).await.unwrap_err().is_unique_violation(Some(ONE_CHARGE_PER_JOB)));

        let refund = LedgerEntryCreateDBRequest::refund("a".into(), job.id, LedgerReason::FreeQuotaRefundFailed, 4);
        store.insert_entry(&refund).await.unwrap();
        assert!(store.insert_entry(&refund).await.unwrap_err().is_unique_violation(Some(ONE_REFUND_PER_JOB)));
    }

    #[tokio::test]
    async fn grants_are_unique_per_source() {
        let store = MemoryStore::new();
        store.upsert_account("a").await.unwrap();
        let grant = LedgerEntryCreateDBRequest::grant("a".into(), 10, "stripe_1".into(), None);
        store.insert_entry(&grant).await.unwrap();
        assert!(store.insert_entry(&grant).await.unwrap_err().is_unique_violation(Some(SOURCE_ID_UNIQUE)));
        assert!(store.find_entry_by_source("stripe_1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_jobs_paginates_newest_first() {
        let store = MemoryStore::new();
        store.upsert_account("a").await.unwrap();
        store.upsert_account("b").await.unwrap();
        for _ in 0..3 {
            store.create_job(&job_request("a")).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        store.create_job(&job_request("b")).await.unwrap();

        let first = store
            .list_jobs(&JobListFilter {
                account_id: "a".into(),
                before: None,
                limit: 2,
            })
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert!(first[0].created_at > first[1].created_at);

        let rest = store
            .list_jobs(&JobListFilter {
                account_id: "a".into(),
                before: Some(first[1].created_at),
                limit: 2,
            })
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert!(rest[0].created_at < first[1].created_at);
    }
}
