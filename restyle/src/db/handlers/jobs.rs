use crate::{
    db::{
        errors::{DbError, Result},
        models::jobs::{
            JobCreateDBRequest, JobDBResponse, JobListFilter, JobOutputCreateDBRequest, JobOutputDBResponse, JobStatus,
            JobTransition,
        },
    },
    types::JobId,
};
use sqlx::PgConnection;
use std::collections::HashMap;

const JOB_COLUMNS: &str = "id, account_id, status, error, input_image_url, room_type, style, intensity, model, params, \
                           created_at, started_at, finished_at";
const OUTPUT_COLUMNS: &str = "job_id, output_index, image_url, created_at";

pub struct Jobs<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Jobs<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    pub async fn create(&mut self, request: &JobCreateDBRequest) -> Result<JobDBResponse> {
        let job = sqlx::query_as::<_, JobDBResponse>(&format!(
            r#"
            INSERT INTO jobs (id, account_id, status, input_image_url, room_type, style, intensity, model, params)
            VALUES ($1, $2, 'queued', $3, $4, $5, $6, $7, $8)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(request.id)
        .bind(&request.account_id)
        .bind(&request.input_image_url)
        .bind(&request.room_type)
        .bind(&request.style)
        .bind(request.intensity)
        .bind(&request.model)
        .bind(&request.params)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(job)
    }

    /// Get a job with its outputs ordered by index
    pub async fn get(&mut self, id: JobId) -> Result<Option<JobDBResponse>> {
        let job = sqlx::query_as::<_, JobDBResponse>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        let Some(mut job) = job else {
            return Ok(None);
        };
        job.outputs = self.outputs_for(&[id]).await?.remove(&id).unwrap_or_default();
        Ok(Some(job))
    }

    /// Compare-and-set on `status`. Returns `false` without touching the row when the persisted
    /// status is not `from`.
    pub async fn transition(&mut self, id: JobId, from: JobStatus, change: &JobTransition) -> Result<bool> {
        let to = change.target();
        if !from.can_transition_to(to) {
            return Err(DbError::InvalidTransition { from, to });
        }

        let result = match change {
            JobTransition::Start { started_at } => {
                sqlx::query("UPDATE jobs SET status = $3, started_at = $4 WHERE id = $1 AND status = $2")
                    .bind(id)
                    .bind(from)
                    .bind(to)
                    .bind(started_at)
                    .execute(&mut *self.db)
                    .await?
            }
            JobTransition::Succeed { finished_at } => {
                sqlx::query("UPDATE jobs SET status = $3, finished_at = $4, error = NULL WHERE id = $1 AND status = $2")
                    .bind(id)
                    .bind(from)
                    .bind(to)
                    .bind(finished_at)
                    .execute(&mut *self.db)
                    .await?
            }
            JobTransition::Fail { error, finished_at } => {
                sqlx::query("UPDATE jobs SET status = $3, error = $4, finished_at = $5 WHERE id = $1 AND status = $2")
                    .bind(id)
                    .bind(from)
                    .bind(to)
                    .bind(error)
                    .bind(finished_at)
                    .execute(&mut *self.db)
                    .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }

    /// Insert all outputs of a job in one statement
    pub async fn insert_outputs(&mut self, job_id: JobId, outputs: &[JobOutputCreateDBRequest]) -> Result<Vec<JobOutputDBResponse>> {
        let indices: Vec<i32> = outputs.iter().map(|o| o.index).collect();
        let urls: Vec<String> = outputs.iter().map(|o| o.image_url.clone()).collect();

        let mut rows = sqlx::query_as::<_, JobOutputDBResponse>(&format!(
            r#"
            INSERT INTO job_outputs (job_id, output_index, image_url)
            SELECT $1, t.output_index, t.image_url
            FROM UNNEST($2::INT4[], $3::TEXT[]) AS t(output_index, image_url)
            RETURNING {OUTPUT_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(indices)
        .bind(urls)
        .fetch_all(&mut *self.db)
        .await?;

        rows.sort_by_key(|o| o.index);
        Ok(rows)
    }

    /// List an account's jobs newest first, strictly older than the cursor
    pub async fn list(&mut self, filter: &JobListFilter) -> Result<Vec<JobDBResponse>> {
        let mut jobs = sqlx::query_as::<_, JobDBResponse>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE account_id = $1 AND ($2::TIMESTAMPTZ IS NULL OR created_at < $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#
        ))
        .bind(&filter.account_id)
        .bind(filter.before)
        .bind(filter.limit)
        .fetch_all(&mut *self.db)
        .await?;

        let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        let mut outputs = self.outputs_for(&ids).await?;
        for job in &mut jobs {
            job.outputs = outputs.remove(&job.id).unwrap_or_default();
        }
        Ok(jobs)
    }

    async fn outputs_for(&mut self, ids: &[JobId]) -> Result<HashMap<JobId, Vec<JobOutputDBResponse>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query_as::<_, JobOutputDBResponse>(&format!(
            "SELECT {OUTPUT_COLUMNS} FROM job_outputs WHERE job_id = ANY($1) ORDER BY job_id, output_index"
        ))
        .bind(ids)
        .fetch_all(&mut *self.db)
        .await?;

        let mut grouped: HashMap<JobId, Vec<JobOutputDBResponse>> = HashMap::new();
        for row in rows {
            grouped.entry(row.job_id).or_default().push(row);
        }
        Ok(grouped)
    }
}
