//! Database models for generation jobs and their outputs.

use crate::types::{AccountId, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use utoipa::ToSchema;

/// Job lifecycle state stored as TEXT in database.
///
/// `queued -> running -> {succeeded | failed}`, plus `queued -> failed` when the job never
/// reached the execution channel. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Whether the state machine has an edge from `self` to `next`
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far the generation may depart from the source photo
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Intensity {
    Low,
    Medium,
    High,
}

impl Intensity {
    pub const ALL: [Intensity; 3] = [Intensity::Low, Intensity::Medium, Intensity::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intensity::Low => "low",
            Intensity::Medium => "medium",
            Intensity::High => "high",
        }
    }
}

impl fmt::Display for Intensity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Database request for creating a new job in the `queued` state
#[derive(Debug, Clone)]
pub struct JobCreateDBRequest {
    pub id: JobId,
    pub account_id: AccountId,
    pub input_image_url: String,
    pub room_type: String,
    pub style: String,
    pub intensity: Intensity,
    pub model: String,
    pub params: serde_json::Value,
}

/// Database response for a job, with its outputs ordered by index
#[derive(Debug, Clone, FromRow)]
pub struct JobDBResponse {
    pub id: JobId,
    pub account_id: AccountId,
    pub status: JobStatus,
    pub error: Option<String>,
    pub input_image_url: String,
    pub room_type: String,
    pub style: String,
    pub intensity: Intensity,
    pub model: String,
    pub params: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[sqlx(skip)]
    pub outputs: Vec<JobOutputDBResponse>,
}

/// One persisted result image
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct JobOutputDBResponse {
    pub job_id: JobId,
    #[sqlx(rename = "output_index")]
    pub index: i32,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
}

/// Database request for one output row; rows are always inserted as a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutputCreateDBRequest {
    pub index: i32,
    pub image_url: String,
}

/// A guarded status change. The expected current status is passed alongside it to
/// [`crate::store::JobStore::transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTransition {
    Start { started_at: DateTime<Utc> },
    Succeed { finished_at: DateTime<Utc> },
    Fail { error: String, finished_at: DateTime<Utc> },
}

impl JobTransition {
    pub fn start() -> Self {
        Self::Start { started_at: Utc::now() }
    }

    pub fn succeed() -> Self {
        Self::Succeed { finished_at: Utc::now() }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self::Fail {
            error: error.into(),
            finished_at: Utc::now(),
        }
    }

    pub fn target(&self) -> JobStatus {
        match self {
            JobTransition::Start { .. } => JobStatus::Running,
            JobTransition::Succeed { .. } => JobStatus::Succeeded,
            JobTransition::Fail { .. } => JobStatus::Failed,
        }
    }
}

/// Cursor filter for listing an account's jobs, newest first
#[derive(Debug, Clone)]
pub struct JobListFilter {
    pub account_id: AccountId,
    pub before: Option<DateTime<Utc>>,
    pub limit: i64,
}
