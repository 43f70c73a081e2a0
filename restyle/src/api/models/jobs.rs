//! API request/response models for generation jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    db::models::jobs::{Intensity, JobDBResponse, JobOutputDBResponse, JobStatus},
    jobs::{
        JobSubmission,
        prompt::{INTENSITIES, IntensityPreset, ROOM_TYPES, RoomTypePreset, STYLES, StylePreset},
    },
    types::JobId,
};

/// Submit a restyling job
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct JobCreate {
    /// Publicly fetchable URL of the source photo
    #[serde(alias = "inputImageUrl")]
    pub input_image_url: String,
    /// A preset title or free text, e.g. "Living Room"
    #[serde(alias = "roomType")]
    pub room_type: String,
    /// A preset title or free text, e.g. "Japandi"
    pub style: String,
    pub intensity: Intensity,
}

impl From<JobCreate> for JobSubmission {
    fn from(create: JobCreate) -> Self {
        JobSubmission {
            input_image_url: create.input_image_url,
            room_type: create.room_type,
            style: create.style,
            intensity: create.intensity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobCreated {
    #[schema(value_type = String, format = "uuid")]
    pub job_id: JobId,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobOutputResponse {
    pub index: i32,
    pub image_url: String,
}

impl From<JobOutputDBResponse> for JobOutputResponse {
    fn from(output: JobOutputDBResponse) -> Self {
        Self {
            index: output.index,
            image_url: output.image_url,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: JobId,
    pub status: JobStatus,
    /// Failure text, verbatim from the provider or pipeline step that failed
    pub error: Option<String>,
    pub room_type: String,
    pub style: String,
    pub intensity: Intensity,
    pub input_image_url: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Ordered by index
    pub outputs: Vec<JobOutputResponse>,
}

impl From<JobDBResponse> for JobResponse {
    fn from(job: JobDBResponse) -> Self {
        Self {
            id: job.id,
            status: job.status,
            error: job.error,
            room_type: job.room_type,
            style: job.style,
            intensity: job.intensity,
            input_image_url: job.input_image_url,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            outputs: job.outputs.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobListResponse {
    pub items: Vec<JobResponse>,
    /// `created_at` of the last item, to pass as `before`; null when the page is empty
    pub next_cursor: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PresetsResponse {
    pub room_types: Vec<RoomTypePreset>,
    pub styles: Vec<StylePreset>,
    pub intensities: Vec<IntensityPreset>,
}

impl Default for PresetsResponse {
    fn default() -> Self {
        Self {
            room_types: ROOM_TYPES.to_vec(),
            styles: STYLES.to_vec(),
            intensities: INTENSITIES.to_vec(),
        }
    }
}
