use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Acknowledgement returned to the execution channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RunJobResponse {
    /// False if the job was not found or its execution failed
    pub ok: bool,
    /// Present when a failure was recorded: whether its charge was reversed by this delivery
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refunded: Option<bool>,
}

impl RunJobResponse {
    pub fn ok() -> Self {
        Self { ok: true, refunded: None }
    }

    pub fn not_ok() -> Self {
        Self { ok: false, refunded: None }
    }

    pub fn failed(refunded: bool) -> Self {
        Self {
            ok: false,
            refunded: Some(refunded),
        }
    }
}
