//! HTTP handler for the room type, style and intensity presets.

use axum::response::Json;

use crate::api::models::jobs::PresetsResponse;

#[utoipa::path(
    get,
    path = "/presets",
    tag = "presets",
    summary = "List presets",
    description = "Room types, styles and intensities the UI offers. Submissions are not restricted to these.",
    responses(
        (status = 200, description = "Available presets", body = PresetsResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_presets() -> Json<PresetsResponse> {
    Json(PresetsResponse::default())
}
