//! Presets and the pure text/parameter composition that turns a job into a provider request.
//!
//! Nothing here touches state, so the worker can recompute it on every delivery.

use serde::Serialize;
use serde_json::{Map, Value, json};
use utoipa::ToSchema;

use crate::{
    config::GenerationConfig,
    db::models::jobs::{Intensity, JobDBResponse},
    providers::GenerationRequest,
};

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RoomTypePreset {
    pub title: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StylePreset {
    pub title: &'static str,
    pub vibe: &'static str,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IntensityPreset {
    pub id: Intensity,
    pub label: &'static str,
    pub hint: &'static str,
}

pub const ROOM_TYPES: [RoomTypePreset; 6] = [
    RoomTypePreset { title: "Living Room", description: "Cozy, inviting, and balanced." },
    RoomTypePreset { title: "Bedroom", description: "Calm, warm, and restful." },
    RoomTypePreset { title: "Kitchen", description: "Clean, functional, and bright." },
    RoomTypePreset { title: "Bathroom", description: "Fresh, modern, and spa-like." },
    RoomTypePreset { title: "Dining Room", description: "Elegant, social, and well-lit." },
    RoomTypePreset { title: "Home Office", description: "Focused, minimal, and productive." },
];

pub const STYLES: [StylePreset; 6] = [
    StylePreset { title: "Modern Minimal", vibe: "Clean lines, less clutter." },
    StylePreset { title: "Scandinavian", vibe: "Light woods, airy tones." },
    StylePreset { title: "Japandi", vibe: "Zen + warmth, refined." },
    StylePreset { title: "Industrial", vibe: "Concrete, metal, bold." },
    StylePreset { title: "Contemporary Luxury", vibe: "High-end, polished." },
    StylePreset { title: "Warm Mediterranean", vibe: "Sun-kissed, textured." },
];

pub const INTENSITIES: [IntensityPreset; 3] = [
    IntensityPreset { id: Intensity::Low, label: "Low", hint: "Most faithful to the original room." },
    IntensityPreset { id: Intensity::Medium, label: "Medium", hint: "Balanced change and fidelity." },
    IntensityPreset { id: Intensity::High, label: "High", hint: "More creative / wow factor." },
];

pub fn build_prompt(room_type: &str, style: &str) -> String {
    format!(
        "{room_type} interior restyling, {style} style, aesthetically pleasing, high-end design, cohesive furniture, \
         realistic materials, natural lighting, magazine photo. \
         Preserve original room layout, perspective, windows and doors positions, same camera angle."
    )
}

/// Edge-detector thresholds and sampler noise per intensity. Higher means further from the
/// source photo.
pub fn intensity_params(intensity: Intensity) -> Value {
    match intensity {
        Intensity::Low => json!({ "low_threshold": 50, "high_threshold": 150, "eta": 0.0 }),
        Intensity::Medium => json!({ "low_threshold": 100, "high_threshold": 200, "eta": 0.2 }),
        Intensity::High => json!({ "low_threshold": 150, "high_threshold": 250, "eta": 0.4 }),
    }
}

/// Provider params pinned onto a job at submission: sampler defaults with the intensity
/// settings merged over them.
pub fn job_params(generation: &GenerationConfig, images_per_job: i64, intensity: Intensity) -> Value {
    // The model takes these two as strings
    let mut params = Map::new();
    params.insert("num_samples".to_string(), Value::String(images_per_job.to_string()));
    params.insert("image_resolution".to_string(), Value::String(generation.image_resolution.to_string()));
    params.insert("ddim_steps".to_string(), json!(generation.ddim_steps));
    params.insert("scale".to_string(), json!(generation.scale));
    params.insert("a_prompt".to_string(), Value::String(generation.positive_prompt.clone()));
    params.insert("n_prompt".to_string(), Value::String(generation.negative_prompt.clone()));

    if let Value::Object(overrides) = intensity_params(intensity) {
        params.extend(overrides);
    }
    Value::Object(params)
}

pub fn generation_request(job: &JobDBResponse) -> GenerationRequest {
    GenerationRequest {
        model: job.model.clone(),
        image_url: job.input_image_url.clone(),
        prompt: build_prompt(&job.room_type, &job.style),
        params: job.params.clone(),
    }
}
