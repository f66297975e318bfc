//! HTTP surface: three endpoints over the generation pipeline and
//! rate-limit store. `Arc`-wrapped shared state, `tower_http` request
//! tracing, served with `axum::serve` over a bound `TcpListener`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::pipeline::{GenerateRequest, Pipeline, PipelineError};
use crate::ratelimit::{Bucket, RateLimitStore};

pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<RateLimitStore>,
    pub pipeline: Arc<Pipeline>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/rate-limit-status", get(rate_limit_status))
        .route("/v1/generate-grid", post(generate_grid))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthzResponse {
    effective_auth_mode: &'static str,
    backend_hint: String,
    key_pool_size: usize,
    vertex_model: String,
    premium_model: Option<String>,
    model_fallbacks: Vec<String>,
    candidate_models: Vec<String>,
    rate_limit_enabled: bool,
    rate_limit_state_path: String,
    poll_ms: u64,
    http_timeout_ms: u64,
    stream_timeout_ms: u64,
    image_size: String,
    aspect_ratio: String,
    output_mime_type: String,
    response_modalities: Vec<String>,
    rate_limit_defaults: RateLimitDefaultsSnapshot,
}

#[derive(Serialize)]
struct RateLimitDefaultsSnapshot {
    standard: LimitPair,
    premium: LimitPair,
}

#[derive(Serialize)]
struct LimitPair {
    rpm: u32,
    rpd: u32,
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = &state.config;
    let auth_mode = match config.effective_auth_mode() {
        crate::config::AuthMode::Project => "project",
        crate::config::AuthMode::ApiKey => "api_key",
        crate::config::AuthMode::None => "none",
    };

    Json(HealthzResponse {
        effective_auth_mode: auth_mode,
        backend_hint: config.api_key_backend_hint.clone(),
        key_pool_size: config.api_key_pool().len(),
        vertex_model: config.vertex_model.clone(),
        premium_model: config.premium_model.clone(),
        model_fallbacks: config.model_fallbacks.clone(),
        candidate_models: config.candidate_models(None),
        rate_limit_enabled: config.rate_limit_enabled,
        rate_limit_state_path: config.rate_limit_state_path.display().to_string(),
        poll_ms: config.poll_ms,
        http_timeout_ms: config.http_timeout_ms,
        stream_timeout_ms: config.stream_timeout_ms,
        image_size: config.image_size.clone(),
        aspect_ratio: config.aspect_ratio.clone(),
        output_mime_type: config.output_mime_type.clone(),
        response_modalities: config.response_modalities.clone(),
        rate_limit_defaults: RateLimitDefaultsSnapshot {
            standard: LimitPair {
                rpm: config.rate_limit_defaults.standard.rpm,
                rpd: config.rate_limit_defaults.standard.rpd,
            },
            premium: LimitPair {
                rpm: config.rate_limit_defaults.premium.rpm,
                rpd: config.rate_limit_defaults.premium.rpd,
            },
        },
    })
}

#[derive(Serialize)]
struct RateLimitStatusResponse {
    enabled: bool,
    key_pool_size: usize,
    updated_at: String,
    poll_ms: u64,
    models: HashMap<String, BucketStatus>,
}

#[derive(Serialize)]
struct BucketStatus {
    label: String,
    rpm: WindowStatus,
    rpd: WindowStatus,
    exhausted: bool,
    retry_after_seconds: u64,
}

#[derive(Serialize)]
struct WindowStatus {
    used: u64,
    limit: u64,
}

async fn rate_limit_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = &state.config;
    let keys = config.api_key_pool();

    let mut limits_by_bucket = HashMap::new();
    limits_by_bucket.insert(
        Bucket::Standard,
        crate::ratelimit::Limits { rpm: config.rate_limit_defaults.standard.rpm, rpd: config.rate_limit_defaults.standard.rpd },
    );
    limits_by_bucket.insert(
        Bucket::Premium,
        crate::ratelimit::Limits { rpm: config.rate_limit_defaults.premium.rpm, rpd: config.rate_limit_defaults.premium.rpd },
    );

    let snapshot = state.store.snapshot(&keys, &limits_by_bucket, config.rate_limiting_active());

    let models = snapshot
        .into_iter()
        .map(|(bucket, s)| {
            (
                bucket.label().to_string(),
                BucketStatus {
                    label: s.label,
                    rpm: WindowStatus { used: s.rpm.used, limit: s.rpm.limit },
                    rpd: WindowStatus { used: s.rpd.used, limit: s.rpd.limit },
                    exhausted: s.exhausted,
                    retry_after_seconds: s.retry_after_seconds,
                },
            )
        })
        .collect();

    Json(RateLimitStatusResponse {
        enabled: config.rate_limiting_active(),
        key_pool_size: keys.len(),
        updated_at: state.store.updated_at(),
        poll_ms: config.poll_ms,
        models,
    })
}

#[derive(Deserialize)]
struct GenerateGridRequest {
    prompt: String,
    style_name: String,
    grid_png_base64: String,
    #[serde(default)]
    negative_prompt: String,
    model: Option<String>,
}

fn validate(request: &GenerateGridRequest) -> Result<(), PipelineError> {
    let prompt_len = request.prompt.chars().count();
    if !(1..=2000).contains(&prompt_len) {
        return Err(PipelineError::ValidationFailure("prompt must be 1..2000 characters".to_string()));
    }
    let style_len = request.style_name.chars().count();
    if !(1..=200).contains(&style_len) {
        return Err(PipelineError::ValidationFailure("style_name must be 1..200 characters".to_string()));
    }
    if request.grid_png_base64.is_empty() {
        return Err(PipelineError::ValidationFailure("grid_png_base64 must be non-empty".to_string()));
    }
    if request.negative_prompt.chars().count() > 1000 {
        return Err(PipelineError::ValidationFailure("negative_prompt must be at most 1000 characters".to_string()));
    }
    if let Some(model) = &request.model {
        let model_len = model.chars().count();
        if !(1..=200).contains(&model_len) {
            return Err(PipelineError::ValidationFailure("model must be 1..200 characters".to_string()));
        }
    }
    Ok(())
}

async fn generate_grid(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerateGridRequest>,
) -> Result<impl IntoResponse, PipelineError> {
    validate(&request)?;

    let negative_prompt = if request.negative_prompt.trim().is_empty() { None } else { Some(request.negative_prompt) };

    let result = state
        .pipeline
        .generate(GenerateRequest {
            prompt: request.prompt,
            style_name: request.style_name,
            grid_png_base64: request.grid_png_base64,
            negative_prompt,
            model: request.model,
        })
        .await?;

    Ok(Json(result))
}
