//! Generation pipeline: candidate-model iteration, reservation lifecycle,
//! upstream error classification, and the state machine for one
//! request's lifetime (admit → reserve → call upstream → finalize →
//! respond, advance, or refuse).

use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use serde::Serialize;
use thiserror::Error;

use crate::classifier::classify;
use crate::clients::ClientCache;
use crate::config::{AuthMode, BackendFlavor, Config};
use crate::ratelimit::{Bucket, KeyScheduler, LocalRateLimitExceeded};
use crate::upstream::{GenerationConfig, UpstreamError};

const PROMPT_INSTRUCTION: &str =
    "Extend the supplied reference tile into a single coherent image consistent with its surroundings.";

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub style_name: String,
    pub grid_png_base64: String,
    pub negative_prompt: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateResult {
    pub image_base64: String,
    pub mime_type: String,
    pub model: String,
    pub latency_ms: u64,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed base64 input: {0}")]
    ValidationFailure(String),

    #[error("blocked: {0}")]
    SafetyBlocked(String),

    #[error("local rate limit exceeded for {bucket} bucket")]
    LocalRateLimitExceeded { bucket: Bucket, retry_after_seconds: u64 },

    #[error("upstream rate limit: {message}")]
    UpstreamRateLimit { message: String, retry_after_seconds: u64 },

    #[error("upstream error: {0}")]
    UpstreamFatal(String),

    #[error("upstream completed without image data: {0}")]
    UpstreamNoImage(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("all {candidates} candidate models failed: {last_error}")]
    AllCandidatesFailed { candidates: usize, last_error: String },
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let (status, retry_after) = match &self {
            PipelineError::ValidationFailure(_) => (StatusCode::UNPROCESSABLE_ENTITY, None),
            PipelineError::SafetyBlocked(_) => (StatusCode::BAD_REQUEST, None),
            PipelineError::LocalRateLimitExceeded { retry_after_seconds, .. } => {
                (StatusCode::TOO_MANY_REQUESTS, Some(*retry_after_seconds))
            }
            PipelineError::UpstreamRateLimit { retry_after_seconds, .. } => {
                (StatusCode::TOO_MANY_REQUESTS, Some(*retry_after_seconds))
            }
            PipelineError::UpstreamFatal(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
            PipelineError::UpstreamNoImage(_) => (StatusCode::BAD_GATEWAY, None),
            PipelineError::ConfigurationError(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
            PipelineError::AllCandidatesFailed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        let mut response = (status, axum::Json(ErrorBody { error: self.to_string() })).into_response();
        if let Some(seconds) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub struct Pipeline {
    config: Arc<Config>,
    scheduler: Arc<KeyScheduler>,
    clients: Arc<ClientCache>,
}

impl Pipeline {
    pub fn new(config: Arc<Config>, scheduler: Arc<KeyScheduler>, clients: Arc<ClientCache>) -> Self {
        Self { config, scheduler, clients }
    }

    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateResult, PipelineError> {
        let image_bytes = base64::engine::general_purpose::STANDARD
            .decode(request.grid_png_base64.as_bytes())
            .map_err(|e| PipelineError::ValidationFailure(e.to_string()))?;

        let auth_mode = self.config.effective_auth_mode();
        if auth_mode == AuthMode::None {
            return Err(PipelineError::ConfigurationError(
                "requires an API key or project configuration".to_string(),
            ));
        }

        let keys = self.scheduler_keys(auth_mode);
        let prompt = build_prompt(request.prompt.trim(), request.style_name.trim(), request.negative_prompt.as_deref());
        let candidates = self.config.candidate_models(request.model.as_deref());
        let active = self.config.rate_limiting_active();

        let mut last_error = String::new();
        let started_at = Instant::now();

        for model in &candidates {
            let bucket = classify(&self.config, model, request.model.as_deref());
            let limits = match bucket {
                Bucket::Standard => self.config.rate_limit_defaults.standard,
                Bucket::Premium => self.config.rate_limit_defaults.premium,
            };
            let limits = crate::ratelimit::Limits { rpm: limits.rpm, rpd: limits.rpd };

            let allocation = self
                .scheduler
                .reserve_for_bucket(bucket, &keys, limits, active)
                .map_err(|LocalRateLimitExceeded { bucket, retry_after_seconds }| {
                    PipelineError::LocalRateLimitExceeded { bucket, retry_after_seconds }
                })?;

            let flavor = match auth_mode {
                AuthMode::Project => BackendFlavor::Project,
                _ => self.config.resolve_backend_flavor(&allocation.key),
            };

            let client = match auth_mode {
                AuthMode::Project => self.clients.for_project(
                    self.config.vertex_project_id.as_deref().unwrap_or_default(),
                    &self.config.vertex_location,
                ),
                _ => self.clients.for_key(&allocation.key, flavor),
            };

            let generation_config = GenerationConfig::from_config(&self.config, flavor);
            let outcome = client.generate(model, &prompt, &image_bytes, "image/png", &generation_config).await;

            self.scheduler.finalize(&allocation);

            match outcome {
                Ok(result) => {
                    return Ok(GenerateResult {
                        image_base64: base64::engine::general_purpose::STANDARD.encode(result.image_bytes),
                        mime_type: result.mime_type,
                        model: model.clone(),
                        latency_ms: started_at.elapsed().as_millis() as u64,
                    });
                }
                Err(UpstreamError::RateLimit { message }) => {
                    return Err(PipelineError::UpstreamRateLimit {
                        message,
                        retry_after_seconds: self.config.retry_after_seconds,
                    });
                }
                Err(UpstreamError::SafetyBlocked { message }) => return Err(PipelineError::SafetyBlocked(message)),
                Err(UpstreamError::NoImage { message }) => return Err(PipelineError::UpstreamNoImage(message)),
                Err(UpstreamError::Fatal { message }) => return Err(PipelineError::UpstreamFatal(message)),
                Err(UpstreamError::Access { message }) => {
                    tracing::warn!(model = %model, error = %message, "candidate model access denied, advancing");
                    last_error = message;
                }
            }
        }

        Err(PipelineError::AllCandidatesFailed { candidates: candidates.len(), last_error })
    }

    /// In API-key mode, the scheduler round-robins across the real key
    /// pool. In project mode there is exactly one credential, so the
    /// scheduler is given a single synthetic entry to round-robin over —
    /// harmless, since `rate_limiting_active()` is always false outside
    /// the api-key + developer-profile combination and the scheduler then
    /// takes its inactive, store-free branch.
    fn scheduler_keys(&self, auth_mode: AuthMode) -> Vec<String> {
        match auth_mode {
            AuthMode::Project => vec![self.config.vertex_project_id.clone().unwrap_or_default()],
            _ => self.config.api_key_pool(),
        }
    }
}

fn build_prompt(prompt: &str, style_name: &str, negative_prompt: Option<&str>) -> String {
    let mut composed = format!("{PROMPT_INSTRUCTION}\n\nStyle: {style_name}\nAdditional context: {prompt}");
    if let Some(negative) = negative_prompt.map(str::trim).filter(|s| !s.is_empty()) {
        composed.push_str(&format!("\nNegative prompt: {negative}"));
    }
    composed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_prompt_omits_negative_section_when_absent() {
        let composed = build_prompt("a castle", "watercolor", None);
        assert!(composed.contains("Style: watercolor"));
        assert!(composed.contains("Additional context: a castle"));
        assert!(!composed.contains("Negative prompt"));
    }

    #[test]
    fn build_prompt_includes_negative_section_when_present() {
        let composed = build_prompt("a castle", "watercolor", Some("blurry"));
        assert!(composed.ends_with("Negative prompt: blurry"));
    }

    #[test]
    fn build_prompt_ignores_blank_negative_prompt() {
        let composed = build_prompt("a castle", "watercolor", Some("   "));
        assert!(!composed.contains("Negative prompt"));
    }
}
