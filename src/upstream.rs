//! The upstream generation capability: a black box that, given a model id,
//! a prompt, and an image, returns bytes+mime or raises a classified
//! error. This module implements one concrete client against the
//! Google-style multimodal REST contract. Its job is to satisfy the
//! abstract contract, not to be a general multi-provider SDK.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::{BackendFlavor, Config};

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub temperature: f64,
    pub top_p: f64,
    pub max_output_tokens: u32,
    pub response_modalities: Vec<String>,
    pub aspect_ratio: String,
    pub image_size: Option<String>,
    pub output_mime_type: Option<String>,
}

impl GenerationConfig {
    pub fn from_config(config: &Config, flavor: BackendFlavor) -> Self {
        let (image_size, output_mime_type) = match flavor {
            BackendFlavor::Developer => (None, None),
            BackendFlavor::Project => (Some(config.image_size.clone()), Some(config.output_mime_type.clone())),
        };
        Self {
            temperature: 1.0,
            top_p: 0.95,
            max_output_tokens: config.max_output_tokens,
            response_modalities: config.response_modalities.clone(),
            aspect_ratio: config.aspect_ratio.clone(),
            image_size,
            output_mime_type,
        }
    }
}

pub struct GenerationResult {
    pub image_bytes: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone)]
pub enum UpstreamError {
    /// 400/403/404 with a known access-denied marker; advances the candidate loop.
    Access { message: String },
    /// 429 or a known resource-exhausted signal.
    RateLimit { message: String },
    /// Completed without raising, but no image part was returned.
    NoImage { message: String },
    /// Blocked by safety filtering (prompt- or candidate-level).
    SafetyBlocked { message: String },
    /// Anything else: network failure, unexpected shape, 5xx.
    Fatal { message: String },
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            UpstreamError::Access { message }
            | UpstreamError::RateLimit { message }
            | UpstreamError::NoImage { message }
            | UpstreamError::SafetyBlocked { message }
            | UpstreamError::Fatal { message } => message,
        };
        write!(f, "{message}")
    }
}

/// The abstract upstream capability. One live handle per `(key, backend)`,
/// cached by [`crate::clients::ClientCache`].
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        image_bytes: &[u8],
        image_mime: &str,
        config: &GenerationConfig,
    ) -> Result<GenerationResult, UpstreamError>;
}

/// Concrete client for the developer-API (Gemini) and project-scoped
/// (Vertex) flavors of the same multimodal REST surface.
pub struct GoogleImageClient {
    http: reqwest::Client,
    api_key: Option<String>,
    project: Option<(String, String)>,
    flavor: BackendFlavor,
}

impl GoogleImageClient {
    pub fn for_api_key(http: reqwest::Client, api_key: String, flavor: BackendFlavor) -> Self {
        Self { http, api_key: Some(api_key), project: None, flavor }
    }

    pub fn for_project(http: reqwest::Client, project: String, location: String) -> Self {
        Self { http, api_key: None, project: Some((project, location)), flavor: BackendFlavor::Project }
    }

    fn endpoint(&self, model: &str) -> String {
        match (&self.api_key, &self.project) {
            (Some(_), _) => format!(
                "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent"
            ),
            (None, Some((project, location))) => format!(
                "https://{location}-aiplatform.googleapis.com/v1/projects/{project}/locations/{location}/publishers/google/models/{model}:generateContent"
            ),
            (None, None) => unreachable!("GoogleImageClient requires either an api key or a project"),
        }
    }
}

#[async_trait]
impl UpstreamClient for GoogleImageClient {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        image_bytes: &[u8],
        image_mime: &str,
        config: &GenerationConfig,
    ) -> Result<GenerationResult, UpstreamError> {
        let body = build_request_body(prompt, image_bytes, image_mime, config);
        let mut request = self.http.post(self.endpoint(model)).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("x-goog-api-key", key);
        }

        let response = request.send().await.map_err(|e| UpstreamError::Fatal { message: e.to_string() })?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();

        if !(200..300).contains(&status) {
            return Err(classify_http_error(status, &text));
        }

        let parsed: GenerateContentResponse = serde_json::from_str(&text)
            .map_err(|e| UpstreamError::Fatal { message: format!("malformed upstream response: {e}") })?;

        extract_image(parsed, self.flavor)
    }
}

fn classify_http_error(status: u16, body: &str) -> UpstreamError {
    let lowered = body.to_lowercase();
    if is_rate_limit_error(status, &lowered) {
        UpstreamError::RateLimit { message: format!("upstream rate limit ({status}): {body}") }
    } else if is_model_access_error(status, &lowered) {
        UpstreamError::Access { message: format!("upstream access denied ({status}): {body}") }
    } else {
        UpstreamError::Fatal { message: format!("upstream error ({status}): {body}") }
    }
}

fn is_rate_limit_error(status: u16, lowered_body: &str) -> bool {
    status == 429 || lowered_body.contains("resource_exhausted") || lowered_body.contains("429")
}

fn is_model_access_error(status: u16, lowered_body: &str) -> bool {
    matches!(status, 400 | 403 | 404)
        && (lowered_body.contains("publisher model")
            || lowered_body.contains("not found")
            || lowered_body.contains("not_found")
            || lowered_body.contains("does not have access")
            || lowered_body.contains("permission denied"))
}

fn build_request_body(prompt: &str, image_bytes: &[u8], image_mime: &str, config: &GenerationConfig) -> serde_json::Value {
    let image_b64 = base64::engine::general_purpose::STANDARD.encode(image_bytes);

    let mut generation_config = serde_json::json!({
        "temperature": config.temperature,
        "topP": config.top_p,
        "maxOutputTokens": config.max_output_tokens,
        "responseModalities": config.response_modalities,
    });

    let mut image_config = serde_json::json!({ "aspectRatio": config.aspect_ratio });
    if let Some(size) = &config.image_size {
        image_config["imageSize"] = serde_json::Value::String(size.clone());
    }
    if let Some(mime) = &config.output_mime_type {
        image_config["outputMimeType"] = serde_json::Value::String(mime.clone());
    }
    generation_config["imageConfig"] = image_config;

    serde_json::json!({
        "contents": [{
            "role": "user",
            "parts": [
                { "text": prompt },
                { "inlineData": { "mimeType": image_mime, "data": image_b64 } },
            ]
        }],
        "generationConfig": generation_config,
        "safetySettings": safety_settings_all_off(),
    })
}

fn safety_settings_all_off() -> Vec<serde_json::Value> {
    [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
    ]
    .into_iter()
    .map(|category| serde_json::json!({ "category": category, "threshold": "BLOCK_NONE" }))
    .collect()
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
    #[serde(rename = "promptFeedback", default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(rename = "blockReason", default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseCandidate {
    #[serde(default)]
    content: Option<ResponseContent>,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize, Serialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(rename = "inlineData", default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize, Serialize)]
struct InlineData {
    #[serde(rename = "mimeType", default)]
    mime_type: Option<String>,
    data: String,
}

const BLOCKED_FINISH_REASONS: [&str; 3] = ["SAFETY", "PROHIBITED_CONTENT", "BLOCKLIST"];

fn extract_image(response: GenerateContentResponse, _flavor: BackendFlavor) -> Result<GenerationResult, UpstreamError> {
    if let Some(feedback) = &response.prompt_feedback {
        if let Some(reason) = &feedback.block_reason {
            return Err(UpstreamError::SafetyBlocked { message: format!("prompt blocked: {reason}") });
        }
    }

    let mut collected_text = String::new();

    for candidate in &response.candidates {
        if let Some(reason) = &candidate.finish_reason {
            if BLOCKED_FINISH_REASONS.contains(&reason.as_str()) {
                return Err(UpstreamError::SafetyBlocked { message: format!("candidate blocked: {reason}") });
            }
        }

        let Some(content) = &candidate.content else { continue };
        for part in &content.parts {
            if let Some(inline) = &part.inline_data {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(&inline.data)
                    .map_err(|e| UpstreamError::Fatal { message: format!("malformed inline image data: {e}") })?;
                let mime_type = inline.mime_type.clone().unwrap_or_else(|| "image/png".to_string());
                return Ok(GenerationResult { image_bytes: bytes, mime_type });
            }
            if let Some(text) = &part.text {
                collected_text.push_str(text);
            }
        }
    }

    tracing::warn!(text = %collected_text, "upstream completed without image data");
    Err(UpstreamError::NoImage { message: "completed without image data".to_string() })
}
