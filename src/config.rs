//! Configuration — every environment lookup in the service lives here.
//!
//! Loaded once in `main` via [`Config::from_env`] and passed by `Arc` into
//! every component. Nothing outside this module calls `std::env::var`.

use std::path::PathBuf;

const DEFAULT_LOCATION: &str = "us-central1";
const DEFAULT_MODEL: &str = "gemini-2.5-flash-image";
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 105_000;
const DEFAULT_STREAM_TIMEOUT_MS: u64 = 90_000;
const DEFAULT_RETRY_AFTER_SECONDS: u64 = 30;
const DEFAULT_IMAGE_SIZE: &str = "1K";
const DEFAULT_ASPECT_RATIO: &str = "1:1";
const DEFAULT_OUTPUT_MIME_TYPE: &str = "image/png";
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;
const DEFAULT_KEY_PROFILE: &str = "gemini";
const DEFAULT_API_KEY_BACKEND: &str = "auto";
const DEFAULT_AUTH_MODE: &str = "auto";
const DEFAULT_POLL_MS: u64 = 2_000;
const DEFAULT_PORT: u16 = 8080;

const STANDARD_DEFAULT_RPM: u32 = 500;
const STANDARD_DEFAULT_RPD: u32 = 2_000;
const PREMIUM_DEFAULT_RPM: u32 = 20;
const PREMIUM_DEFAULT_RPD: u32 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub rpm: u32,
    pub rpd: u32,
}

#[derive(Debug, Clone)]
pub struct RateLimitDefaults {
    pub standard: Limits,
    pub premium: Limits,
}

impl Default for RateLimitDefaults {
    fn default() -> Self {
        Self {
            standard: Limits { rpm: STANDARD_DEFAULT_RPM, rpd: STANDARD_DEFAULT_RPD },
            premium: Limits { rpm: PREMIUM_DEFAULT_RPM, rpd: PREMIUM_DEFAULT_RPD },
        }
    }
}

/// Effective authentication mode after applying defaults and environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Project,
    ApiKey,
    None,
}

/// Developer-API vs. project-scoped variant of the upstream capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendFlavor {
    Developer,
    Project,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub vertex_project_id: Option<String>,
    pub vertex_location: String,
    pub vertex_model: String,
    pub model_fallbacks: Vec<String>,
    pub premium_model: Option<String>,

    pub api_key_profile: String,
    pub api_key_backend_hint: String,
    pub vertex_auth_mode_hint: String,

    pub http_timeout_ms: u64,
    pub stream_timeout_ms: u64,
    pub retry_after_seconds: u64,
    pub max_output_tokens: u32,
    pub response_modalities: Vec<String>,
    pub image_size: String,
    pub aspect_ratio: String,
    pub output_mime_type: String,

    pub rate_limit_enabled: bool,
    pub poll_ms: u64,
    pub rate_limit_state_path: PathBuf,
    pub rate_limit_defaults: RateLimitDefaults,

    pub port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        let vertex_project_id = non_empty(
            env_var("VERTEX_PROJECT_ID")
                .or_else(|| env_var("GOOGLE_CLOUD_PROJECT"))
                .or_else(|| env_var("GCLOUD_PROJECT")),
        );

        Self {
            vertex_project_id,
            vertex_location: env_var("VERTEX_LOCATION").unwrap_or_else(|| DEFAULT_LOCATION.into()),
            vertex_model: env_var("VERTEX_MODEL").unwrap_or_else(|| DEFAULT_MODEL.into()),
            model_fallbacks: parse_fallback_list(&env_var("VERTEX_MODEL_FALLBACKS").unwrap_or_default()),
            premium_model: non_empty(env_var("VERTEX_PREMIUM_MODEL")),

            api_key_profile: normalize_enum(
                env_var("GOOGLE_API_KEY_PROFILE"),
                &["gemini", "aistudio", "developer"],
                DEFAULT_KEY_PROFILE,
            ),
            api_key_backend_hint: normalize_enum(
                env_var("GOOGLE_CLOUD_API_KEY_BACKEND"),
                &["auto", "vertex", "gemini", "project", "developer"],
                DEFAULT_API_KEY_BACKEND,
            ),
            vertex_auth_mode_hint: normalize_enum(
                env_var("VERTEX_AUTH_MODE"),
                &["auto", "project", "api_key"],
                DEFAULT_AUTH_MODE,
            ),

            http_timeout_ms: parse_positive_u64(env_var("VERTEX_HTTP_TIMEOUT_MS"), DEFAULT_HTTP_TIMEOUT_MS),
            stream_timeout_ms: parse_positive_u64(env_var("VERTEX_STREAM_TIMEOUT_MS"), DEFAULT_STREAM_TIMEOUT_MS),
            retry_after_seconds: parse_positive_u64(
                env_var("VERTEX_RETRY_AFTER_SECONDS"),
                DEFAULT_RETRY_AFTER_SECONDS,
            ),
            max_output_tokens: parse_positive_u64(env_var("VERTEX_MAX_OUTPUT_TOKENS"), DEFAULT_MAX_OUTPUT_TOKENS as u64)
                as u32,
            response_modalities: parse_response_modalities(&env_var("VERTEX_RESPONSE_MODALITIES").unwrap_or_default()),
            image_size: normalize_enum(env_var("VERTEX_IMAGE_SIZE"), &["1K", "2K", "4K"], DEFAULT_IMAGE_SIZE),
            aspect_ratio: env_var("VERTEX_ASPECT_RATIO")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_ASPECT_RATIO.into()),
            output_mime_type: normalize_enum(
                env_var("VERTEX_OUTPUT_MIME_TYPE"),
                &["image/png", "image/jpeg"],
                DEFAULT_OUTPUT_MIME_TYPE,
            ),

            rate_limit_enabled: parse_bool(env_var("RATE_LIMIT_ENABLED"), true),
            poll_ms: {
                let raw = parse_positive_u64(env_var("RATE_LIMIT_POLL_MS"), DEFAULT_POLL_MS);
                if raw < 500 { DEFAULT_POLL_MS } else { raw }
            },
            rate_limit_state_path: PathBuf::from(
                env_var("RATE_LIMIT_STATE_PATH").unwrap_or_else(|| "rate_limit_state.json".into()),
            ),
            rate_limit_defaults: parse_rate_limit_defaults(env_var("RATE_LIMIT_DEFAULTS")),

            port: env_var("IMAGEGATE_PORT")
                .and_then(|s| s.parse::<u16>().ok())
                .unwrap_or(DEFAULT_PORT),
        }
    }

    /// `GOOGLE_CLOUD_API_KEY_GEMINI`/`_AISTUDIO`, falling back to
    /// `GOOGLE_CLOUD_API_KEY`, merged in first-seen order.
    pub fn api_key_pool(&self) -> Vec<String> {
        let profile_var = match self.api_key_profile.as_str() {
            "aistudio" => "GOOGLE_CLOUD_API_KEY_AISTUDIO",
            _ => "GOOGLE_CLOUD_API_KEY_GEMINI",
        };
        let configured = env_var(profile_var).unwrap_or_default();
        let fallback = env_var("GOOGLE_CLOUD_API_KEY").unwrap_or_default();

        let mut ordered = parse_api_key_list(&configured);
        for key in parse_api_key_list(&fallback) {
            if !ordered.contains(&key) {
                ordered.push(key);
            }
        }
        ordered
    }

    pub fn effective_auth_mode(&self) -> AuthMode {
        match self.vertex_auth_mode_hint.as_str() {
            "project" => AuthMode::Project,
            "api_key" => AuthMode::ApiKey,
            _ => {
                if self.vertex_project_id.is_some() {
                    AuthMode::Project
                } else if !self.api_key_pool().is_empty() {
                    AuthMode::ApiKey
                } else {
                    AuthMode::None
                }
            }
        }
    }

    /// Rate-limit scheduling is active only when enabled, auth is
    /// api-key, the profile is the developer profile, and the pool is
    /// non-empty.
    pub fn rate_limiting_active(&self) -> bool {
        self.rate_limit_enabled
            && self.effective_auth_mode() == AuthMode::ApiKey
            && self.api_key_profile == "gemini"
            && !self.api_key_pool().is_empty()
    }

    pub fn resolve_backend_flavor(&self, api_key: &str) -> BackendFlavor {
        match self.api_key_backend_hint.as_str() {
            "vertex" | "project" => BackendFlavor::Project,
            "gemini" | "developer" => BackendFlavor::Developer,
            _ => {
                if api_key.starts_with("AIza") {
                    BackendFlavor::Developer
                } else {
                    BackendFlavor::Project
                }
            }
        }
    }

    pub fn candidate_models(&self, preferred: Option<&str>) -> Vec<String> {
        let mut ordered = Vec::new();
        let preferred = preferred.map(str::trim).filter(|s| !s.is_empty());
        for candidate in preferred
            .into_iter()
            .chain(std::iter::once(self.vertex_model.as_str()))
            .chain(self.model_fallbacks.iter().map(String::as_str))
        {
            let candidate = candidate.trim();
            if !candidate.is_empty() && !ordered.iter().any(|c: &String| c == candidate) {
                ordered.push(candidate.to_string());
            }
        }
        ordered
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn normalize_enum(raw: Option<String>, allowed: &[&str], default: &str) -> String {
    let candidate = raw.unwrap_or_default().trim().to_lowercase();
    if allowed.contains(&candidate.as_str()) {
        candidate
    } else {
        default.to_string()
    }
}

fn parse_positive_u64(raw: Option<String>, default: u64) -> u64 {
    match raw.and_then(|s| s.parse::<u64>().ok()) {
        Some(v) if v > 0 => v,
        _ => default,
    }
}

fn parse_bool(raw: Option<String>, default: bool) -> bool {
    match raw.as_deref().map(str::to_lowercase).as_deref() {
        Some("true") | Some("1") | Some("yes") => true,
        Some("false") | Some("0") | Some("no") => false,
        _ => default,
    }
}

/// Splits on comma/newline/semicolon, dedups in first-seen order.
pub fn parse_api_key_list(raw: &str) -> Vec<String> {
    let mut ordered = Vec::new();
    for token in raw.split(|c| c == ',' || c == '\n' || c == ';') {
        let key = token.trim();
        if !key.is_empty() && !ordered.iter().any(|k: &String| k == key) {
            ordered.push(key.to_string());
        }
    }
    ordered
}

fn parse_fallback_list(raw: &str) -> Vec<String> {
    let mut ordered = Vec::new();
    for token in raw.split(',') {
        let model = token.trim();
        if !model.is_empty() && !ordered.contains(&model.to_string()) {
            ordered.push(model.to_string());
        }
    }
    ordered
}

fn parse_response_modalities(raw: &str) -> Vec<String> {
    let mut values = Vec::new();
    for token in raw.split(',') {
        let normalized = token.trim().to_uppercase();
        if !normalized.is_empty() && !values.contains(&normalized) {
            values.push(normalized);
        }
    }
    if values.is_empty() {
        values.push("IMAGE".to_string());
    }
    values
}

fn parse_rate_limit_defaults(raw: Option<String>) -> RateLimitDefaults {
    let Some(raw) = raw else { return RateLimitDefaults::default() };
    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(value) => {
            let defaults = RateLimitDefaults::default();
            let standard = parse_limits(&value["standard"]).unwrap_or(defaults.standard);
            let premium = parse_limits(&value["premium"]).unwrap_or(defaults.premium);
            RateLimitDefaults { standard, premium }
        }
        Err(e) => {
            tracing::warn!("RATE_LIMIT_DEFAULTS malformed, using built-in defaults: {e}");
            RateLimitDefaults::default()
        }
    }
}

fn parse_limits(value: &serde_json::Value) -> Option<Limits> {
    let rpm = value.get("rpm")?.as_u64()?;
    let rpd = value.get("rpd")?.as_u64()?;
    Some(Limits { rpm: rpm as u32, rpd: rpd as u32 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_newline_semicolon_separated_keys() {
        let keys = parse_api_key_list("AIzaA,AIzaB\nAIzaC;AIzaD");
        assert_eq!(keys, vec!["AIzaA", "AIzaB", "AIzaC", "AIzaD"]);
    }

    #[test]
    fn dedups_in_first_seen_order() {
        let keys = parse_api_key_list("a,b,a,c,b");
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn candidate_models_dedups_preferred_against_standard() {
        let mut cfg_env = Config::from_env();
        cfg_env.vertex_model = "standard-model".into();
        cfg_env.model_fallbacks = vec!["fallback-a".into(), "standard-model".into()];
        let candidates = cfg_env.candidate_models(Some("standard-model"));
        assert_eq!(candidates, vec!["standard-model", "fallback-a"]);
    }

    #[test]
    fn malformed_defaults_json_falls_back_to_builtin() {
        let defaults = parse_rate_limit_defaults(Some("not json".into()));
        assert_eq!(defaults.standard.rpm, STANDARD_DEFAULT_RPM);
        assert_eq!(defaults.premium.rpd, PREMIUM_DEFAULT_RPD);
    }

    #[test]
    fn parses_custom_defaults_json() {
        let defaults = parse_rate_limit_defaults(Some(
            r#"{"standard":{"rpm":10,"rpd":20},"premium":{"rpm":1,"rpd":2}}"#.into(),
        ));
        assert_eq!(defaults.standard, Limits { rpm: 10, rpd: 20 });
        assert_eq!(defaults.premium, Limits { rpm: 1, rpd: 2 });
    }
}
