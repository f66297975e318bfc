//! Model classifier: maps a model identifier to its rate-limit bucket.

use crate::config::Config;
use crate::ratelimit::Bucket;

/// Returns `Premium` if `model` or `preferred` equals the configured
/// premium model id; `Standard` otherwise. `preferred` is consulted only
/// when `model` itself is empty or unmatched.
pub fn classify(config: &Config, model: &str, preferred: Option<&str>) -> Bucket {
    if let Some(premium) = config.premium_model.as_deref() {
        if model == premium {
            return Bucket::Premium;
        }
        if (model.is_empty() || model != config.vertex_model) && preferred == Some(premium) {
            return Bucket::Premium;
        }
    }
    Bucket::Standard
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_premium(premium: &str) -> Config {
        let mut config = Config::from_env();
        config.premium_model = Some(premium.to_string());
        config.vertex_model = "standard-model".into();
        config
    }

    #[test]
    fn matches_model_directly() {
        let config = config_with_premium("premium-model");
        assert_eq!(classify(&config, "premium-model", None), Bucket::Premium);
    }

    #[test]
    fn falls_back_to_preferred_when_model_unmatched() {
        let config = config_with_premium("premium-model");
        assert_eq!(classify(&config, "standard-model", Some("premium-model")), Bucket::Premium);
    }

    #[test]
    fn defaults_to_standard_without_a_match() {
        let config = config_with_premium("premium-model");
        assert_eq!(classify(&config, "standard-model", None), Bucket::Standard);
    }

    #[test]
    fn no_premium_configured_is_always_standard() {
        let mut config = Config::from_env();
        config.premium_model = None;
        assert_eq!(classify(&config, "anything", Some("anything")), Bucket::Standard);
    }
}
