use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/v1";
pub const DEFAULT_MODEL: &str = "vllm-model";
pub const DEFAULT_API_KEY: &str = "not-used";
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant who operated on a local environment.";
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 2048;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// vLLM and anything else speaking the OpenAI chat-completions protocol.
    #[default]
    OpenAiCompatible,
    Ollama,
}

impl ProviderKind {
    pub fn display_name(&self) -> &str {
        match self {
            ProviderKind::OpenAiCompatible => "OpenAI-compatible",
            ProviderKind::Ollama => "Ollama",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceSettings {
    pub provider: ProviderKind,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub system_prompt: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub request_timeout: Duration,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: DEFAULT_API_KEY.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl InferenceSettings {
    /// Defaults overridden by `VLLM_BASE_URL`, `VLLM_MODEL` and `VLLM_API_KEY`.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key/value source. Empty values are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("VLLM_BASE_URL") {
            self.base_url = url;
        }
        if let Some(model) = get("VLLM_MODEL") {
            self.model = model;
        }
        if let Some(key) = get("VLLM_API_KEY") {
            self.api_key = key;
        }
        self
    }

    /// Request parameters the engine attaches to every completion.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            system_prompt: self.system_prompt.clone(),
            max_output_tokens: self.max_output_tokens,
            temperature: self.temperature,
            request_timeout: self.request_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_local_vllm() {
        let settings = InferenceSettings::default();
        assert_eq!(settings.provider, ProviderKind::OpenAiCompatible);
        assert_eq!(settings.base_url, "http://127.0.0.1:8000/v1");
        assert_eq!(settings.max_output_tokens, 2048);
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("VLLM_BASE_URL", "http://gpu-box:9000/v1"),
            ("VLLM_MODEL", "qwen"),
            ("VLLM_API_KEY", "  "),
        ]
        .into_iter()
        .collect();

        let settings =
            InferenceSettings::default().with_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(settings.base_url, "http://gpu-box:9000/v1");
        assert_eq!(settings.model, "qwen");
        assert_eq!(settings.api_key, DEFAULT_API_KEY);
    }

    #[test]
    fn test_engine_config_carries_request_parameters() {
        let config = InferenceSettings::default().engine_config();
        assert_eq!(config.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(config.max_output_tokens, 2048);
        assert!((config.temperature - 0.7).abs() < f32::EPSILON);
    }
}
