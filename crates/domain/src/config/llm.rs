use serde::{Deserialize, Serialize};

/// Provider selection and per-provider connection settings. The kernel never
/// depends on which provider is active; handlers see `complete(system, user)`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    /// `LLM_PROVIDER`: `ollama`, `openai`, `opencode`. `None` = no model.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

impl LlmConfig {
    pub fn apply_env(&mut self, get: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("LLM_PROVIDER") {
            self.provider = Some(v);
        }
        let prefix = match self.provider.as_deref() {
            Some("ollama") => "OLLAMA",
            Some("openai") => "OPENAI",
            Some("opencode") => "OPENCODE",
            _ => return,
        };
        if let Some(v) = get(&format!("{prefix}_BASE_URL")) {
            self.base_url = Some(v);
        }
        if let Some(v) = get(&format!("{prefix}_MODEL")) {
            self.model = Some(v);
        }
        if let Some(v) = get(&format!("{prefix}_API_KEY")) {
            self.api_key = Some(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_prefix_selects_env_keys() {
        let mut config = LlmConfig::default();
        let get = |key: &str| match key {
            "LLM_PROVIDER" => Some("ollama".to_string()),
            "OLLAMA_BASE_URL" => Some("http://localhost:11434".to_string()),
            "OLLAMA_MODEL" => Some("llama3".to_string()),
            _ => None,
        };
        config.apply_env(&get);
        assert_eq!(config.provider.as_deref(), Some("ollama"));
        assert_eq!(config.base_url.as_deref(), Some("http://localhost:11434"));
        assert_eq!(config.model.as_deref(), Some("llama3"));
        assert!(config.api_key.is_none());
    }

    #[test]
    fn no_provider_reads_nothing() {
        let mut config = LlmConfig::default();
        config.apply_env(&|key: &str| match key {
            "OLLAMA_MODEL" => Some("x".to_string()),
            _ => None,
        });
        assert!(config.model.is_none());
    }
}
