//! Provider construction from configuration.

use std::sync::Arc;

use nerve_domain::config::LlmConfig;
use nerve_domain::error::{Error, Result};

use crate::{LlmProvider, OllamaProvider, OpenAiProvider, OpencodeProvider};

/// Build the configured provider. `None` when no provider is selected; the
/// kernel then runs with deterministic handlers only.
pub fn create_provider(config: &LlmConfig) -> Result<Option<Arc<dyn LlmProvider>>> {
    let Some(kind) = config.provider.as_deref() else {
        return Ok(None);
    };
    let base_url = config.base_url.as_deref();
    let model = config.model.as_deref();
    let provider: Arc<dyn LlmProvider> = match kind {
        "ollama" => Arc::new(OllamaProvider::new(base_url, model)?),
        "openai" => Arc::new(OpenAiProvider::new(base_url, model, config.api_key.as_deref())?),
        "opencode" => Arc::new(OpencodeProvider::new(base_url, model)?),
        other => {
            return Err(Error::Config(format!("unknown LLM provider: {other}")));
        }
    };
    Ok(Some(provider))
}
