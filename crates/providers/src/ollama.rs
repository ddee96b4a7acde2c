//! Ollama adapter (local models via the `/api/chat` endpoint).

use serde_json::Value;

use nerve_domain::error::{Error, Result};

use crate::traits::LlmProvider;

pub struct OllamaProvider {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(base_url: Option<&str>, model: Option<&str>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Provider { provider: "ollama".into(), message: e.to_string() })?;
        Ok(Self {
            base_url: base_url.unwrap_or("http://localhost:11434").trim_end_matches('/').to_string(),
            model: model.unwrap_or("llama3").to_string(),
            client,
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for OllamaProvider {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "stream": false,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
        });

        tracing::debug!(url = %url, model = %self.model, "ollama completion request");
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider { provider: "ollama".into(), message: e.to_string() })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::Provider { provider: "ollama".into(), message: e.to_string() })?;
        if !status.is_success() {
            return Err(Error::Provider {
                provider: "ollama".into(),
                message: format!("HTTP {} - {}", status.as_u16(), text),
            });
        }

        let json: Value = serde_json::from_str(&text)?;
        json.get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(String::from)
            .ok_or_else(|| Error::Provider {
                provider: "ollama".into(),
                message: "response missing message.content".into(),
            })
    }

    fn provider_id(&self) -> &str {
        "ollama"
    }
}
