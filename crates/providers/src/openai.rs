//! OpenAI-compatible adapter (`/v1/chat/completions` wire format). Also
//! covers vLLM, LM Studio, and other endpoints that follow the contract.

use serde_json::Value;

use nerve_domain::error::{Error, Result};

use crate::traits::LlmProvider;

pub struct OpenAiProvider {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(base_url: Option<&str>, model: Option<&str>, api_key: Option<&str>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Provider { provider: "openai".into(), message: e.to_string() })?;
        Ok(Self {
            base_url: base_url.unwrap_or("https://api.openai.com/v1").trim_end_matches('/').to_string(),
            model: model.unwrap_or("gpt-4o-mini").to_string(),
            api_key: api_key.map(String::from),
            client,
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
        });

        tracing::debug!(url = %url, model = %self.model, "openai completion request");
        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Provider { provider: "openai".into(), message: e.to_string() })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::Provider { provider: "openai".into(), message: e.to_string() })?;
        if !status.is_success() {
            return Err(Error::Provider {
                provider: "openai".into(),
                message: format!("HTTP {} - {}", status.as_u16(), text),
            });
        }

        let json: Value = serde_json::from_str(&text)?;
        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(String::from)
            .ok_or_else(|| Error::Provider {
                provider: "openai".into(),
                message: "response missing choices[0].message.content".into(),
            })
    }

    fn provider_id(&self) -> &str {
        "openai"
    }
}
