//! Opencode adapter: a local gateway speaking the OpenAI completions wire
//! format on a different default port, without auth.

use nerve_domain::error::Result;

use crate::openai::OpenAiProvider;
use crate::traits::LlmProvider;

pub struct OpencodeProvider {
    inner: OpenAiProvider,
}

impl OpencodeProvider {
    pub fn new(base_url: Option<&str>, model: Option<&str>) -> Result<Self> {
        let inner = OpenAiProvider::new(
            Some(base_url.unwrap_or("http://localhost:4096/v1")),
            model,
            None,
        )?;
        Ok(Self { inner })
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpencodeProvider {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        self.inner.complete(system_prompt, user_prompt).await
    }

    fn provider_id(&self) -> &str {
        "opencode"
    }
}
