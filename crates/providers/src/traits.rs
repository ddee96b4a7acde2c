use nerve_domain::error::Result;

/// Trait every model adapter implements. Adapters translate the two-prompt
/// contract into each provider's wire format; callers never see wire types.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Run one completion and return the text.
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}
