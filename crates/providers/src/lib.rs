//! LLM provider adapters.
//!
//! The kernel sees one contract: `complete(system, user) -> text`. Which
//! provider backs it is an environment decision (`LLM_PROVIDER`); no kernel
//! behavior depends on the selection.

mod ollama;
mod openai;
mod opencode;
mod registry;
mod traits;

pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use opencode::OpencodeProvider;
pub use registry::create_provider;
pub use traits::LlmProvider;
