//! LLM 层：补全 / 嵌入客户端抽象与实现（OpenAI 兼容 / Ollama / 主备切换 / Mock）

pub mod embedding;
pub mod fallback;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod traits;

pub use embedding::{create_embedder_from_config, EmbeddingProvider, OpenAiEmbedder};
pub use fallback::{FallbackLlmClient, FallbackStats};
pub use mock::{MockEmbedder, MockLlmClient};
pub use ollama::{create_ollama_client, OLLAMA_BASE_URL, OLLAMA_DEFAULT_MODEL};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{
    complete_within, Completion, CompletionMetadata, CompletionRequest, CompletionStream, LlmClient,
    LlmError, TokenStream, Usage,
};
