//! Ollama 本地模型客户端（OpenAI 兼容格式）
//!
//! Ollama 在 /v1 下提供 OpenAI 兼容接口，直接复用 OpenAiClient。
//! - Base URL: http://localhost:11434/v1
//! - 模型: llama3.1:8b（默认）

use crate::llm::OpenAiClient;

/// Ollama 常量
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
pub const OLLAMA_DEFAULT_MODEL: &str = "llama3.1:8b";

/// 创建 Ollama 客户端
///
/// - base_url 未给出时依次取环境变量 `OLLAMA_BASE_URL`、默认本地地址
/// - 模型可通过 `model` 参数或 `OLLAMA_MODEL` 环境变量指定
/// - Ollama 不校验 API key，传入占位值即可
pub fn create_ollama_client(base_url: Option<&str>, model: Option<&str>) -> OpenAiClient {
    let base_url = base_url
        .map(String::from)
        .or_else(|| std::env::var("OLLAMA_BASE_URL").ok())
        .unwrap_or_else(|| OLLAMA_BASE_URL.to_string());

    let model = model
        .map(String::from)
        .or_else(|| std::env::var("OLLAMA_MODEL").ok())
        .unwrap_or_else(|| OLLAMA_DEFAULT_MODEL.to_string());

    OpenAiClient::new(Some(base_url.as_str()), &model, Some("ollama")).with_provider("ollama")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmClient;

    #[test]
    fn test_ollama_client_labels_provider() {
        let client = create_ollama_client(Some("http://127.0.0.1:11434/v1"), Some("qwen2.5:7b"));
        assert_eq!(client.provider(), "ollama");
        assert_eq!(client.model(), "qwen2.5:7b");
    }
}
