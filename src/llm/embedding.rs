//! 嵌入 API：供向量检索后端使用，调用 OpenAI 兼容的 /embeddings 端点

use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::LlmError;

/// 嵌入提供方：文本 → 定长向量
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;

    /// 批量编码；默认逐条调用 embed，任一失败即整体失败
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// 使用 async-openai 调用 OpenAI 兼容的 embeddings API
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
}

impl OpenAiEmbedder {
    /// 从环境变量与可选 base_url 创建（与 LLM 共用 OPENAI_API_KEY / base_url）
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new()
                .with_api_base(url)
                .with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// 单次请求时限；超时按 LlmError::Timeout 返回
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn request(&self, input: EmbeddingInput) -> Result<Vec<Vec<f32>>, LlmError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(input)
            .build()
            .map_err(|e| LlmError::Api(e.to_string()))?;
        let response = tokio::time::timeout(self.timeout, self.client.embeddings().create(request))
            .await
            .map_err(|_| LlmError::Timeout(self.timeout))?
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;
        let mut data = response.data;
        data.sort_by_key(|e| e.index);
        Ok(data.into_iter().map(|e| e.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(vec![]);
        }
        self.request(EmbeddingInput::String(text.to_string()))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let vectors = self.request(EmbeddingInput::StringArray(texts.to_vec())).await?;
        if vectors.len() != texts.len() {
            return Err(LlmError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}

/// 从应用配置创建嵌入提供方；未启用或缺少 API key 时返回 None
pub fn create_embedder_from_config(
    enabled: bool,
    base_url: Option<&str>,
    model: &str,
    api_key: Option<&str>,
    timeout: Duration,
) -> Option<Arc<dyn EmbeddingProvider>> {
    if !enabled {
        tracing::debug!("embedding disabled by config");
        return None;
    }
    let key = api_key
        .map(String::from)
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());
    // 自定义 base_url（如本地 Ollama）不要求真实 key
    let has_key = !key.as_deref().unwrap_or("").is_empty() && key.as_deref() != Some("sk-placeholder");
    if !has_key && base_url.is_none() {
        tracing::debug!("embedding skipped: no OPENAI_API_KEY");
        return None;
    }
    Some(Arc::new(
        OpenAiEmbedder::new(base_url, model, key.as_deref()).with_timeout(timeout),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockEmbedder;

    #[tokio::test]
    async fn test_default_embed_batch_preserves_order() {
        let e = MockEmbedder::new(16);
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let batch = e.embed_batch(&texts).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], e.embed("alpha").await.unwrap());
        assert_eq!(batch[1], e.embed("beta").await.unwrap());
    }

    #[tokio::test]
    async fn test_embed_batch_fails_as_a_whole() {
        let e = MockEmbedder::failing();
        assert!(e.embed_batch(&["x".to_string()]).await.is_err());
    }

    #[test]
    fn test_disabled_embedder_is_none() {
        assert!(create_embedder_from_config(
            false,
            None,
            "text-embedding-3-small",
            Some("sk-real"),
            Duration::from_secs(5)
        )
        .is_none());
    }
}
