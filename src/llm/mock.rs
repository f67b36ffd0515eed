//! Mock LLM / 嵌入客户端（用于测试与无 API 运行）
//!
//! MockLlmClient 由闭包决定每次调用的返回；echo() 回显最后一条 User 消息，便于本地跑通整条管线。
//! 流式调用把同一返回按词切成多个分片。
//! MockEmbedder 以哈希词袋生成确定性向量，语义相近（共享词）的文本余弦相似度更高。

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{
    Completion, CompletionMetadata, CompletionRequest, CompletionStream, EmbeddingProvider,
    LlmClient, LlmError, Usage,
};
use crate::memory::Role;

type Responder = dyn Fn(&CompletionRequest) -> Result<String, LlmError> + Send + Sync;

/// 脚本化 Mock 客户端
#[derive(Clone)]
pub struct MockLlmClient {
    responder: Arc<Responder>,
    delay: Option<Duration>,
    provider: String,
    calls: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl MockLlmClient {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            delay: None,
            provider: "mock".to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 回显最后一条 User 消息
    pub fn echo() -> Self {
        Self::new(|req| {
            let last_user = req
                .messages
                .iter()
                .rev()
                .find(|m| matches!(m.role, Role::User))
                .map(|m| m.content.as_str())
                .unwrap_or("(no input)");
            Ok(format!("Echo from Mock: {}", last_user))
        })
    }

    /// 每次调用都失败
    pub fn failing() -> Self {
        Self::new(|_| Err(LlmError::Unavailable("mock provider down".to_string())))
    }

    /// 每次调用前等待，用于超时测试
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 已收到的请求副本（按调用顺序）
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for MockLlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLlmClient")
            .field("provider", &self.provider)
            .field("calls", &self.call_count())
            .finish()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut log) = self.requests.lock() {
            log.push(request.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let text = (self.responder)(request)?;
        let prompt_chars: usize = request
            .full_messages()
            .iter()
            .map(|m| m.content.chars().count())
            .sum();
        let usage = Usage::new((prompt_chars / 4) as u64, (text.chars().count() / 4) as u64);
        Ok(Completion {
            text,
            usage,
            metadata: CompletionMetadata {
                model: "mock".to_string(),
                response_time_ms: self.delay.map(|d| d.as_millis() as u64).unwrap_or(0),
                finish_reason: "stop".to_string(),
                provider: self.provider.clone(),
            },
        })
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<CompletionStream, LlmError> {
        let completion = self.complete(request).await?;
        let chunks: Vec<Result<String, LlmError>> = completion
            .text
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(CompletionStream {
            provider: completion.metadata.provider,
            tokens: Box::pin(stream::iter(chunks)),
        })
    }
}

/// 确定性嵌入：小写分词后哈希到固定维度，再做 L2 归一化
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    dims: usize,
    fail: bool,
}

impl MockEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            fail: false,
        }
    }

    /// 所有调用都返回错误，模拟无嵌入能力
    pub fn failing() -> Self {
        Self { dims: 1, fail: true }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            let idx = (hasher.finish() % self.dims as u64) as usize;
            v[idx] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        if self.fail {
            return Err(LlmError::Unavailable("mock embedder down".to_string()));
        }
        Ok(self.vectorize(text))
    }
}
