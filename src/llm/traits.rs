//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Ollama / Mock）实现 LlmClient：complete 接收带角色的消息与生成参数，
//! 返回文本、token 用量与元数据（模型、耗时、结束原因、实际应答的 provider）；
//! complete_stream 返回增量文本流。

use std::pin::Pin;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{stream, Stream};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::Message;

/// LLM 调用错误；任何一种都可由调用方降级处理，不会中断管线
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

/// 单次补全请求
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    /// 可选 system 提示，发送前插到消息最前
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            system_prompt: None,
            temperature: 0.7,
            max_tokens: None,
            stream: false,
        }
    }

    /// 仅含一条 user 消息的请求
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(vec![Message::user(content)])
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// system 提示 + 原消息，供实际发送
    pub fn full_messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if let Some(ref system) = self.system_prompt {
            out.push(Message::system(system.clone()));
        }
        out.extend(self.messages.iter().cloned());
        out
    }
}

/// token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// 无用量信息时按 4 字符约 1 token 估算
    pub fn estimated(completion_text: &str) -> Self {
        Self::new(0, (completion_text.chars().count() / 4) as u64)
    }
}

/// 补全元数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionMetadata {
    pub model: String,
    pub response_time_ms: u64,
    pub finish_reason: String,
    /// 实际应答的 provider（主/备切换后由 FallbackLlmClient 保持真实值）
    pub provider: String,
}

/// 补全结果
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
    pub metadata: CompletionMetadata,
}

/// 增量文本流
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// 流式补全：实际应答的 provider + 文本分片
pub struct CompletionStream {
    pub provider: String,
    pub tokens: TokenStream,
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// provider 名，写入 CompletionMetadata.provider
    fn provider(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;

    /// 流式完成；默认整段补全后作为单个分片返回
    async fn complete_stream(&self, request: &CompletionRequest) -> Result<CompletionStream, LlmError> {
        let completion = self.complete(request).await?;
        Ok(CompletionStream {
            provider: completion.metadata.provider,
            tokens: Box::pin(stream::iter(vec![Ok(completion.text)])),
        })
    }

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 在给定时限内完成一次调用；超时视同 provider 失败（LlmError::Timeout）
pub async fn complete_within(
    llm: &dyn LlmClient,
    request: &CompletionRequest,
    limit: Duration,
) -> Result<Completion, LlmError> {
    let start = Instant::now();
    match tokio::time::timeout(limit, llm.complete(request)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                provider = %llm.provider(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "completion timed out"
            );
            Err(LlmError::Timeout(limit))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::memory::Role;

    #[test]
    fn test_full_messages_prepends_system() {
        let req = CompletionRequest::user("hi").with_system("be nice");
        let msgs = req.full_messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[1].content, "hi");
    }

    #[test]
    fn test_usage_estimated() {
        let usage = Usage::estimated("abcdefgh");
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total_tokens, 2);
    }

    #[tokio::test]
    async fn test_default_stream_yields_whole_completion() {
        use futures_util::StreamExt;

        struct Plain;

        #[async_trait]
        impl LlmClient for Plain {
            fn provider(&self) -> &str {
                "plain"
            }

            async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, LlmError> {
                Ok(Completion {
                    text: "whole answer".to_string(),
                    usage: Usage::default(),
                    metadata: CompletionMetadata {
                        provider: "plain".to_string(),
                        ..Default::default()
                    },
                })
            }
        }

        let streamed = Plain.complete_stream(&CompletionRequest::user("x")).await.unwrap();
        assert_eq!(streamed.provider, "plain");
        let chunks: Vec<_> = streamed.tokens.collect().await;
        assert_eq!(chunks, vec![Ok("whole answer".to_string())]);
    }

    #[tokio::test]
    async fn test_complete_within_times_out() {
        let llm = MockLlmClient::new(|_| Ok("late".to_string()))
            .with_delay(Duration::from_millis(200));
        let result = complete_within(
            &llm,
            &CompletionRequest::user("x"),
            Duration::from_millis(20),
        )
        .await;
        assert!(matches!(result, Err(LlmError::Timeout(_))));
    }
}
