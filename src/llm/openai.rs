//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；OpenAI、Ollama 的 /v1 端点、自建代理均可。
//! stream=true 时走流式接口并在本地拼接增量内容；complete_stream 把增量内容直接交给调用方。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::StreamExt;

use crate::llm::{
    Completion, CompletionMetadata, CompletionRequest, CompletionStream, LlmClient, LlmError, Usage,
};
use crate::memory::{Message, Role};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// HTTP 层单次请求上限；未调用 with_timeout 时使用
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(90);

/// 带整体超时的 reqwest 客户端；构建失败时退回默认客户端
fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "could not build HTTP client with timeout, using default");
            reqwest::Client::new()
        })
}

/// OpenAI 兼容客户端：持有 Client、model 名与 provider 标签
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    provider: String,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
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
            client: Client::with_config(config).with_http_client(http_client(DEFAULT_HTTP_TIMEOUT)),
            model: model.to_string(),
            provider: "openai".to_string(),
            usage: TokenUsage::new(),
        }
    }

    /// 设置 HTTP 请求超时；无响应的端点按超时失败而不是一直挂起
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = self.client.with_http_client(http_client(timeout));
        self
    }

    /// 覆盖 provider 标签（如 "ollama"）
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        messages
            .iter()
            .map(|m| {
                Ok(match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(m.content.clone())
                            .build()?,
                    ),
                    Role::User => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(m.content.clone())
                            .build()?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(m.content.clone())
                            .build()?,
                    ),
                })
            })
            .collect()
    }

    fn build_request(
        &self,
        request: &CompletionRequest,
    ) -> Result<CreateChatCompletionRequest, OpenAIError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(self.to_openai_messages(&request.full_messages())?)
            .temperature(request.temperature);
        if let Some(max) = request.max_tokens {
            args.max_completion_tokens(max);
        }
        args.build()
    }

    async fn complete_once(&self, request: CreateChatCompletionRequest) -> Result<(String, Usage, String), LlmError> {
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(map_openai_error)?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| Usage::new(u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or_default();

        let choice = response
            .choices
            .first()
            .ok_or_else(|| LlmError::InvalidResponse("no choices in response".to_string()))?;
        let finish = choice
            .finish_reason
            .as_ref()
            .map(|r| format!("{:?}", r).to_lowercase())
            .unwrap_or_else(|| "stop".to_string());
        let content = choice.message.content.clone().unwrap_or_default();

        Ok((content, usage, finish))
    }

    async fn complete_streamed(&self, request: CreateChatCompletionRequest) -> Result<(String, Usage, String), LlmError> {
        let mut stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(map_openai_error)?;

        let mut text = String::new();
        let mut usage = None;
        let mut finish = "stop".to_string();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_openai_error)?;
            for choice in &chunk.choices {
                if let Some(ref delta) = choice.delta.content {
                    text.push_str(delta);
                }
                if let Some(ref r) = choice.finish_reason {
                    finish = format!("{:?}", r).to_lowercase();
                }
            }
            if let Some(u) = chunk.usage {
                usage = Some(Usage::new(u.prompt_tokens as u64, u.completion_tokens as u64));
            }
        }
        let usage = usage.unwrap_or_else(|| Usage::estimated(&text));
        Ok((text, usage, finish))
    }
}

fn map_openai_error(e: OpenAIError) -> LlmError {
    match e {
        OpenAIError::Reqwest(err) if err.is_timeout() || err.is_connect() => {
            LlmError::Unavailable(err.to_string())
        }
        OpenAIError::ApiError(api) if api.code.as_deref() == Some("rate_limit_exceeded") => {
            LlmError::RateLimited { retry_after_ms: 1000 }
        }
        OpenAIError::JSONDeserialize(err, _) => LlmError::InvalidResponse(err.to_string()),
        other => LlmError::Api(other.to_string()),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let start = Instant::now();
        let api_request = self
            .build_request(request)
            .map_err(|e| LlmError::Api(e.to_string()))?;

        let (text, usage, finish_reason) = if request.stream {
            self.complete_streamed(api_request).await?
        } else {
            self.complete_once(api_request).await?
        };

        // 提取 token 使用统计
        self.usage.add(usage.prompt_tokens, usage.completion_tokens);

        let response_time_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(
            provider = %self.provider,
            model = %self.model,
            tokens = usage.total_tokens,
            response_time_ms,
            "completion finished"
        );

        Ok(Completion {
            text,
            usage,
            metadata: CompletionMetadata {
                model: self.model.clone(),
                response_time_ms,
                finish_reason,
                provider: self.provider.clone(),
            },
        })
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<CompletionStream, LlmError> {
        let api_request = self
            .build_request(request)
            .map_err(|e| LlmError::Api(e.to_string()))?;
        let stream = self
            .client
            .chat()
            .create_stream(api_request)
            .await
            .map_err(map_openai_error)?;

        // 用量随最后一个分片到达时计入累计统计
        let usage = self.usage.clone();
        let tokens = stream.filter_map(move |chunk| {
            let usage = usage.clone();
            async move {
                match chunk {
                    Err(e) => Some(Err(map_openai_error(e))),
                    Ok(chunk) => {
                        if let Some(u) = chunk.usage {
                            usage.add(u.prompt_tokens as u64, u.completion_tokens as u64);
                        }
                        let text: String = chunk
                            .choices
                            .iter()
                            .filter_map(|c| c.delta.content.as_deref())
                            .collect();
                        (!text.is_empty()).then_some(Ok(text))
                    }
                }
            }
        });
        Ok(CompletionStream {
            provider: self.provider.clone(),
            tokens: Box::pin(tokens),
        })
    }
}
