//! 主/备 provider 装饰器
//!
//! 主 provider 出错（含超时、限流）时，用同一请求透明地重试备用 provider；
//! 返回的 metadata.provider 为实际应答的一方。
//! 主 provider 单独计时：调用方的总时限套在整个装饰器外面，挂起的主 provider 不能耗尽它。
//! 流式调用只在建立流时切换；流开始后的错误交给调用方。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{Completion, CompletionRequest, CompletionStream, LlmClient, LlmError};

/// 调用计数
#[derive(Debug, Default)]
pub struct FallbackStats {
    pub total_requests: AtomicU64,
    pub primary_requests: AtomicU64,
    pub fallback_requests: AtomicU64,
    pub primary_errors: AtomicU64,
    pub errors: AtomicU64,
}

impl FallbackStats {
    /// (total, primary, fallback, primary_errors, errors)
    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.total_requests.load(Ordering::Relaxed),
            self.primary_requests.load(Ordering::Relaxed),
            self.fallback_requests.load(Ordering::Relaxed),
            self.primary_errors.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }
}

pub struct FallbackLlmClient {
    primary: Arc<dyn LlmClient>,
    fallback: Option<Arc<dyn LlmClient>>,
    /// 仅在有备用 provider 时生效
    primary_timeout: Option<Duration>,
    pub stats: FallbackStats,
}

impl FallbackLlmClient {
    pub fn new(primary: Arc<dyn LlmClient>, fallback: Option<Arc<dyn LlmClient>>) -> Self {
        Self {
            primary,
            fallback,
            primary_timeout: None,
            stats: FallbackStats::default(),
        }
    }

    /// 主 provider 超过该时长未应答即视为失败并改用备用
    pub fn with_primary_timeout(mut self, timeout: Duration) -> Self {
        self.primary_timeout = Some(timeout);
        self
    }

    async fn call_primary(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        match (self.primary_timeout, self.fallback.is_some()) {
            (Some(limit), true) => tokio::time::timeout(limit, self.primary.complete(request))
                .await
                .unwrap_or(Err(LlmError::Timeout(limit))),
            _ => self.primary.complete(request).await,
        }
    }

    async fn open_primary_stream(&self, request: &CompletionRequest) -> Result<CompletionStream, LlmError> {
        match (self.primary_timeout, self.fallback.is_some()) {
            (Some(limit), true) => tokio::time::timeout(limit, self.primary.complete_stream(request))
                .await
                .unwrap_or(Err(LlmError::Timeout(limit))),
            _ => self.primary.complete_stream(request).await,
        }
    }
}

#[async_trait]
impl LlmClient for FallbackLlmClient {
    fn provider(&self) -> &str {
        self.primary.provider()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        self.stats.primary_requests.fetch_add(1, Ordering::Relaxed);

        let primary_err = match self.call_primary(request).await {
            Ok(completion) => return Ok(completion),
            Err(e) => e,
        };
        self.stats.primary_errors.fetch_add(1, Ordering::Relaxed);

        let Some(ref fallback) = self.fallback else {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Err(primary_err);
        };

        tracing::warn!(
            primary = %self.primary.provider(),
            fallback = %fallback.provider(),
            error = %primary_err,
            "primary provider failed, retrying on fallback"
        );
        self.stats.fallback_requests.fetch_add(1, Ordering::Relaxed);
        match fallback.complete(request).await {
            Ok(completion) => Ok(completion),
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "fallback provider failed");
                Err(e)
            }
        }
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<CompletionStream, LlmError> {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        self.stats.primary_requests.fetch_add(1, Ordering::Relaxed);

        let primary_err = match self.open_primary_stream(request).await {
            Ok(stream) => return Ok(stream),
            Err(e) => e,
        };
        self.stats.primary_errors.fetch_add(1, Ordering::Relaxed);

        let Some(ref fallback) = self.fallback else {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Err(primary_err);
        };
        tracing::warn!(
            primary = %self.primary.provider(),
            fallback = %fallback.provider(),
            error = %primary_err,
            "primary provider could not open a stream, retrying on fallback"
        );
        self.stats.fallback_requests.fetch_add(1, Ordering::Relaxed);
        fallback.complete_stream(request).await.inspect_err(|e| {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, "fallback provider failed");
        })
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        let (p1, c1, t1) = self.primary.token_usage();
        let (p2, c2, t2) = self
            .fallback
            .as_ref()
            .map(|f| f.token_usage())
            .unwrap_or((0, 0, 0));
        (p1 + p2, c1 + c2, t1 + t2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{complete_within, MockLlmClient};

    #[tokio::test]
    async fn test_primary_success_skips_fallback() {
        let primary = MockLlmClient::new(|_| Ok("from primary".to_string())).with_provider("ollama");
        let backup = MockLlmClient::echo().with_provider("openai");
        let client = FallbackLlmClient::new(Arc::new(primary), Some(Arc::new(backup.clone())));

        let out = client.complete(&CompletionRequest::user("hi")).await.unwrap();
        assert_eq!(out.text, "from primary");
        assert_eq!(out.metadata.provider, "ollama");
        assert_eq!(backup.call_count(), 0);
    }

    #[tokio::test]
    async fn test_primary_failure_uses_fallback_provider() {
        let primary = MockLlmClient::failing().with_provider("ollama");
        let backup = MockLlmClient::echo().with_provider("openai");
        let client = FallbackLlmClient::new(Arc::new(primary), Some(Arc::new(backup)));

        let out = client.complete(&CompletionRequest::user("hi")).await.unwrap();
        assert_eq!(out.metadata.provider, "openai");
        let (total, _, fallback, primary_errors, errors) = client.stats.snapshot();
        assert_eq!((total, fallback, primary_errors, errors), (1, 1, 1, 0));
    }

    #[tokio::test]
    async fn test_no_fallback_propagates_error() {
        let client = FallbackLlmClient::new(Arc::new(MockLlmClient::failing()), None);
        assert!(client.complete(&CompletionRequest::user("hi")).await.is_err());
    }

    #[tokio::test]
    async fn test_hung_primary_times_out_into_fallback() {
        let primary = MockLlmClient::new(|_| Ok("too late".to_string()))
            .with_delay(Duration::from_millis(500))
            .with_provider("ollama");
        let backup = MockLlmClient::echo().with_provider("openai");
        let client = FallbackLlmClient::new(Arc::new(primary), Some(Arc::new(backup.clone())))
            .with_primary_timeout(Duration::from_millis(50));

        // 调用方的总时限大于主 provider 时限，备用仍有时间应答
        let out = complete_within(&client, &CompletionRequest::user("hi"), Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(out.metadata.provider, "openai");
        assert_eq!(backup.call_count(), 1);
        let (_, _, fallback, primary_errors, _) = client.stats.snapshot();
        assert_eq!((fallback, primary_errors), (1, 1));
    }

    #[tokio::test]
    async fn test_stream_switches_to_fallback_before_first_chunk() {
        use futures_util::StreamExt;

        let primary = MockLlmClient::failing().with_provider("ollama");
        let backup = MockLlmClient::new(|_| Ok("streamed from backup".to_string())).with_provider("openai");
        let client = FallbackLlmClient::new(Arc::new(primary), Some(Arc::new(backup)));

        let streamed = client.complete_stream(&CompletionRequest::user("hi")).await.unwrap();
        assert_eq!(streamed.provider, "openai");
        let text: Vec<String> = streamed.tokens.filter_map(|c| async move { c.ok() }).collect().await;
        assert_eq!(text.concat(), "streamed from backup");
        let (_, _, fallback, primary_errors, _) = client.stats.snapshot();
        assert_eq!((fallback, primary_errors), (1, 1));
    }

    #[tokio::test]
    async fn test_primary_timeout_ignored_without_fallback() {
        let primary = MockLlmClient::new(|_| Ok("slow but fine".to_string()))
            .with_delay(Duration::from_millis(80));
        let client = FallbackLlmClient::new(Arc::new(primary), None)
            .with_primary_timeout(Duration::from_millis(10));
        let out = client.complete(&CompletionRequest::user("hi")).await.unwrap();
        assert_eq!(out.text, "slow but fine");
    }
}
