//! 编排器：单条消息的完整管线
//!
//! parse → retrieve → generate-with-retry → record turn → 返回回复与元数据。
//! 各组件内部自行降级，降级标记汇总到 ResponseMetadata；只有取消会以错误返回。
//! 取消在检索前、每次生成尝试前、记录轮次前检查；被取消的轮次不写入记忆。
//! 流式版本把生成分片实时发给调用方，只生成一次，不做语音改写。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::core::{AgentError, Degradation, StopReason};
use crate::llm::{LlmClient, Usage};
use crate::memory::{ContextManager, SessionMetadata};
use crate::rag::{BackendStats, ContextScope, Document, RetrievedContext, Retriever};
use crate::reasoning::{
    adapt_for_voice, CandidateResponse, EvaluationScore, LengthGuidance, Parser, RequestType,
    ResponseObjective, RetryOrchestrator, StructuredRequest, Synthesizer,
};

/// 调用方（CLI 前缀等）给出的本轮开关
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOptions {
    pub voice_mode: bool,
    pub resume_mode: bool,
    /// 身份覆盖；写入 entities["identity"]
    pub identity: Option<String>,
}

impl TurnOptions {
    pub fn voice() -> Self {
        Self {
            voice_mode: true,
            ..Default::default()
        }
    }

    pub fn resume() -> Self {
        Self {
            resume_mode: true,
            ..Default::default()
        }
    }
}

/// 管线参数
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub top_k: usize,
    pub max_attempts: usize,
    /// Parser 可见的历史轮数
    pub history_turns: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            max_attempts: 3,
            history_turns: 6,
        }
    }
}

/// 回复元数据
#[derive(Debug, Clone, Serialize)]
pub struct ResponseMetadata {
    pub request_id: String,
    pub intent: String,
    pub request_type: RequestType,
    pub context_scope: ContextScope,
    pub confidence: f32,
    pub context_count: usize,
    pub backend: String,
    pub attempts: usize,
    /// 评估针对的是改写前的候选；voice_optimized 时正文是其朗读版本
    pub evaluation_score: Option<f32>,
    pub voice_optimized: bool,
    pub stop_reason: StopReason,
    pub degradations: Vec<Degradation>,
    /// 返回的是固定致歉回复
    pub error: bool,
    pub provider: Option<String>,
    pub usage: Usage,
    pub elapsed_ms: u64,
}

impl ResponseMetadata {
    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineResponse {
    pub text: String,
    pub request: StructuredRequest,
    pub contexts: Vec<RetrievedContext>,
    pub candidate: CandidateResponse,
    /// 语音改写前那份候选的评估
    pub evaluation: Option<EvaluationScore>,
    pub metadata: ResponseMetadata,
}

pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    parser: Parser,
    retriever: Arc<Retriever>,
    synthesizer: Arc<Synthesizer>,
    retry: RetryOrchestrator,
    memory: ContextManager,
    settings: PipelineSettings,
}

fn note(list: &mut Vec<Degradation>, d: Degradation) {
    if !list.contains(&d) {
        list.push(d);
    }
}

/// 简历模式：强制 professional 范围并把目标改写为简历内容
fn apply_resume_mode(request: &mut StructuredRequest, objective: &mut ResponseObjective) {
    request.request_type = RequestType::ResumeGeneration;
    request.context_scope = ContextScope::Professional;
    objective.primary_goal = "Generate resume content highlighting relevant experience and skills".to_string();
    objective.success_criteria = vec![
        "Highlight concrete achievements and impact".to_string(),
        "Use professional, concise language".to_string(),
        "Stay grounded in the retrieved background".to_string(),
    ];
    objective.audience = "Hiring managers and recruiters".to_string();
    objective.style_preference = "professional".to_string();
    objective.length_guidance = LengthGuidance::Detailed;
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        parser: Parser,
        retriever: Arc<Retriever>,
        synthesizer: Arc<Synthesizer>,
        retry: RetryOrchestrator,
        memory: ContextManager,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            llm,
            parser,
            retriever,
            synthesizer,
            retry,
            memory,
            settings,
        }
    }

    /// 处理一条用户消息
    pub async fn process_message(
        &self,
        input: &str,
        options: TurnOptions,
        cancel: CancellationToken,
    ) -> Result<PipelineResponse, AgentError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("turn", request_id = %request_id);
        self.run_turn(input, options, cancel, request_id, None)
            .instrument(span)
            .await
    }

    /// 流式处理一条用户消息：回复分片经 chunks 推送，返回值与 process_message 相同
    ///
    /// 分片拼接即最终回复正文（首尾空白除外）；chunks 在返回前已全部发出。
    pub async fn process_message_stream(
        &self,
        input: &str,
        options: TurnOptions,
        cancel: CancellationToken,
        chunks: mpsc::UnboundedSender<String>,
    ) -> Result<PipelineResponse, AgentError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("turn", request_id = %request_id, streaming = true);
        self.run_turn(input, options, cancel, request_id, Some(&chunks))
            .instrument(span)
            .await
    }

    async fn run_turn(
        &self,
        input: &str,
        options: TurnOptions,
        cancel: CancellationToken,
        request_id: String,
        chunks: Option<&mpsc::UnboundedSender<String>>,
    ) -> Result<PipelineResponse, AgentError> {
        let started = Instant::now();
        let usage_before = self.llm.token_usage();
        let mut degradations = Vec::new();

        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        // 1. 解析
        let history = self
            .memory
            .get_conversation_context(self.settings.history_turns)
            .await;
        let parsed = self.parser.parse(input, &history, options.voice_mode).await;
        if parsed.fallback {
            note(&mut degradations, Degradation::ParserFallback);
        }
        let mut request = parsed.request;
        let mut objective = parsed.objective;
        if let Some(ref identity) = options.identity {
            request
                .entities
                .insert("identity".to_string(), Value::String(identity.clone()));
        }
        if options.voice_mode {
            request = adapt_for_voice(&request);
        }
        let mut top_k = self.settings.top_k;
        if options.resume_mode {
            apply_resume_mode(&mut request, &mut objective);
            top_k = top_k.saturating_mul(2);
        }
        tracing::info!(
            intent = %request.intent,
            request_type = %request.request_type,
            scope = %request.context_scope,
            confidence = request.confidence,
            "request parsed"
        );

        // 2. 检索
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let retrieval = self
            .retriever
            .retrieve(&request.original_text, request.context_scope, top_k)
            .await;
        for d in &retrieval.degradations {
            note(&mut degradations, *d);
        }
        tracing::debug!(backend = %retrieval.backend, contexts = retrieval.contexts.len(), "contexts retrieved");

        // 3. 生成 + 评估 + 重试
        let memory_context = self.memory.context_for_request(request.request_type.as_str()).await;
        let outcome = match chunks {
            Some(chunks) => {
                self.retry
                    .generate_streamed(
                        &request,
                        &retrieval.contexts,
                        &objective,
                        Some(&memory_context),
                        chunks,
                        &cancel,
                    )
                    .await?
            }
            None => {
                self.retry
                    .generate_with_retry(
                        &request,
                        &retrieval.contexts,
                        &objective,
                        Some(&memory_context),
                        self.settings.max_attempts,
                        &cancel,
                    )
                    .await?
            }
        };
        for d in &outcome.degradations {
            note(&mut degradations, *d);
        }

        let mut candidate = outcome.candidate;
        let mut voice_optimized = false;
        if chunks.is_none() && request.voice_mode && !candidate.voice_friendly && !candidate.is_error() {
            candidate = self.synthesizer.optimize_for_voice(&candidate).await;
            voice_optimized = candidate.voice_friendly;
        }

        // 4. 记录
        if cancel.is_cancelled() {
            tracing::info!("turn cancelled before recording");
            return Err(AgentError::Cancelled);
        }
        let mut turn_metadata = HashMap::new();
        turn_metadata.insert(
            "request_type".to_string(),
            Value::String(request.request_type.to_string()),
        );
        turn_metadata.insert("voice_mode".to_string(), Value::Bool(request.voice_mode));
        turn_metadata.insert("intent".to_string(), Value::String(request.intent.clone()));
        turn_metadata.insert("request_id".to_string(), Value::String(request_id.clone()));
        self.memory
            .add_turn(input, candidate.content.clone(), turn_metadata)
            .await;

        let usage_after = self.llm.token_usage();
        let usage = Usage::new(
            usage_after.0.saturating_sub(usage_before.0),
            usage_after.1.saturating_sub(usage_before.1),
        );
        let evaluation = outcome.evaluation.map(|e| e.into_score());
        let metadata = ResponseMetadata {
            request_id,
            intent: request.intent.clone(),
            request_type: request.request_type,
            context_scope: request.context_scope,
            confidence: candidate.confidence,
            context_count: retrieval.contexts.len(),
            backend: retrieval.backend,
            attempts: outcome.attempts,
            evaluation_score: evaluation.as_ref().map(|e| e.overall_score),
            voice_optimized,
            stop_reason: outcome.stop_reason,
            degradations,
            error: candidate.is_error(),
            provider: candidate
                .generation_metadata
                .get("provider")
                .and_then(Value::as_str)
                .map(String::from),
            usage,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            attempts = metadata.attempts,
            score = ?metadata.evaluation_score,
            degraded = metadata.is_degraded(),
            elapsed_ms = metadata.elapsed_ms,
            "turn complete"
        );

        Ok(PipelineResponse {
            text: candidate.content.clone(),
            request,
            contexts: retrieval.contexts,
            candidate,
            evaluation,
            metadata,
        })
    }

    pub async fn conversation_summary(&self) -> Option<String> {
        self.memory.summary().await
    }

    pub async fn memory_insights(&self) -> serde_json::Map<String, Value> {
        self.memory.long_term_memory().await
    }

    pub async fn session_metadata(&self) -> SessionMetadata {
        self.memory.session_metadata().await
    }

    pub async fn backend_stats(&self) -> BackendStats {
        self.retriever.stats().await
    }

    /// 候选后端链（按优先级）
    pub fn backend_chain(&self) -> Vec<String> {
        self.retriever.available_backends()
    }

    /// 向当前后端追加文档；成功返回 true
    pub async fn add_documents(&self, documents: Vec<Document>) -> bool {
        let count = documents.len();
        let added = self.retriever.add_documents(documents).await;
        tracing::info!(count, added, "documents added to knowledge base");
        added
    }

    /// 等待后台压缩与洞察任务（测试与退出前使用）
    pub async fn wait_for_background(&self) {
        self.memory.wait_for_background().await;
    }

    pub fn memory(&self) -> &ContextManager {
        &self.memory
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }
}
