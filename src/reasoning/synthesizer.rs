//! Synthesizer：按目标与检索上下文生成一份候选回复
//!
//! 系统提示由目标（风格、篇幅、避免项、已追加的改进标准）、检索上下文、摘要与长期记忆拼成；
//! 用户消息即原始输入。生成失败不向外抛错，而是返回置信度 0 的固定致歉回复。
//! 流式生成要求纯文本输出，分片边到边转发。

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::llm::{complete_within, Completion, CompletionRequest, LlmClient, LlmError};
use crate::memory::{entries_to_messages, ContextEntry, Message, RequestContext};
use crate::rag::RetrievedContext;
use crate::reasoning::json::{clamp_unit, parse_json_output};
use crate::reasoning::types::{CandidateResponse, RequestType, ResponseObjective, StructuredRequest};

/// 非 JSON 输出直接作为正文时的置信度
const DIRECT_CONFIDENCE: f32 = 0.7;

const JSON_REPLY_FORMAT: &str = "\n\nReply with a JSON object: {\"content\": \"the response\", \"confidence\": <0.0-1.0>, \
     \"reasoning\": \"how it meets the objective\", \"voice_friendly\": <true|false>}";

const PLAIN_REPLY_FORMAT: &str = "\n\nReply with the response text only, no JSON and no preamble.";

#[derive(Debug, Deserialize)]
struct GeneratedPayload {
    content: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    voice_friendly: Option<bool>,
}

pub struct Synthesizer {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
    temperature: f32,
    persona: String,
}

impl Synthesizer {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self {
            llm,
            timeout,
            temperature: 0.7,
            persona: "an intelligent, conversational AI assistant".to_string(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// 助手身份描述；请求里的 identity 实体优先
    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    /// 生成一份候选；memory 为可选的对话/长期记忆上下文
    pub async fn generate(
        &self,
        request: &StructuredRequest,
        contexts: &[RetrievedContext],
        objective: &ResponseObjective,
        memory: Option<&RequestContext>,
    ) -> CandidateResponse {
        let completion_request = self.completion_request(request, contexts, objective, memory, JSON_REPLY_FORMAT);
        match complete_within(self.llm.as_ref(), &completion_request, self.timeout).await {
            Ok(completion) if !completion.text.trim().is_empty() => candidate_from(request, completion),
            Ok(_) => {
                tracing::warn!("synthesizer received an empty completion");
                error_candidate(request, "empty completion")
            }
            Err(e) => {
                tracing::warn!(error = %e, "response generation failed, returning fallback reply");
                error_candidate(request, &e.to_string())
            }
        }
    }

    /// 流式生成：每个分片立即发到 chunks，结束后拼成候选
    ///
    /// 出字前失败时返回致歉回复，并把它作为唯一分片发出；出字后中断则保留已收到的部分。
    /// 因此 chunks 拼接结果总与候选正文一致（首尾空白除外）。
    pub async fn generate_streaming(
        &self,
        request: &StructuredRequest,
        contexts: &[RetrievedContext],
        objective: &ResponseObjective,
        memory: Option<&RequestContext>,
        chunks: &mpsc::UnboundedSender<String>,
    ) -> CandidateResponse {
        let completion_request = self
            .completion_request(request, contexts, objective, memory, PLAIN_REPLY_FORMAT)
            .streaming();
        let started = Instant::now();
        let mut text = String::new();
        let mut provider = self.llm.provider().to_string();
        let outcome = tokio::time::timeout(
            self.timeout,
            self.pump(&completion_request, chunks, &mut text, &mut provider),
        )
        .await
        .unwrap_or(Err(LlmError::Timeout(self.timeout)));

        match outcome {
            Ok(()) if !text.trim().is_empty() => {}
            Ok(()) => return self.streamed_error(request, "empty completion", chunks),
            Err(e) if text.trim().is_empty() => {
                tracing::warn!(error = %e, "streamed generation failed, returning fallback reply");
                return self.streamed_error(request, &e.to_string(), chunks);
            }
            Err(e) => tracing::warn!(error = %e, "stream interrupted, keeping partial reply"),
        }

        let mut metadata = base_metadata(request);
        metadata.insert("provider".into(), Value::String(provider));
        metadata.insert("generation_method".into(), Value::String("streamed".into()));
        metadata.insert(
            "response_time_ms".into(),
            Value::from(started.elapsed().as_millis() as u64),
        );
        let mut candidate = CandidateResponse::new(text.trim(), DIRECT_CONFIDENCE);
        candidate.reasoning = "Streamed model reply".to_string();
        candidate.voice_friendly = request.voice_mode;
        candidate.generation_metadata = metadata;
        candidate
    }

    async fn pump(
        &self,
        request: &CompletionRequest,
        chunks: &mpsc::UnboundedSender<String>,
        text: &mut String,
        provider: &mut String,
    ) -> Result<(), LlmError> {
        let streamed = self.llm.complete_stream(request).await?;
        *provider = streamed.provider;
        let mut tokens = streamed.tokens;
        while let Some(piece) = tokens.next().await {
            let piece = piece?;
            text.push_str(&piece);
            // 接收端已关闭时继续收完，候选仍要记入记忆
            let _ = chunks.send(piece);
        }
        Ok(())
    }

    fn streamed_error(
        &self,
        request: &StructuredRequest,
        error: &str,
        chunks: &mpsc::UnboundedSender<String>,
    ) -> CandidateResponse {
        let candidate = error_candidate(request, error);
        let _ = chunks.send(candidate.content.clone());
        candidate
    }

    fn completion_request(
        &self,
        request: &StructuredRequest,
        contexts: &[RetrievedContext],
        objective: &ResponseObjective,
        memory: Option<&RequestContext>,
        reply_format: &str,
    ) -> CompletionRequest {
        let mut system = self.system_prompt(request, contexts, objective, memory);
        system.push_str(reply_format);
        let mut messages: Vec<Message> = memory
            .map(|m| entries_to_messages(&m.conversation))
            .unwrap_or_default();
        messages.push(Message::user(request.original_text.clone()));

        let budget = objective.length_guidance.token_budget(request.voice_mode);
        CompletionRequest::new(messages)
            .with_system(system)
            .with_temperature(self.temperature)
            .with_max_tokens(budget)
    }

    /// 改写为适合朗读的版本；已是语音友好或改写失败时原样返回
    pub async fn optimize_for_voice(&self, candidate: &CandidateResponse) -> CandidateResponse {
        if candidate.voice_friendly || candidate.is_error() {
            return candidate.clone();
        }
        let prompt = format!(
            "Rewrite this response for speech. Use short conversational sentences, drop formatting \
             and punctuation that is awkward to say aloud, and keep the meaning.\n\n\
             ORIGINAL RESPONSE:\n{}\n\nVOICE-OPTIMIZED RESPONSE:",
            candidate.content
        );
        let request = CompletionRequest::user(prompt)
            .with_temperature(0.7)
            .with_max_tokens(600);
        match complete_within(self.llm.as_ref(), &request, self.timeout).await {
            Ok(c) if !c.text.trim().is_empty() => {
                let mut optimized = CandidateResponse::new(c.text.trim(), candidate.confidence * 0.95);
                optimized.reasoning = format!("Voice-optimized version: {}", candidate.reasoning);
                optimized.voice_friendly = true;
                optimized.generation_metadata = candidate.generation_metadata.clone();
                optimized
                    .generation_metadata
                    .insert("voice_optimized".into(), Value::Bool(true));
                optimized
            }
            Ok(_) => candidate.clone(),
            Err(e) => {
                tracing::warn!(error = %e, "voice optimization failed, keeping original");
                candidate.clone()
            }
        }
    }

    fn system_prompt(
        &self,
        request: &StructuredRequest,
        contexts: &[RetrievedContext],
        objective: &ResponseObjective,
        memory: Option<&RequestContext>,
    ) -> String {
        let mut p = match request.identity() {
            Some(name) => format!("You are {}. Speak in the first person as {}.", name, name),
            None => format!("You are {}.", self.persona),
        };
        p.push_str(" Be natural, helpful and honest about what you know.");

        if request.voice_mode {
            p.push_str(
                "\n\nVOICE MODE: the reply will be spoken aloud. Keep it easy to listen to, \
                 conversational, and free of lists or markup.",
            );
        }
        match request.request_type {
            RequestType::ResumeGeneration => p.push_str(
                "\n\nRESUME FOCUS: highlight relevant experience and skills, use professional language, \
                 emphasise achievements and impact.",
            ),
            RequestType::Explanation => p.push_str(
                "\n\nEXPLANATION FOCUS: break concepts down step by step and use examples where they help.",
            ),
            _ => {}
        }
        if let Some(ref tone) = request.emotional_tone {
            p.push_str(&format!("\n\nTONE: {}", tone));
        }

        p.push_str(&format!("\n\nUSER INTENT: {}", request.intent));
        p.push_str(&format!("\n\nRESPONSE OBJECTIVE: {}", objective.primary_goal));
        if !objective.success_criteria.is_empty() {
            p.push_str("\nSUCCESS CRITERIA:");
            for c in &objective.success_criteria {
                p.push_str(&format!("\n- {}", c));
            }
        }
        p.push_str(&format!(
            "\nAUDIENCE: {}\nSTYLE: {}\nLENGTH: {}",
            objective.audience,
            objective.style_preference,
            objective.length_guidance.as_str()
        ));
        if !objective.avoid_patterns.is_empty() {
            p.push_str(&format!("\nAVOID: {}", objective.avoid_patterns.join("; ")));
        }
        if let Some(ref voice) = objective.voice_considerations {
            p.push_str(&format!("\nVOICE CONSIDERATIONS: {}", voice));
        }

        p.push_str("\n\n");
        p.push_str(&format_contexts(contexts));

        if let Some(memory) = memory {
            let summary_in_history = memory
                .conversation
                .iter()
                .any(|e| matches!(e, ContextEntry::Summary(_)));
            if let (Some(summary), false) = (&memory.summary, summary_in_history) {
                p.push_str("\n\nEARLIER CONVERSATION (summary): ");
                p.push_str(summary);
            }
            let insights: Vec<String> = memory
                .relevant_memory
                .iter()
                .filter(|(_, v)| !is_empty_value(v))
                .map(|(k, v)| format!("- {}: {}", k, v))
                .collect();
            if !insights.is_empty() {
                p.push_str("\n\nWHAT YOU REMEMBER ABOUT THE USER:\n");
                p.push_str(&insights.join("\n"));
            }
        }
        p
    }
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn format_contexts(contexts: &[RetrievedContext]) -> String {
    if contexts.is_empty() {
        return "No specific context available.".to_string();
    }
    let mut out = String::from("RELEVANT CONTEXT:");
    for (i, c) in contexts.iter().enumerate() {
        out.push_str(&format!("\n{}. {}", i + 1, c.content));
        if !c.relevance_reasoning.is_empty() {
            out.push_str(&format!(" (relevant because: {})", c.relevance_reasoning));
        }
    }
    out
}

fn base_metadata(request: &StructuredRequest) -> std::collections::HashMap<String, Value> {
    let mut m = std::collections::HashMap::new();
    m.insert("request_type".into(), Value::String(request.request_type.to_string()));
    m.insert("context_scope".into(), Value::String(request.context_scope.to_string()));
    m.insert("voice_mode".into(), Value::Bool(request.voice_mode));
    m
}

fn candidate_from(request: &StructuredRequest, completion: Completion) -> CandidateResponse {
    let mut metadata = base_metadata(request);
    metadata.insert("provider".into(), Value::String(completion.metadata.provider.clone()));
    metadata.insert("model".into(), Value::String(completion.metadata.model.clone()));
    metadata.insert("response_time_ms".into(), Value::from(completion.metadata.response_time_ms));
    metadata.insert(
        "usage".into(),
        serde_json::to_value(completion.usage).unwrap_or(Value::Null),
    );

    let mut candidate = match parse_json_output::<GeneratedPayload>(&completion.text) {
        Ok(payload) if !payload.content.trim().is_empty() => {
            metadata.insert("generation_method".into(), Value::String("structured".into()));
            let mut c = CandidateResponse::new(payload.content.trim(), payload.confidence.unwrap_or(0.8));
            c.reasoning = payload
                .reasoning
                .unwrap_or_else(|| "Generated from the response objective".to_string());
            c.voice_friendly = payload.voice_friendly.unwrap_or(request.voice_mode);
            c
        }
        _ => {
            metadata.insert("generation_method".into(), Value::String("direct".into()));
            let mut c = CandidateResponse::new(completion.text.trim(), DIRECT_CONFIDENCE);
            c.reasoning = "Direct model reply without structured metadata".to_string();
            c.voice_friendly = request.voice_mode;
            c
        }
    };
    candidate.confidence = clamp_unit(candidate.confidence);
    candidate.generation_metadata = metadata;
    candidate
}

/// 固定致歉回复，置信度 0，metadata.error = true
pub fn error_candidate(request: &StructuredRequest, error: &str) -> CandidateResponse {
    let content = match request.request_type {
        RequestType::ResumeGeneration => {
            "I'd be happy to help with your resume, but I ran into a problem just now. \
             Could you tell me a bit about the role you're targeting and try again?"
        }
        RequestType::Explanation => {
            "Sorry, I couldn't put that explanation together just now. \
             Could you ask again, maybe with a bit more detail?"
        }
        _ => "Sorry, I'm having trouble answering right now. Could you try again in a moment?",
    };
    let mut candidate = CandidateResponse::new(content, 0.0);
    candidate.reasoning = format!("Error fallback due to: {}", error);
    candidate.voice_friendly = request.voice_mode;
    candidate.generation_metadata = base_metadata(request);
    candidate
        .generation_metadata
        .insert("generation_method".into(), Value::String("error_fallback".into()));
    candidate.generation_metadata.insert("error".into(), Value::Bool(true));
    candidate
        .generation_metadata
        .insert("error_message".into(), Value::String(error.to_string()));
    candidate
}
