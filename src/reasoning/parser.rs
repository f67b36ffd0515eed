//! Parser：原始输入 → 结构化请求 + 回复目标
//!
//! 先请 LLM 以 JSON 给出意图、类型、范围、实体和置信度；调用失败或输出不可解析时
//! 退回确定性的关键词分类（search / explain / summarize / general），置信度固定为 0.3。
//! 关键词按整词匹配（允许 s/es 复数），"specialist" 不会命中 "list"。

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::llm::{complete_within, CompletionRequest, LlmClient};
use crate::memory::tokenizer::tokenize;
use crate::memory::{entries_to_messages, ContextEntry, Message};
use crate::rag::ContextScope;
use crate::reasoning::json::{clamp_unit, parse_json_output};
use crate::reasoning::types::{LengthGuidance, RequestType, ResponseObjective, StructuredRequest};

/// 关键词分类的固定置信度
pub const FALLBACK_CONFIDENCE: f32 = 0.3;

/// 一组关键词及其惰性编译的整词正则
struct Cues {
    words: &'static [&'static str],
    pattern: OnceLock<Option<Regex>>,
}

impl Cues {
    const fn new(words: &'static [&'static str]) -> Self {
        Self {
            words,
            pattern: OnceLock::new(),
        }
    }

    /// text 需已小写；正则构建失败时退回子串匹配
    fn matches(&self, text: &str) -> bool {
        let pattern = self.pattern.get_or_init(|| {
            let alternatives: Vec<String> = self.words.iter().map(|w| regex::escape(w)).collect();
            Regex::new(&format!(r"\b(?:{})(?:s|es)?\b", alternatives.join("|"))).ok()
        });
        match pattern {
            Some(re) => re.is_match(text),
            None => self.words.iter().any(|w| text.contains(w)),
        }
    }
}

static SEARCH_CUES: Cues = Cues::new(&["find", "search", "look up", "show me", "tell me about", "what are", "list"]);
static EXPLAIN_CUES: Cues = Cues::new(&["explain", "how does", "how do", "what is", "why"]);
static SUMMARIZE_CUES: Cues = Cues::new(&["summarize", "summary", "recap", "overview", "tl;dr"]);
static RESUME_CUES: Cues = Cues::new(&["resume", "cv", "curriculum vitae"]);

static PROFESSIONAL_CUES: Cues = Cues::new(&["work", "project", "resume", "career", "skill"]);
static PERSONAL_CUES: Cues = Cues::new(&["family", "hobby", "hobbies", "personal", "value", "feel"]);
static CREATIVE_CUES: Cues = Cues::new(&["creative", "art", "story", "stories", "music", "poem"]);

/// 语音化时加 "voice_" 前缀的意图桶
const VOICE_BUCKETS: &[&str] = &["search", "explain", "summarize"];

/// 一次解析的结果
#[derive(Debug, Clone)]
pub struct ParsedTurn {
    pub request: StructuredRequest,
    pub objective: ResponseObjective,
    /// 走了关键词分类
    pub fallback: bool,
}

#[derive(Debug, Deserialize)]
struct ParsedPayload {
    intent: String,
    #[serde(default)]
    request_type: Option<String>,
    #[serde(default)]
    context_scope: Option<String>,
    #[serde(default)]
    key_topics: Vec<String>,
    #[serde(default)]
    entities: serde_json::Map<String, Value>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    emotional_tone: Option<String>,
    #[serde(default)]
    response_objective: Option<ObjectivePayload>,
}

#[derive(Debug, Deserialize)]
struct ObjectivePayload {
    #[serde(default)]
    primary_goal: Option<String>,
    #[serde(default)]
    success_criteria: Vec<String>,
    #[serde(default)]
    audience: Option<String>,
    #[serde(default)]
    style_preference: Option<String>,
    #[serde(default)]
    length_guidance: Option<String>,
    #[serde(default)]
    voice_considerations: Option<String>,
}

pub struct Parser {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl Parser {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// 解析一轮输入；history 为 ContextManager 给出的有界上下文
    pub async fn parse(&self, text: &str, history: &[ContextEntry], voice_mode: bool) -> ParsedTurn {
        let mut messages = entries_to_messages(history);
        messages.push(Message::user(text));
        let request = CompletionRequest::new(messages)
            .with_system(system_prompt(voice_mode))
            .with_temperature(0.2)
            .with_max_tokens(500);

        let output = match complete_within(self.llm.as_ref(), &request, self.timeout).await {
            Ok(c) => c.text,
            Err(e) => {
                tracing::warn!(error = %e, "LLM parsing failed, using keyword classifier");
                return fallback_parse(text, voice_mode);
            }
        };
        match parse_json_output::<ParsedPayload>(&output) {
            Ok(payload) if !payload.intent.trim().is_empty() => build(text, payload, voice_mode),
            Ok(_) => {
                tracing::warn!("parser returned an empty intent, using keyword classifier");
                fallback_parse(text, voice_mode)
            }
            Err(e) => {
                tracing::warn!(error = %e, "malformed parser output, using keyword classifier");
                fallback_parse(text, voice_mode)
            }
        }
    }
}

fn system_prompt(voice_mode: bool) -> String {
    let voice = if voice_mode {
        "\nThis is a VOICE interaction: expect conversational phrasing, filler words and possible speech-to-text errors.\n"
    } else {
        ""
    };
    format!(
        "You are an expert at understanding user intent from natural language.{voice}\n\
         Use the earlier conversation only to resolve references in the latest message.\n\
         Reply with a single JSON object:\n\
         {{\"intent\": \"what the user actually wants, in natural language\",\n \
         \"request_type\": \"conversation|resume_generation|explanation|voice_interaction|analysis|creative\",\n \
         \"context_scope\": \"personal|professional|creative|general|all\",\n \
         \"key_topics\": [\"...\"],\n \
         \"entities\": {{\"name\": \"value\"}},\n \
         \"confidence\": <0.0-1.0>,\n \
         \"emotional_tone\": \"conversational|professional|enthusiastic|...\",\n \
         \"response_objective\": {{\"primary_goal\": \"...\", \"success_criteria\": [\"...\"], \"audience\": \"...\", \
         \"style_preference\": \"...\", \"length_guidance\": \"brief|moderate|detailed\", \"voice_considerations\": \"...\"}}}}"
    )
}

fn build(text: &str, payload: ParsedPayload, voice_mode: bool) -> ParsedTurn {
    let mut request_type = payload
        .request_type
        .as_deref()
        .and_then(RequestType::parse)
        .unwrap_or_default();
    if voice_mode && request_type == RequestType::Conversation {
        request_type = RequestType::VoiceInteraction;
    }
    let context_scope = payload
        .context_scope
        .as_deref()
        .and_then(ContextScope::parse)
        .unwrap_or_default();

    let mut request = StructuredRequest::new(text, payload.intent.trim());
    request.request_type = request_type;
    request.context_scope = context_scope;
    request.key_topics = payload.key_topics;
    request.entities = payload.entities;
    request.confidence = clamp_unit(payload.confidence.unwrap_or(0.8));
    request.emotional_tone = payload.emotional_tone.filter(|t| !t.trim().is_empty());
    request.voice_mode = voice_mode;
    request.metadata.insert("parsing_method".into(), "llm".into());

    let mut objective = ResponseObjective::general(voice_mode);
    if let Some(o) = payload.response_objective {
        if let Some(goal) = o.primary_goal.filter(|g| !g.trim().is_empty()) {
            objective.primary_goal = goal;
        }
        if !o.success_criteria.is_empty() {
            objective.success_criteria = o.success_criteria;
        }
        if let Some(audience) = o.audience.filter(|a| !a.trim().is_empty()) {
            objective.audience = audience;
        }
        if let Some(style) = o.style_preference.filter(|s| !s.trim().is_empty()) {
            objective.style_preference = style;
        }
        if let Some(length) = o.length_guidance {
            objective.length_guidance = LengthGuidance::parse_loose(&length);
        }
        if let Some(voice) = o.voice_considerations.filter(|v| !v.trim().is_empty()) {
            objective.voice_considerations = Some(voice);
        }
    }

    ParsedTurn {
        request,
        objective,
        fallback: false,
    }
}

/// 关键词分类得到的意图桶
pub fn intent_bucket(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    if SUMMARIZE_CUES.matches(&lower) {
        "summarize"
    } else if EXPLAIN_CUES.matches(&lower) {
        "explain"
    } else if SEARCH_CUES.matches(&lower) {
        "search"
    } else {
        "general"
    }
}

fn scope_from_keywords(lower: &str) -> ContextScope {
    if PROFESSIONAL_CUES.matches(lower) {
        ContextScope::Professional
    } else if PERSONAL_CUES.matches(lower) {
        ContextScope::Personal
    } else if CREATIVE_CUES.matches(lower) {
        ContextScope::Creative
    } else {
        ContextScope::General
    }
}

/// 确定性关键词分类
pub fn fallback_parse(text: &str, voice_mode: bool) -> ParsedTurn {
    let lower = text.trim().to_lowercase();
    let bucket = intent_bucket(&lower);
    let resume = RESUME_CUES.matches(&lower);

    let request_type = if resume {
        RequestType::ResumeGeneration
    } else if bucket == "explain" {
        RequestType::Explanation
    } else if voice_mode {
        RequestType::VoiceInteraction
    } else {
        RequestType::Conversation
    };
    let context_scope = if resume {
        ContextScope::Professional
    } else {
        scope_from_keywords(&lower)
    };

    let head: String = lower.chars().take(50).collect();
    let mut request = StructuredRequest::new(text, format!("{}: {}", bucket, head));
    request.request_type = request_type;
    request.context_scope = context_scope;
    request.key_topics = tokenize(&lower)
        .into_iter()
        .filter(|t| t.chars().count() > 3)
        .take(5)
        .collect();
    request.confidence = FALLBACK_CONFIDENCE;
    request.emotional_tone = Some("conversational".to_string());
    request.voice_mode = voice_mode;
    request.metadata.insert("parsing_method".into(), "fallback".into());

    ParsedTurn {
        request,
        objective: ResponseObjective::general(voice_mode),
        fallback: true,
    }
}

/// 语音化副本：标记 voice_mode，并为 search / explain / summarize 意图加 "voice_" 前缀
pub fn adapt_for_voice(request: &StructuredRequest) -> StructuredRequest {
    let mut adapted = request.clone();
    adapted.voice_mode = true;
    if let Some(bucket) = VOICE_BUCKETS
        .iter()
        .find(|b| adapted.intent.starts_with(**b))
    {
        adapted.intent = format!("voice_{}{}", bucket, &adapted.intent[bucket.len()..]);
    }
    if adapted.emotional_tone.is_none() {
        adapted.emotional_tone = Some("conversational".to_string());
    }
    adapted
        .metadata
        .insert("original_voice_mode".into(), request.voice_mode.to_string());
    adapted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient};
    use crate::memory::ConversationTurn;
    use std::collections::HashMap;

    fn parser(llm: MockLlmClient) -> Parser {
        Parser::new(Arc::new(llm), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_llm_output_is_used() {
        let llm = MockLlmClient::new(|_| {
            Ok(r#"```json
{"intent": "learn about the user's Rust projects", "request_type": "conversation",
 "context_scope": "professional", "key_topics": ["rust", "projects"], "confidence": 0.92,
 "entities": {"language": "rust"},
 "response_objective": {"primary_goal": "Describe projects", "success_criteria": ["Name at least one project"],
  "audience": "recruiter", "style_preference": "professional", "length_guidance": "detailed"}}
```"#
                .to_string())
        });
        let parsed = parser(llm).parse("Tell me about your Rust projects", &[], false).await;

        assert!(!parsed.fallback);
        assert!(parsed.request.intent.contains("project"));
        assert_eq!(parsed.request.context_scope, ContextScope::Professional);
        assert_eq!(parsed.request.confidence, 0.92);
        assert_eq!(parsed.request.entities["language"], "rust");
        assert_eq!(parsed.objective.length_guidance, LengthGuidance::Detailed);
        assert_eq!(parsed.objective.audience, "recruiter");
    }

    #[tokio::test]
    async fn test_provider_failure_uses_keyword_classifier() {
        let parsed = parser(MockLlmClient::failing())
            .parse("Tell me about your projects", &[], false)
            .await;
        assert!(parsed.fallback);
        assert_eq!(parsed.request.confidence, FALLBACK_CONFIDENCE);
        assert!(parsed.request.intent.starts_with("search: "));
        assert!(parsed.request.intent.contains("project"));
        assert_eq!(parsed.request.context_scope, ContextScope::Professional);
    }

    #[tokio::test]
    async fn test_malformed_output_uses_keyword_classifier() {
        let parsed = parser(MockLlmClient::new(|_| Ok("I think they want to chat".into())))
            .parse("why is the sky blue", &[], false)
            .await;
        assert!(parsed.fallback);
        assert_eq!(parsed.request.request_type, RequestType::Explanation);
        assert!(parsed.request.intent.starts_with("explain: "));
    }

    #[tokio::test]
    async fn test_timeout_uses_keyword_classifier() {
        let slow = MockLlmClient::new(|_| Err(LlmError::Api("unused".into())))
            .with_delay(Duration::from_millis(200));
        let parsed = Parser::new(Arc::new(slow), Duration::from_millis(20))
            .parse("summarize our chat", &[], false)
            .await;
        assert!(parsed.fallback);
        assert!(parsed.request.intent.starts_with("summarize: "));
    }

    #[tokio::test]
    async fn test_history_is_sent_before_input() {
        let llm = MockLlmClient::failing();
        let history = vec![
            ContextEntry::Summary("talked about rust".into()),
            ContextEntry::Turn(ConversationTurn::new("hi", "hello", HashMap::new())),
        ];
        parser(llm.clone()).parse("and then?", &history, false).await;
        let sent = &llm.requests()[0].messages;
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[3].content, "and then?");
    }

    #[test]
    fn test_buckets() {
        assert_eq!(intent_bucket("Can you find my notes"), "search");
        assert_eq!(intent_bucket("How does borrowing work?"), "explain");
        assert_eq!(intent_bucket("give me a recap"), "summarize");
        assert_eq!(intent_bucket("hello there"), "general");
    }

    #[test]
    fn test_cues_match_whole_words() {
        assert_eq!(intent_bucket("I am a specialist"), "general");
        assert_eq!(intent_bucket("list my talks"), "search");
        assert_eq!(intent_bucket("tl;dr please"), "summarize");

        let network = fallback_parse("my home network setup", false);
        assert_eq!(network.request.context_scope, ContextScope::General);
        let heart = fallback_parse("with all my heart", false);
        assert_eq!(heart.request.context_scope, ContextScope::General);
        let projects = fallback_parse("my side projects", false);
        assert_eq!(projects.request.context_scope, ContextScope::Professional);
        let hobbies = fallback_parse("my hobbies", false);
        assert_eq!(hobbies.request.context_scope, ContextScope::Personal);
    }

    #[test]
    fn test_fallback_resume_and_voice() {
        let resume = fallback_parse("Update my resume please", false);
        assert_eq!(resume.request.request_type, RequestType::ResumeGeneration);
        assert_eq!(resume.request.context_scope, ContextScope::Professional);

        let voice = fallback_parse("hello there", true);
        assert_eq!(voice.request.request_type, RequestType::VoiceInteraction);
        assert!(voice.objective.voice_considerations.is_some());
    }

    #[test]
    fn test_adapt_for_voice_is_pure() {
        let original = fallback_parse("search for my talks", false).request;
        let adapted = adapt_for_voice(&original);
        assert!(adapted.voice_mode);
        assert!(adapted.intent.starts_with("voice_search: "));
        assert!(!original.voice_mode);
        assert!(original.intent.starts_with("search: "));

        let general = adapt_for_voice(&fallback_parse("hello", false).request);
        assert!(general.intent.starts_with("general: "));
    }
}
