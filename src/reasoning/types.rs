//! 推理管线数据类型：结构化请求、回复目标、候选回复、评估结果

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::Degradation;
use crate::rag::ContextScope;
use crate::reasoning::json::clamp_unit;

/// 请求类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    #[default]
    Conversation,
    ResumeGeneration,
    Explanation,
    VoiceInteraction,
    Analysis,
    Creative,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Conversation => "conversation",
            RequestType::ResumeGeneration => "resume_generation",
            RequestType::Explanation => "explanation",
            RequestType::VoiceInteraction => "voice_interaction",
            RequestType::Analysis => "analysis",
            RequestType::Creative => "creative",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "conversation" => Some(RequestType::Conversation),
            "resume_generation" | "resume" => Some(RequestType::ResumeGeneration),
            "explanation" => Some(RequestType::Explanation),
            "voice_interaction" => Some(RequestType::VoiceInteraction),
            "analysis" => Some(RequestType::Analysis),
            "creative" => Some(RequestType::Creative),
            _ => None,
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parser 的产物；每轮一份，之后只读（adapt_for_voice 返回新副本）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredRequest {
    pub original_text: String,
    pub intent: String,
    pub request_type: RequestType,
    pub context_scope: ContextScope,
    #[serde(default)]
    pub key_topics: Vec<String>,
    #[serde(default)]
    pub entities: serde_json::Map<String, Value>,
    pub confidence: f32,
    #[serde(default)]
    pub emotional_tone: Option<String>,
    #[serde(default)]
    pub voice_mode: bool,
    /// 解析方式等附加信息（"parsing_method": "llm" | "fallback"）
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl StructuredRequest {
    pub fn new(original_text: impl Into<String>, intent: impl Into<String>) -> Self {
        Self {
            original_text: original_text.into(),
            intent: intent.into(),
            request_type: RequestType::Conversation,
            context_scope: ContextScope::General,
            key_topics: Vec::new(),
            entities: serde_json::Map::new(),
            confidence: 0.5,
            emotional_tone: None,
            voice_mode: false,
            metadata: HashMap::new(),
        }
    }

    /// 身份覆盖（/as <name>）
    pub fn identity(&self) -> Option<&str> {
        self.entities.get("identity").and_then(Value::as_str)
    }
}

/// 篇幅指引
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthGuidance {
    Brief,
    #[default]
    Moderate,
    Detailed,
}

impl LengthGuidance {
    /// 宽松解析模型给出的描述（"concise", "comprehensive" 之类）
    pub fn parse_loose(s: &str) -> Self {
        let s = s.to_lowercase();
        if ["brief", "short", "concise", "quick"].iter().any(|k| s.contains(k)) {
            LengthGuidance::Brief
        } else if ["detailed", "comprehensive", "thorough", "in-depth", "long"]
            .iter()
            .any(|k| s.contains(k))
        {
            LengthGuidance::Detailed
        } else {
            LengthGuidance::Moderate
        }
    }

    /// 生成 token 上限；语音模式更低
    pub fn token_budget(&self, voice_mode: bool) -> u32 {
        let budget = match self {
            LengthGuidance::Brief => 150,
            LengthGuidance::Moderate => 300,
            LengthGuidance::Detailed => 600,
        };
        if voice_mode {
            budget.min(200)
        } else {
            budget
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LengthGuidance::Brief => "brief",
            LengthGuidance::Moderate => "moderate",
            LengthGuidance::Detailed => "detailed",
        }
    }
}

/// 回复目标。重试时只追加 success_criteria / avoid_patterns，其余字段原样沿用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseObjective {
    pub primary_goal: String,
    pub success_criteria: Vec<String>,
    pub audience: String,
    pub style_preference: String,
    pub length_guidance: LengthGuidance,
    #[serde(default)]
    pub avoid_patterns: Vec<String>,
    #[serde(default)]
    pub voice_considerations: Option<String>,
}

impl ResponseObjective {
    /// 解析失败时使用的通用目标
    pub fn general(voice_mode: bool) -> Self {
        Self {
            primary_goal: "Provide helpful response to user query".to_string(),
            success_criteria: vec![
                "Answer the user's question".to_string(),
                "Be conversational and helpful".to_string(),
            ],
            audience: "The user".to_string(),
            style_preference: "conversational".to_string(),
            length_guidance: LengthGuidance::Moderate,
            avoid_patterns: Vec::new(),
            voice_considerations: voice_mode.then(|| "Keep response natural for speech".to_string()),
        }
    }
}

/// 一次生成的候选回复；只会被后续候选取代，不会被修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateResponse {
    pub content: String,
    pub confidence: f32,
    pub reasoning: String,
    pub voice_friendly: bool,
    #[serde(default)]
    pub generation_metadata: HashMap<String, Value>,
}

impl CandidateResponse {
    pub fn new(content: impl Into<String>, confidence: f32) -> Self {
        Self {
            content: content.into(),
            confidence: clamp_unit(confidence),
            reasoning: String::new(),
            voice_friendly: false,
            generation_metadata: HashMap::new(),
        }
    }

    /// 生成失败时的占位回复
    pub fn is_error(&self) -> bool {
        self.generation_metadata
            .get("error")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// 对一份候选回复的评估
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationScore {
    pub overall_score: f32,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default = "default_true")]
    pub meets_objective: bool,
    #[serde(default = "default_true")]
    pub voice_mode_appropriate: bool,
    #[serde(default)]
    pub retry_recommended: bool,
    #[serde(default)]
    pub retry_guidance: Option<String>,
}

fn default_true() -> bool {
    true
}

impl EvaluationScore {
    /// 不要求重试的中性评分
    pub fn neutral(score: f32, reasoning: impl Into<String>, voice_appropriate: bool) -> Self {
        Self {
            overall_score: clamp_unit(score),
            reasoning: reasoning.into(),
            strengths: Vec::new(),
            improvements: Vec::new(),
            meets_objective: true,
            voice_mode_appropriate: voice_appropriate,
            retry_recommended: false,
            retry_guidance: None,
        }
    }
}

/// 评估结果：模型给出的评判，或评估本身失败后的兜底评分
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Judged(EvaluationScore),
    Fallback {
        score: EvaluationScore,
        reason: Degradation,
    },
}

impl Evaluation {
    pub fn score(&self) -> &EvaluationScore {
        match self {
            Evaluation::Judged(s) => s,
            Evaluation::Fallback { score, .. } => score,
        }
    }

    pub fn into_score(self) -> EvaluationScore {
        match self {
            Evaluation::Judged(s) => s,
            Evaluation::Fallback { score, .. } => score,
        }
    }

    pub fn overall(&self) -> f32 {
        self.score().overall_score
    }

    pub fn degradation(&self) -> Option<Degradation> {
        match self {
            Evaluation::Judged(_) => None,
            Evaluation::Fallback { reason, .. } => Some(*reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_guidance_budget() {
        assert_eq!(LengthGuidance::Brief.token_budget(false), 150);
        assert_eq!(LengthGuidance::Detailed.token_budget(false), 600);
        assert_eq!(LengthGuidance::Detailed.token_budget(true), 200);
        assert_eq!(LengthGuidance::Brief.token_budget(true), 150);
    }

    #[test]
    fn test_length_guidance_parse_loose() {
        assert_eq!(LengthGuidance::parse_loose("Concise, 2-3 sentences"), LengthGuidance::Brief);
        assert_eq!(LengthGuidance::parse_loose("comprehensive"), LengthGuidance::Detailed);
        assert_eq!(LengthGuidance::parse_loose("appropriate to question"), LengthGuidance::Moderate);
    }

    #[test]
    fn test_evaluation_score_defaults() {
        let s: EvaluationScore = serde_json::from_str(r#"{"overall_score": 0.8}"#).unwrap();
        assert!(s.meets_objective);
        assert!(!s.retry_recommended);
        assert!(s.improvements.is_empty());
    }

    #[test]
    fn test_request_type_roundtrip_names() {
        assert_eq!(RequestType::parse("resume_generation"), Some(RequestType::ResumeGeneration));
        assert_eq!(RequestType::ResumeGeneration.to_string(), "resume_generation");
        assert_eq!(RequestType::parse("nonsense"), None);
    }

    #[test]
    fn test_identity_entity() {
        let mut req = StructuredRequest::new("hi", "greet");
        assert_eq!(req.identity(), None);
        req.entities.insert("identity".into(), Value::String("Ada".into()));
        assert_eq!(req.identity(), Some("Ada"));
    }
}
