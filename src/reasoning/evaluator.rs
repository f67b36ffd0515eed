//! Evaluator：对候选回复做一次结构化评判，并决定是否重试
//!
//! 评判输出不可解析时用启发式（候选置信度，篇幅与指引不符打八折）；评估调用本身失败时给中性分。
//! 两种兜底都不建议重试：不能因为评估失败而重新生成。

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::core::Degradation;
use crate::llm::{complete_within, CompletionRequest, LlmClient};
use crate::reasoning::json::{clamp_unit, parse_json_output};
use crate::reasoning::types::{
    CandidateResponse, Evaluation, EvaluationScore, LengthGuidance, ResponseObjective,
};

/// 低于该分数即重试
pub const RETRY_SCORE_THRESHOLD: f32 = 0.4;
/// 评估失败时的中性分
pub const NEUTRAL_SCORE: f32 = 0.5;
/// 篇幅不符时的折扣
const LENGTH_PENALTY: f32 = 0.8;

#[derive(Debug, Deserialize)]
struct JudgedPayload {
    overall_score: f32,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    strengths: Vec<String>,
    #[serde(default)]
    improvements: Vec<String>,
    #[serde(default)]
    meets_objective: Option<bool>,
    #[serde(default)]
    voice_mode_appropriate: Option<bool>,
    #[serde(default)]
    retry_recommended: Option<bool>,
    #[serde(default)]
    retry_guidance: Option<String>,
}

pub struct Evaluator {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl Evaluator {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    pub async fn evaluate(
        &self,
        candidate: &CandidateResponse,
        objective: &ResponseObjective,
        original_request: &str,
    ) -> Evaluation {
        let request = CompletionRequest::user(evaluation_prompt(candidate, objective, original_request))
            .with_system("You evaluate assistant responses against explicit objectives and reply only with JSON.")
            .with_temperature(0.3)
            .with_max_tokens(500);

        let output = match complete_within(self.llm.as_ref(), &request, self.timeout).await {
            Ok(c) => c.text,
            Err(e) => {
                tracing::warn!(error = %e, "evaluation call failed, using neutral score");
                return Evaluation::Fallback {
                    score: EvaluationScore::neutral(
                        NEUTRAL_SCORE,
                        format!("Evaluation failed: {}", e),
                        candidate.voice_friendly,
                    ),
                    reason: Degradation::EvaluationUnavailable,
                };
            }
        };

        match parse_json_output::<JudgedPayload>(&output) {
            Ok(p) => Evaluation::Judged(EvaluationScore {
                overall_score: clamp_unit(p.overall_score),
                reasoning: p.reasoning,
                strengths: p.strengths,
                improvements: p.improvements,
                meets_objective: p.meets_objective.unwrap_or(true),
                voice_mode_appropriate: p.voice_mode_appropriate.unwrap_or(candidate.voice_friendly),
                retry_recommended: p.retry_recommended.unwrap_or(false),
                retry_guidance: p.retry_guidance.filter(|g| !g.trim().is_empty()),
            }),
            Err(e) => {
                tracing::warn!(error = %e, "unparsable evaluation, using heuristic score");
                Evaluation::Fallback {
                    score: heuristic_score(candidate, objective),
                    reason: Degradation::EvaluationIndeterminate,
                }
            }
        }
    }
}

fn evaluation_prompt(
    candidate: &CandidateResponse,
    objective: &ResponseObjective,
    original_request: &str,
) -> String {
    let voice = objective
        .voice_considerations
        .as_deref()
        .map(|v| format!("\nVoice Considerations: {}", v))
        .unwrap_or_default();
    format!(
        "ORIGINAL USER REQUEST:\n{request}\n\n\
         RESPONSE OBJECTIVE:\nPrimary Goal: {goal}\nSuccess Criteria: {criteria}\nAudience: {audience}\n\
         Style Preference: {style}\nLength Guidance: {length}{voice}\n\n\
         GENERATED RESPONSE:\n{content}\n\n\
         RESPONSE METADATA:\nConfidence: {confidence}\nVoice Friendly: {voice_friendly}\nReasoning: {reasoning}\n\n\
         Judge objective alignment, success criteria, audience fit, style, length and (if relevant) suitability for speech.\n\
         Reply with JSON: {{\"overall_score\": <0.0-1.0>, \"reasoning\": \"...\", \"strengths\": [\"...\"], \
         \"improvements\": [\"...\"], \"meets_objective\": <bool>, \"voice_mode_appropriate\": <bool>, \
         \"retry_recommended\": <bool>, \"retry_guidance\": \"...\"}}",
        request = original_request,
        goal = objective.primary_goal,
        criteria = objective.success_criteria.join(", "),
        audience = objective.audience,
        style = objective.style_preference,
        length = objective.length_guidance.as_str(),
        voice = voice,
        content = candidate.content,
        confidence = candidate.confidence,
        voice_friendly = candidate.voice_friendly,
        reasoning = candidate.reasoning,
    )
}

/// 篇幅是否与指引相符（按字符数）
fn length_matches(content: &str, guidance: LengthGuidance) -> bool {
    let len = content.chars().count();
    match guidance {
        LengthGuidance::Brief => len <= 500,
        LengthGuidance::Detailed => len >= 200,
        LengthGuidance::Moderate => true,
    }
}

/// 启发式评分：以候选置信度为基准，篇幅不符打八折；不建议重试
pub fn heuristic_score(candidate: &CandidateResponse, objective: &ResponseObjective) -> EvaluationScore {
    let mut score = candidate.confidence;
    let length_ok = length_matches(&candidate.content, objective.length_guidance);
    if !length_ok {
        score *= LENGTH_PENALTY;
    }
    let mut s = EvaluationScore::neutral(
        score,
        "Heuristic evaluation: evaluator output could not be parsed",
        candidate.voice_friendly,
    );
    if !length_ok {
        s.improvements.push(format!(
            "Match the {} length guidance",
            objective.length_guidance.as_str()
        ));
    }
    s
}

/// attempt 为已完成的尝试次数。兜底评估永不触发重试
pub fn should_retry(evaluation: &Evaluation, attempt: usize, max_attempts: usize, voice_mode: bool) -> bool {
    if attempt >= max_attempts {
        return false;
    }
    let Evaluation::Judged(s) = evaluation else {
        return false;
    };
    s.retry_recommended
        || s.overall_score < RETRY_SCORE_THRESHOLD
        || !s.meets_objective
        || (voice_mode && !s.voice_mode_appropriate)
}
