//! RetryOrchestrator：生成 → 评估 → 按反馈增强目标后再生成，至多 max_attempts 次
//!
//! 尝试严格串行：下一次的目标取决于上一次的评估。保留分数最高的（候选, 评估）对，
//! 同分保留较早的一次。取消只在尝试边界检查。
//! 流式生成只有一次尝试：已发出的文字无法撤回，评估结果仅随回复返回。

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, Degradation, StopReason};
use crate::memory::RequestContext;
use crate::rag::RetrievedContext;
use crate::reasoning::evaluator::{should_retry, Evaluator};
use crate::reasoning::synthesizer::Synthesizer;
use crate::reasoning::types::{
    CandidateResponse, Evaluation, EvaluationScore, ResponseObjective, StructuredRequest,
};

/// 重试时追加到 avoid_patterns 的固定标记
pub const AVOID_PREVIOUS_WEAKNESSES: &str = "Repeat previous weaknesses";

/// 单次尝试记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub attempt: usize,
    pub score: Option<f32>,
    pub wanted_retry: bool,
}

#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub candidate: CandidateResponse,
    /// 关闭评估时为 None
    pub evaluation: Option<Evaluation>,
    pub attempts: usize,
    pub stop_reason: StopReason,
    pub degradations: Vec<Degradation>,
    pub history: Vec<AttemptRecord>,
}

/// 用评估反馈增强目标：改进项与重试指引追加到 success_criteria，避免标记只加一次
pub fn enhance_objective(objective: &ResponseObjective, evaluation: &EvaluationScore) -> ResponseObjective {
    let mut enhanced = objective.clone();
    enhanced
        .success_criteria
        .extend(evaluation.improvements.iter().map(|i| format!("Improve: {}", i)));
    if let Some(ref guidance) = evaluation.retry_guidance {
        enhanced
            .success_criteria
            .push(format!("Address feedback: {}", guidance));
    }
    if !enhanced.avoid_patterns.iter().any(|p| p == AVOID_PREVIOUS_WEAKNESSES) {
        enhanced.avoid_patterns.push(AVOID_PREVIOUS_WEAKNESSES.to_string());
    }
    enhanced
}

fn note(degradations: &mut Vec<Degradation>, d: Degradation) {
    if !degradations.contains(&d) {
        degradations.push(d);
    }
}

pub struct RetryOrchestrator {
    synthesizer: Arc<Synthesizer>,
    evaluator: Option<Arc<Evaluator>>,
}

impl RetryOrchestrator {
    /// evaluator 为 None 时只生成一次
    pub fn new(synthesizer: Arc<Synthesizer>, evaluator: Option<Arc<Evaluator>>) -> Self {
        Self {
            synthesizer,
            evaluator,
        }
    }

    pub async fn generate_with_retry(
        &self,
        request: &StructuredRequest,
        contexts: &[RetrievedContext],
        objective: &ResponseObjective,
        memory: Option<&RequestContext>,
        max_attempts: usize,
        cancel: &CancellationToken,
    ) -> Result<RetryOutcome, AgentError> {
        let max_attempts = max_attempts.max(1);
        let mut degradations = Vec::new();
        let mut history = Vec::new();

        let Some(ref evaluator) = self.evaluator else {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let candidate = self.synthesizer.generate(request, contexts, objective, memory).await;
            if candidate.is_error() {
                note(&mut degradations, Degradation::SynthesisFallback);
            }
            history.push(AttemptRecord {
                attempt: 1,
                score: None,
                wanted_retry: false,
            });
            return Ok(RetryOutcome {
                candidate,
                evaluation: None,
                attempts: 1,
                stop_reason: StopReason::Accepted,
                degradations,
                history,
            });
        };

        let mut current = objective.clone();
        let mut best: Option<(CandidateResponse, Evaluation)> = None;
        let mut attempts = 0;
        let mut stop_reason = StopReason::Exhausted;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                tracing::info!(attempt, "turn cancelled, abandoning retry loop");
                return Err(AgentError::Cancelled);
            }
            attempts = attempt;

            let candidate = self.synthesizer.generate(request, contexts, &current, memory).await;
            if candidate.is_error() {
                note(&mut degradations, Degradation::SynthesisFallback);
            }
            // 用生成这份候选时的目标快照评估
            let evaluation = evaluator
                .evaluate(&candidate, &current, &request.original_text)
                .await;
            if let Some(d) = evaluation.degradation() {
                note(&mut degradations, d);
            }

            let wants_retry = should_retry(&evaluation, attempt, usize::MAX, request.voice_mode);
            history.push(AttemptRecord {
                attempt,
                score: Some(evaluation.overall()),
                wanted_retry: wants_retry,
            });
            tracing::debug!(
                attempt,
                score = evaluation.overall(),
                retry = wants_retry,
                "candidate evaluated"
            );

            let next_objective = wants_retry.then(|| enhance_objective(&current, evaluation.score()));
            let improves = best
                .as_ref()
                .map_or(true, |(_, b)| evaluation.overall() > b.overall());
            if improves {
                best = Some((candidate, evaluation));
            }

            if !should_retry_after(wants_retry, attempt, max_attempts) {
                stop_reason = if wants_retry {
                    StopReason::Exhausted
                } else {
                    StopReason::Accepted
                };
                break;
            }
            if let Some(next) = next_objective {
                tracing::info!(attempt, "retrying with evaluator feedback");
                current = next;
            }
        }

        let Some((candidate, evaluation)) = best else {
            // max_attempts >= 1，循环至少跑一次
            return Err(AgentError::Config("retry loop produced no candidate".into()));
        };
        Ok(RetryOutcome {
            candidate,
            evaluation: Some(evaluation),
            attempts,
            stop_reason,
            degradations,
            history,
        })
    }

    /// 单次流式生成 + 评估；stop_reason 为 Streamed
    pub async fn generate_streamed(
        &self,
        request: &StructuredRequest,
        contexts: &[RetrievedContext],
        objective: &ResponseObjective,
        memory: Option<&RequestContext>,
        chunks: &mpsc::UnboundedSender<String>,
        cancel: &CancellationToken,
    ) -> Result<RetryOutcome, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let mut degradations = Vec::new();
        let candidate = self
            .synthesizer
            .generate_streaming(request, contexts, objective, memory, chunks)
            .await;
        if candidate.is_error() {
            note(&mut degradations, Degradation::SynthesisFallback);
        }

        let evaluation = match self.evaluator {
            Some(ref evaluator) => {
                let evaluation = evaluator
                    .evaluate(&candidate, objective, &request.original_text)
                    .await;
                if let Some(d) = evaluation.degradation() {
                    note(&mut degradations, d);
                }
                Some(evaluation)
            }
            None => None,
        };
        let history = vec![AttemptRecord {
            attempt: 1,
            score: evaluation.as_ref().map(Evaluation::overall),
            wanted_retry: false,
        }];
        Ok(RetryOutcome {
            candidate,
            evaluation,
            attempts: 1,
            stop_reason: StopReason::Streamed,
            degradations,
            history,
        })
    }
}

fn should_retry_after(wants_retry: bool, attempt: usize, max_attempts: usize) -> bool {
    wants_retry && attempt < max_attempts
}
