//! 推理层：解析 → 生成 → 评估 → 有界重试

pub mod evaluator;
pub mod json;
pub mod parser;
pub mod retry;
pub mod synthesizer;
pub mod types;

pub use evaluator::{heuristic_score, should_retry, Evaluator};
pub use parser::{adapt_for_voice, fallback_parse, ParsedTurn, Parser};
pub use retry::{enhance_objective, AttemptRecord, RetryOrchestrator, RetryOutcome};
pub use synthesizer::Synthesizer;
pub use types::{
    CandidateResponse, Evaluation, EvaluationScore, LengthGuidance, RequestType,
    ResponseObjective, StructuredRequest,
};
