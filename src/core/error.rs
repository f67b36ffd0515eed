//! 管线错误类型与降级标记
//!
//! provider 失败一律在组件内部降级，记录为 Degradation；只有 Cancelled 会从 process_message 返回。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;

/// 管线运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::JsonParse(e.to_string())
    }
}

/// 某个组件走了降级路径；写入响应元数据而非报错
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
    /// 解析器回退到关键词分类
    ParserFallback,
    /// 检索跳过了 LLM 重排
    RerankSkipped,
    /// 首选检索后端初始化失败，使用了较弱后端
    BackendFallback,
    /// 生成失败，返回了固定致歉回复
    SynthesisFallback,
    /// 评估输出无法解析，使用启发式评分
    EvaluationIndeterminate,
    /// 评估调用失败，使用中性评分
    EvaluationUnavailable,
}

/// 重试循环结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// 评估认为无需重试
    Accepted,
    /// 用尽 max_attempts
    Exhausted,
    /// 回复已流式输出，只评估不重试
    Streamed,
}
