//! Companion - 对话推理管线
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与降级标记、构建器、单条消息编排
//! - **llm**: 补全 / 嵌入 provider 抽象与实现（OpenAI 兼容 / Ollama / 主备切换 / Mock）
//! - **rag**: 检索后端（向量索引 / Chroma / 关键词）与带重排的 Retriever
//! - **reasoning**: 解析、生成、评估与有界重试
//! - **memory**: 有界对话工作集、摘要压缩、长期洞察与持久化
//! - **cli**: 命令行前缀解析

pub mod cli;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod rag;
pub mod reasoning;

pub use crate::core::{CompanionBuilder, Orchestrator, PipelineResponse, TurnOptions};
