//! 核心编排层：错误与降级标记、构建器、单条消息管线

pub mod builder;
pub mod error;
pub mod orchestrator;

pub use builder::{create_llm_from_config, create_orchestrator, CompanionBuilder};
pub use error::{AgentError, Degradation, StopReason};
pub use orchestrator::{
    Orchestrator, PipelineResponse, PipelineSettings, ResponseMetadata, TurnOptions,
};
