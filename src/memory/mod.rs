//! 记忆层：对话消息与轮次、有界工作集 + 摘要压缩、长期洞察、持久化

pub mod context_manager;
pub mod conversation;
pub mod persistence;
pub mod tokenizer;

pub use context_manager::{ContextManager, ContextManagerConfig, RequestContext};
pub use conversation::{
    entries_to_messages, ContextEntry, ConversationMemoryState, ConversationTurn, Message, Role,
    SessionMetadata,
};
pub use persistence::{MemoryStore, PersistedMemory};
