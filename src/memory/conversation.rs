//! 对话数据：消息、轮次与记忆状态
//!
//! Message / Role 是发给 LLM 的带角色消息；ConversationTurn 是一问一答的一轮，
//! 只追加、不修改，仅在压缩时整体移出工作集。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 一轮对话
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub user_input: String,
    pub assistant_response: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ConversationTurn {
    pub fn new(
        user_input: impl Into<String>,
        assistant_response: impl Into<String>,
        metadata: HashMap<String, Value>,
    ) -> Self {
        Self {
            user_input: user_input.into(),
            assistant_response: assistant_response.into(),
            timestamp: Utc::now(),
            metadata,
        }
    }

    /// 转为 user + assistant 两条消息
    pub fn to_messages(&self) -> [Message; 2] {
        [
            Message::user(self.user_input.clone()),
            Message::assistant(self.assistant_response.clone()),
        ]
    }
}

/// get_conversation_context 的返回项：可选的摘要在前，最近轮次在后
#[derive(Clone, Debug, PartialEq)]
pub enum ContextEntry {
    Summary(String),
    Turn(ConversationTurn),
}

impl ContextEntry {
    pub fn to_messages(&self) -> Vec<Message> {
        match self {
            ContextEntry::Summary(s) => {
                vec![Message::system(format!("Summary of earlier conversation: {}", s))]
            }
            ContextEntry::Turn(t) => t.to_messages().to_vec(),
        }
    }
}

/// 把上下文条目展开为消息列表
pub fn entries_to_messages(entries: &[ContextEntry]) -> Vec<Message> {
    entries.iter().flat_map(|e| e.to_messages()).collect()
}

/// 会话元数据（派生计数）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default)]
    pub total_turns: u64,
    #[serde(default)]
    pub request_types: HashMap<String, u64>,
    #[serde(default)]
    pub voice_interactions: u64,
    #[serde(default)]
    pub last_interaction: Option<DateTime<Utc>>,
}

impl SessionMetadata {
    /// 按轮次元数据更新计数（request_type、voice_mode）
    pub fn record(&mut self, turn: &ConversationTurn) {
        self.total_turns += 1;
        if turn
            .metadata
            .get("voice_mode")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            self.voice_interactions += 1;
        }
        if let Some(kind) = turn.metadata.get("request_type").and_then(Value::as_str) {
            *self.request_types.entry(kind.to_string()).or_insert(0) += 1;
        }
        self.last_interaction = Some(turn.timestamp);
    }
}

/// 对话记忆状态；仅由 ContextManager 持有
#[derive(Clone, Debug, Default)]
pub struct ConversationMemoryState {
    /// 工作集（会话内，不持久化）
    pub turns: Vec<ConversationTurn>,
    /// 已压缩历史的摘要
    pub summary: Option<String>,
    /// 跨会话洞察：类别 → 内容
    pub long_term_memory: serde_json::Map<String, Value>,
    pub session_metadata: SessionMetadata,
}

impl ConversationMemoryState {
    /// 深度合并洞察：两边都是对象时逐键覆盖，否则整体替换；空值忽略。返回是否有变化
    pub fn merge_insights(&mut self, insights: serde_json::Map<String, Value>) -> bool {
        let mut changed = false;
        for (category, content) in insights {
            if is_empty_value(&content) {
                continue;
            }
            match (self.long_term_memory.get_mut(&category), content) {
                (Some(Value::Object(existing)), Value::Object(incoming)) => {
                    for (k, v) in incoming {
                        existing.insert(k, v);
                    }
                }
                (_, content) => {
                    self.long_term_memory.insert(category, content);
                }
            }
            changed = true;
        }
        changed
    }
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn turn_with(meta: Value) -> ConversationTurn {
        let metadata = meta
            .as_object()
            .map(|m| m.clone().into_iter().collect())
            .unwrap_or_default();
        ConversationTurn::new("q", "a", metadata)
    }

    #[test]
    fn test_session_metadata_counts() {
        let mut meta = SessionMetadata::default();
        meta.record(&turn_with(json!({"voice_mode": true, "request_type": "search"})));
        meta.record(&turn_with(json!({"request_type": "search"})));
        meta.record(&turn_with(json!({})));
        assert_eq!(meta.total_turns, 3);
        assert_eq!(meta.voice_interactions, 1);
        assert_eq!(meta.request_types.get("search"), Some(&2));
        assert!(meta.last_interaction.is_some());
    }

    #[test]
    fn test_merge_insights_dict_merge_and_overwrite() {
        let mut state = ConversationMemoryState::default();
        state.long_term_memory.insert("PREFERENCES".into(), json!({"tone": "casual"}));
        state.long_term_memory.insert("GOALS".into(), json!("learn rust"));

        let incoming = json!({
            "PREFERENCES": {"length": "short"},
            "GOALS": "ship the project",
            "CONTEXT": "",
        });
        let changed = state.merge_insights(incoming.as_object().cloned().unwrap());

        assert!(changed);
        assert_eq!(
            state.long_term_memory["PREFERENCES"],
            json!({"tone": "casual", "length": "short"})
        );
        assert_eq!(state.long_term_memory["GOALS"], json!("ship the project"));
        assert!(!state.long_term_memory.contains_key("CONTEXT"));
    }

    #[test]
    fn test_entries_to_messages_puts_summary_first() {
        let entries = vec![
            ContextEntry::Summary("talked about rust".into()),
            ContextEntry::Turn(ConversationTurn::new("hi", "hello", HashMap::new())),
        ];
        let msgs = entries_to_messages(&entries);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[1].content, "hi");
        assert_eq!(msgs[2].role, Role::Assistant);
    }
}
