//! 记忆持久化
//!
//! 将摘要、长期记忆与会话元数据整体写入单个 JSON 文件；turns 属于会话，不落盘。
//! 文件不存在视为全新状态，不是错误。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::memory::SessionMetadata;

/// 落盘记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedMemory {
    #[serde(default)]
    pub conversation_summary: String,
    #[serde(default)]
    pub long_term_memory: serde_json::Map<String, Value>,
    #[serde(default)]
    pub session_metadata: SessionMetadata,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl PersistedMemory {
    pub fn summary(&self) -> Option<String> {
        let s = self.conversation_summary.trim();
        (!s.is_empty()).then(|| s.to_string())
    }
}

/// 单文件 JSON 存储
#[derive(Debug, Clone)]
pub struct MemoryStore {
    path: PathBuf,
}

impl MemoryStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载；文件不存在时返回默认空记录
    pub async fn load(&self) -> Result<PersistedMemory, AgentError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedMemory::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// 整体覆盖写入；先写临时文件再 rename，父目录不存在时自动创建
    pub async fn save(&self, record: &PersistedMemory) -> Result<(), AgentError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(record)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_missing_file_is_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path().join("nope.json"));
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, PersistedMemory::default());
        assert!(loaded.summary().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path().join("nested/memory.json"));
        let mut record = PersistedMemory {
            conversation_summary: "User builds compilers.".to_string(),
            last_updated: Some(Utc::now()),
            ..Default::default()
        };
        record
            .long_term_memory
            .insert("GOALS".to_string(), json!({"career": "systems"}));
        record.session_metadata.total_turns = 12;

        store.save(&record).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = MemoryStore::new(&path);
        assert!(matches!(store.load().await, Err(AgentError::JsonParse(_))));
    }
}
