//! 检索后端抽象
//!
//! 各实现（嵌入向量索引、托管向量库、关键词匹配）共享同一契约，由 Retriever 按能力探测选用。
//! initialize 幂等且不报错：失败以 false 表示。

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::rag::{Document, MetadataFilter, RawHit};

/// 后端种类；配置中的 retrieval.backend 取值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Auto,
    Chroma,
    Vector,
    Keyword,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::Auto => "auto",
            BackendKind::Chroma => "chroma",
            BackendKind::Vector => "vector",
            BackendKind::Keyword => "keyword",
        };
        f.write_str(s)
    }
}

/// 后端统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    pub backend: String,
    /// "embedding" 或 "keyword"
    pub mode: String,
    pub document_count: usize,
    pub initialized: bool,
}

#[async_trait]
pub trait RetrievalBackend: Send + Sync {
    fn name(&self) -> &str;

    /// 加载或构建索引；可重复调用
    async fn initialize(&self) -> bool;

    /// 取与 query 最相似的至多 k 条，按分数降序
    async fn query_similar(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Vec<RawHit>;

    async fn add_documents(&self, documents: Vec<Document>) -> bool;

    async fn stats(&self) -> BackendStats;
}

/// 读取外部加载器产出的文档 JSON 数组；文件不存在时为空
pub async fn load_corpus(path: &Path) -> Result<Vec<Document>, AgentError> {
    match tokio::fs::read_to_string(path).await {
        Ok(data) => Ok(serde_json::from_str(&data)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// 按分数降序稳定排序后截断
pub(crate) fn rank_hits(mut hits: Vec<RawHit>, k: usize) -> Vec<RawHit> {
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(k);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_corpus_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let docs = load_corpus(&dir.path().join("corpus.json")).await.unwrap();
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn test_load_corpus_reads_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.json");
        std::fs::write(
            &path,
            r#"[{"id": "p1", "content": "Built a compiler", "metadata": {"category": "professional"}}]"#,
        )
        .unwrap();
        let docs = load_corpus(&path).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].metadata["category"], "professional");
    }

    #[test]
    fn test_rank_hits_is_stable() {
        let hit = |c: &str, s: f32| RawHit {
            content: c.to_string(),
            source: "t".to_string(),
            score: s,
            metadata: Default::default(),
        };
        let ranked = rank_hits(vec![hit("a", 0.5), hit("b", 0.9), hit("c", 0.5)], 2);
        assert_eq!(ranked[0].content, "b");
        assert_eq!(ranked[1].content, "a");
    }

    #[test]
    fn test_backend_kind_deserialize() {
        let kind: BackendKind = serde_json::from_str("\"chroma\"").unwrap();
        assert_eq!(kind, BackendKind::Chroma);
    }
}
