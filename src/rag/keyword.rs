//! 关键词匹配后端（无需嵌入模型，永远可初始化）
//!
//! 也是其他后端在嵌入不可用时的降级打分方式：keyword_search。

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::memory::tokenizer::keyword_score;
use crate::rag::backend::rank_hits;
use crate::rag::{BackendStats, Document, MetadataFilter, RawHit, RetrievalBackend};

/// 低于该分数的命中丢弃
pub const KEYWORD_MIN_SCORE: f32 = 0.1;

/// 语料为空时的最小知识库
pub fn default_document() -> Document {
    Document::new(
        "default",
        "I am an AI assistant ready to help with conversations, resume generation, and explanations.",
    )
    .with_source("default")
    .with_metadata("type", "default")
}

/// 对文档集做关键词打分，过滤后按分数降序取前 k
pub fn keyword_search(
    documents: &[Document],
    query: &str,
    k: usize,
    filter: Option<&MetadataFilter>,
) -> Vec<RawHit> {
    let hits = documents
        .iter()
        .filter(|d| filter.map_or(true, |f| f.matches(&d.metadata)))
        .filter_map(|d| {
            let score = keyword_score(query, &d.content);
            (score > KEYWORD_MIN_SCORE).then(|| RawHit::from_document(d, score))
        })
        .collect();
    rank_hits(hits, k)
}

pub struct KeywordBackend {
    seed: Vec<Document>,
    documents: RwLock<Vec<Document>>,
    initialized: RwLock<bool>,
}

impl KeywordBackend {
    pub fn new(seed: Vec<Document>) -> Self {
        Self {
            seed,
            documents: RwLock::new(Vec::new()),
            initialized: RwLock::new(false),
        }
    }
}

#[async_trait]
impl RetrievalBackend for KeywordBackend {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn initialize(&self) -> bool {
        let mut initialized = self.initialized.write().await;
        if *initialized {
            return true;
        }
        let mut docs = self.documents.write().await;
        docs.extend(self.seed.iter().cloned());
        if docs.is_empty() {
            tracing::warn!("no documents found, creating minimal knowledge base");
            docs.push(default_document());
        }
        *initialized = true;
        tracing::info!(documents = docs.len(), "keyword backend initialized");
        true
    }

    async fn query_similar(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Vec<RawHit> {
        let docs = self.documents.read().await;
        keyword_search(&docs, query, k, filter)
    }

    async fn add_documents(&self, documents: Vec<Document>) -> bool {
        let mut docs = self.documents.write().await;
        // 有真实文档后去掉占位文档
        if docs.len() == 1 && docs[0].source == "default" && !documents.is_empty() {
            docs.clear();
        }
        docs.extend(documents);
        true
    }

    async fn stats(&self) -> BackendStats {
        BackendStats {
            backend: "keyword".to_string(),
            mode: "keyword".to_string(),
            document_count: self.documents.read().await.len(),
            initialized: *self.initialized.read().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<Document> {
        vec![
            Document::new("1", "Rust projects: a compiler and a database")
                .with_metadata("category", "professional"),
            Document::new("2", "Hobby: baking sourdough bread on weekends")
                .with_metadata("category", "personal"),
        ]
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let backend = KeywordBackend::new(corpus());
        assert!(backend.initialize().await);
        assert!(backend.initialize().await);
        let stats = backend.stats().await;
        assert_eq!(stats.document_count, 2);
        assert!(stats.initialized);
        assert_eq!(stats.mode, "keyword");
    }

    #[tokio::test]
    async fn test_empty_corpus_gets_default_document() {
        let backend = KeywordBackend::new(vec![]);
        backend.initialize().await;
        let hits = backend.query_similar("ready to help with conversations", 5, None).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, "default");
    }

    #[tokio::test]
    async fn test_query_ranks_and_filters() {
        let backend = KeywordBackend::new(corpus());
        backend.initialize().await;

        let hits = backend.query_similar("tell me about rust projects", 5, None).await;
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("compiler"));

        let personal = MetadataFilter::new().with("category", "personal");
        let filtered = backend.query_similar("rust projects", 5, Some(&personal)).await;
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn test_add_documents_replaces_placeholder() {
        let backend = KeywordBackend::new(vec![]);
        backend.initialize().await;
        backend
            .add_documents(vec![Document::new("x", "Kubernetes operator experience")])
            .await;
        assert_eq!(backend.stats().await.document_count, 1);
        let hits = backend.query_similar("kubernetes", 3, None).await;
        assert_eq!(hits.len(), 1);
    }
}
