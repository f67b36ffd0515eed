//! 嵌入向量索引：内存中的（文档, 向量）矩阵 + 余弦相似度
//!
//! 初始化时读 JSON 缓存：id 与内容都未变的文档沿用缓存向量，其余重新批量嵌入，
//! 有变化时写回缓存。查询时若嵌入失败，退回关键词打分。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::llm::EmbeddingProvider;
use crate::rag::backend::rank_hits;
use crate::rag::keyword::{default_document, keyword_search};
use crate::rag::{BackendStats, Document, MetadataFilter, RawHit, RetrievalBackend};

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// 按 id 取缓存向量；内容与缓存不一致的文档返回 None，需重新嵌入
fn reuse_cached(cache: Option<&IndexCache>, documents: &[Document]) -> Vec<Option<Vec<f32>>> {
    let cached: HashMap<&str, (&str, &Vec<f32>)> = cache
        .map(|c| {
            c.documents
                .iter()
                .zip(c.embeddings.iter())
                .map(|(d, e)| (d.id.as_str(), (d.content.as_str(), e)))
                .collect()
        })
        .unwrap_or_default();
    documents
        .iter()
        .map(|d| match cached.get(d.id.as_str()) {
            Some((content, emb)) if *content == d.content => Some((*emb).clone()),
            _ => None,
        })
        .collect()
}

/// 缓存文件格式
#[derive(Debug, Serialize, Deserialize)]
struct IndexCache {
    documents: Vec<Document>,
    embeddings: Vec<Vec<f32>>,
}

#[derive(Default)]
struct IndexState {
    documents: Vec<Document>,
    embeddings: Vec<Vec<f32>>,
    initialized: bool,
}

pub struct EmbeddingIndex {
    embedder: Arc<dyn EmbeddingProvider>,
    seed: Vec<Document>,
    cache_path: Option<PathBuf>,
    min_similarity: f32,
    state: RwLock<IndexState>,
}

impl EmbeddingIndex {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        seed: Vec<Document>,
        cache_path: Option<PathBuf>,
        min_similarity: f32,
    ) -> Self {
        Self {
            embedder,
            seed,
            cache_path,
            min_similarity,
            state: RwLock::new(IndexState::default()),
        }
    }

    async fn load_cache(&self) -> Option<IndexCache> {
        let path = self.cache_path.as_ref()?;
        let data = tokio::fs::read_to_string(path).await.ok()?;
        let cache: IndexCache = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable embedding cache");
                return None;
            }
        };
        if cache.documents.len() != cache.embeddings.len() {
            tracing::warn!(path = %path.display(), "embedding cache is inconsistent, rebuilding");
            return None;
        }
        Some(cache)
    }

    async fn save_cache(&self, documents: &[Document], embeddings: &[Vec<f32>]) {
        let Some(ref path) = self.cache_path else {
            return;
        };
        let cache = IndexCache {
            documents: documents.to_vec(),
            embeddings: embeddings.to_vec(),
        };
        let result = async {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            let json = serde_json::to_string(&cache).map_err(std::io::Error::other)?;
            tokio::fs::write(path, json).await
        }
        .await;
        match result {
            Ok(()) => tracing::debug!(path = %path.display(), "saved embedding cache"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not save embedding cache"),
        }
    }
}

#[async_trait]
impl RetrievalBackend for EmbeddingIndex {
    fn name(&self) -> &str {
        "vector"
    }

    async fn initialize(&self) -> bool {
        let mut state = self.state.write().await;
        if state.initialized {
            return true;
        }

        let cache = self.load_cache().await;
        if self.seed.is_empty() {
            if let Some(cache) = cache {
                tracing::info!(documents = cache.documents.len(), "loaded embedding cache");
                state.documents = cache.documents;
                state.embeddings = cache.embeddings;
                state.initialized = true;
                return true;
            }
        }

        let documents = if self.seed.is_empty() {
            tracing::warn!("no documents found, creating minimal knowledge base");
            vec![default_document()]
        } else {
            self.seed.clone()
        };

        let mut embeddings = reuse_cached(cache.as_ref(), &documents);
        let stale: Vec<usize> = (0..documents.len()).filter(|&i| embeddings[i].is_none()).collect();
        if !stale.is_empty() {
            let texts: Vec<String> = stale.iter().map(|&i| documents[i].content.clone()).collect();
            tracing::info!(documents = texts.len(), cached = documents.len() - texts.len(), "creating embeddings");
            let fresh = match self.embedder.embed_batch(&texts).await {
                Ok(e) if e.len() == texts.len() => e,
                Ok(e) => {
                    tracing::warn!(expected = texts.len(), got = e.len(), "embedding count mismatch");
                    return false;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "vector index initialization failed");
                    return false;
                }
            };
            for (i, emb) in stale.into_iter().zip(fresh) {
                embeddings[i] = Some(emb);
            }
        } else {
            tracing::info!(documents = documents.len(), "loaded embedding cache");
        }
        let embeddings: Vec<Vec<f32>> = embeddings.into_iter().flatten().collect();

        let unchanged = cache.as_ref().is_some_and(|c| c.documents == documents);
        if !unchanged {
            self.save_cache(&documents, &embeddings).await;
        }
        state.documents = documents;
        state.embeddings = embeddings;
        state.initialized = true;
        true
    }

    async fn query_similar(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Vec<RawHit> {
        let query_embedding = self.embedder.embed(query).await;
        let state = self.state.read().await;
        if !state.initialized {
            return Vec::new();
        }

        let query_embedding = match query_embedding {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => return keyword_search(&state.documents, query, k, filter),
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed, falling back to keyword matching");
                return keyword_search(&state.documents, query, k, filter);
            }
        };

        let hits = state
            .documents
            .iter()
            .zip(state.embeddings.iter())
            .filter(|(d, _)| filter.map_or(true, |f| f.matches(&d.metadata)))
            .filter_map(|(d, emb)| {
                let score = cosine_similarity(&query_embedding, emb);
                (score > self.min_similarity).then(|| RawHit::from_document(d, score))
            })
            .collect();
        rank_hits(hits, k)
    }

    async fn add_documents(&self, documents: Vec<Document>) -> bool {
        if documents.is_empty() {
            return true;
        }
        let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let embeddings = match self.embedder.embed_batch(&texts).await {
            Ok(e) if e.len() == documents.len() => e,
            Ok(_) => return false,
            Err(e) => {
                tracing::warn!(error = %e, "could not embed new documents");
                return false;
            }
        };
        let mut state = self.state.write().await;
        state.documents.extend(documents);
        state.embeddings.extend(embeddings);
        let (docs, embs) = (state.documents.clone(), state.embeddings.clone());
        drop(state);
        self.save_cache(&docs, &embs).await;
        true
    }

    async fn stats(&self) -> BackendStats {
        let state = self.state.read().await;
        BackendStats {
            backend: "vector".to_string(),
            mode: "embedding".to_string(),
            document_count: state.documents.len(),
            initialized: state.initialized,
        }
    }
}
