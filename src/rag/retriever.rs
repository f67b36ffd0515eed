//! Retriever：选定后端 + LLM 相关性重排
//!
//! 后端解析按能力探测逐个 initialize，失败就换下一个，关键词后端兜底且必然成功；结果缓存在 OnceCell。
//! 检索时超额取 2×top_k 条原始命中，交给 LLM 逐条打分并给出理由，再稳定排序截断到 top_k。
//! LLM 不可用时直接用后端分数，理由记为 "similarity match"。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::core::Degradation;
use crate::llm::{complete_within, CompletionRequest, EmbeddingProvider, LlmClient};
use crate::rag::{
    BackendKind, BackendStats, ChromaBackend, ContextScope, Document, EmbeddingIndex,
    KeywordBackend, RawHit, RetrievalBackend, RetrievedContext,
};
use crate::reasoning::json::{clamp_unit, parse_json_output};

/// Retriever 参数
#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    pub backend: BackendKind,
    pub top_k: usize,
    pub min_similarity: f32,
    pub rerank_timeout: Duration,
    pub cache_path: Option<PathBuf>,
    pub chroma_url: Option<String>,
    pub chroma_collection: String,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            top_k: 5,
            min_similarity: 0.1,
            rerank_timeout: Duration::from_secs(30),
            cache_path: None,
            chroma_url: None,
            chroma_collection: "knowledge_base".to_string(),
        }
    }
}

/// 一次检索的结果与降级标记
#[derive(Debug, Clone, Default)]
pub struct Retrieval {
    pub contexts: Vec<RetrievedContext>,
    pub degradations: Vec<Degradation>,
    pub backend: String,
}

struct Resolved {
    backend: Arc<dyn RetrievalBackend>,
    /// 首选后端没能初始化
    fell_back: bool,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    evaluations: Vec<RerankItem>,
}

#[derive(Debug, Deserialize)]
struct RerankItem {
    result_index: usize,
    #[serde(default)]
    relevance_score: Option<f32>,
    #[serde(default)]
    relevance_reasoning: Option<String>,
    #[serde(default)]
    context_type: Option<String>,
    #[serde(default)]
    topic_tags: Vec<String>,
}

pub struct Retriever {
    config: RetrieverConfig,
    llm: Arc<dyn LlmClient>,
    candidates: Vec<Arc<dyn RetrievalBackend>>,
    resolved: OnceCell<Resolved>,
}

impl Retriever {
    /// 按配置与能力构建候选链：auto 时依次 chroma（配置了 url 且有嵌入）→ vector（有嵌入）→ keyword
    pub fn new(
        config: RetrieverConfig,
        llm: Arc<dyn LlmClient>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        corpus: Vec<Document>,
    ) -> Self {
        let mut candidates: Vec<Arc<dyn RetrievalBackend>> = Vec::new();
        let want = |kind: BackendKind| config.backend == BackendKind::Auto || config.backend == kind;

        if let Some(ref embedder) = embedder {
            if want(BackendKind::Chroma) {
                if let Some(ref url) = config.chroma_url {
                    candidates.push(Arc::new(ChromaBackend::new(
                        url,
                        &config.chroma_collection,
                        embedder.clone(),
                        corpus.clone(),
                    )));
                }
            }
            if want(BackendKind::Vector) {
                candidates.push(Arc::new(EmbeddingIndex::new(
                    embedder.clone(),
                    corpus.clone(),
                    config.cache_path.clone(),
                    config.min_similarity,
                )));
            }
        } else if matches!(config.backend, BackendKind::Chroma | BackendKind::Vector) {
            tracing::warn!(backend = %config.backend, "no embedding provider, using keyword backend");
        }
        candidates.push(Arc::new(KeywordBackend::new(corpus)));

        Self::with_backends(config, llm, candidates)
    }

    /// 指定候选链（按优先级）；末尾总会补上关键词后端
    pub fn with_backends(
        config: RetrieverConfig,
        llm: Arc<dyn LlmClient>,
        mut candidates: Vec<Arc<dyn RetrievalBackend>>,
    ) -> Self {
        if candidates.last().map(|b| b.name()) != Some("keyword") {
            candidates.push(Arc::new(KeywordBackend::new(Vec::new())));
        }
        Self {
            config,
            llm,
            candidates,
            resolved: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &RetrieverConfig {
        &self.config
    }

    /// 候选链中各后端名
    pub fn available_backends(&self) -> Vec<String> {
        self.candidates.iter().map(|b| b.name().to_string()).collect()
    }

    async fn resolve(&self) -> &Resolved {
        self.resolved
            .get_or_init(|| async {
                let last = self.candidates.len().saturating_sub(1);
                for (i, backend) in self.candidates.iter().enumerate() {
                    if backend.initialize().await {
                        tracing::info!(backend = %backend.name(), "retrieval backend ready");
                        return Resolved {
                            backend: backend.clone(),
                            fell_back: i > 0,
                        };
                    }
                    if i < last {
                        tracing::warn!(
                            backend = %backend.name(),
                            next = %self.candidates[i + 1].name(),
                            "backend failed to initialize, falling back"
                        );
                    }
                }
                // 关键词后端不会初始化失败；保险起见再建一个空的
                let keyword: Arc<dyn RetrievalBackend> = Arc::new(KeywordBackend::new(Vec::new()));
                keyword.initialize().await;
                Resolved {
                    backend: keyword,
                    fell_back: true,
                }
            })
            .await
    }

    /// 当前选定后端名（会触发解析）
    pub async fn backend_name(&self) -> String {
        self.resolve().await.backend.name().to_string()
    }

    pub async fn stats(&self) -> BackendStats {
        self.resolve().await.backend.stats().await
    }

    pub async fn add_documents(&self, documents: Vec<Document>) -> bool {
        self.resolve().await.backend.add_documents(documents).await
    }

    /// 检索并重排，返回至多 top_k 条
    pub async fn retrieve(&self, query: &str, scope: ContextScope, top_k: usize) -> Retrieval {
        let resolved = self.resolve().await;
        let backend = &resolved.backend;
        let mut degradations = Vec::new();
        if resolved.fell_back {
            degradations.push(Degradation::BackendFallback);
        }

        let fetch = top_k.saturating_mul(2).max(1);
        let filter = scope.to_filter();
        let mut hits = backend.query_similar(query, fetch, filter.as_ref()).await;
        if hits.is_empty() && filter.is_some() {
            tracing::debug!(scope = %scope, "no hits within scope, widening to all documents");
            hits = backend.query_similar(query, fetch, None).await;
        }

        if hits.is_empty() || top_k == 0 {
            return Retrieval {
                contexts: Vec::new(),
                degradations,
                backend: backend.name().to_string(),
            };
        }

        let mut contexts = match self.rerank(query, scope, &hits).await {
            Some(contexts) => contexts,
            None => {
                degradations.push(Degradation::RerankSkipped);
                hits.into_iter().map(RetrievedContext::from_hit).collect()
            }
        };

        // 稳定排序：同分保持后端返回顺序
        contexts.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        contexts.truncate(top_k);

        Retrieval {
            contexts,
            degradations,
            backend: backend.name().to_string(),
        }
    }

    /// LLM 重排；调用失败或输出不可解析时返回 None
    async fn rerank(
        &self,
        query: &str,
        scope: ContextScope,
        hits: &[RawHit],
    ) -> Option<Vec<RetrievedContext>> {
        let results_text = hits
            .iter()
            .enumerate()
            .map(|(i, h)| format!("Result {}:\nContent: {}\nScore: {:.3}", i, h.content, h.score))
            .collect::<Vec<_>>()
            .join("\n\n");

        let system = format!(
            "You are evaluating search results for relevance and providing reasoning.\n\n\
             Query: \"{}\"\nContext Scope: {}\n\n\
             For each result, determine:\n\
             1. How relevant it is to the query (0.0 to 1.0)\n\
             2. WHY it's relevant (reasoning)\n\
             3. What type of context it provides\n\
             4. Key topic tags\n\n\
             Return JSON: {{\"evaluations\": [{{\"result_index\": <0-based index>, \"relevance_score\": <0.0-1.0>, \
             \"relevance_reasoning\": \"...\", \"context_type\": \"...\", \"topic_tags\": [\"...\"]}}]}}",
            query, scope
        );
        let request = CompletionRequest::user(format!("Evaluate these results:\n{}", results_text))
            .with_system(system)
            .with_temperature(0.3)
            .with_max_tokens(600);

        let completion = match complete_within(self.llm.as_ref(), &request, self.config.rerank_timeout).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "relevance reasoning failed, using similarity scores");
                return None;
            }
        };
        let parsed: RerankResponse = match parse_json_output(&completion.text) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "could not parse relevance evaluations, using similarity scores");
                return None;
            }
        };

        let mut contexts: Vec<RetrievedContext> =
            hits.iter().cloned().map(RetrievedContext::from_hit).collect();
        for item in parsed.evaluations {
            let Some(ctx) = contexts.get_mut(item.result_index) else {
                tracing::debug!(index = item.result_index, "evaluation for unknown result ignored");
                continue;
            };
            if let Some(score) = item.relevance_score {
                ctx.relevance_score = clamp_unit(score);
            }
            if let Some(reasoning) = item.relevance_reasoning.filter(|r| !r.trim().is_empty()) {
                ctx.relevance_reasoning = reasoning;
            }
            if let Some(kind) = item.context_type.filter(|k| !k.trim().is_empty()) {
                ctx.context_type = kind;
            }
            ctx.topic_tags = item.topic_tags;
        }
        Some(contexts)
    }
}
