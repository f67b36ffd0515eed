//! 构建器：由 AppConfig 组装 provider 链、嵌入、检索、记忆与编排器
//!
//! 组件均显式接收配置，请求处理路径上不再读取环境变量或全局状态。

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::orchestrator::{Orchestrator, PipelineSettings};
use crate::core::AgentError;
use crate::llm::{
    create_embedder_from_config, create_ollama_client, EmbeddingProvider, FallbackLlmClient,
    LlmClient, MockLlmClient, OpenAiClient,
};
use crate::memory::{ContextManager, ContextManagerConfig, MemoryStore};
use crate::rag::{load_corpus, Document, Retriever, RetrieverConfig};
use crate::reasoning::{Evaluator, Parser, RetryOrchestrator, Synthesizer};

fn openai_key() -> Option<String> {
    std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|k| !k.trim().is_empty())
}

/// 根据配置选择主 provider，并在有 OPENAI_API_KEY 时挂上 OpenAI 备用
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let primary_cfg = &cfg.llm.primary;
    let timeouts = &cfg.llm.timeouts;
    let key = openai_key();

    let primary: Arc<dyn LlmClient> = match primary_cfg.provider.to_lowercase().as_str() {
        "ollama" => {
            let client = create_ollama_client(primary_cfg.base_url.as_deref(), primary_cfg.model.as_deref())
                .with_timeout(timeouts.request());
            tracing::info!(model = %client.model(), "using Ollama as primary LLM");
            Arc::new(client)
        }
        "openai" if key.is_some() || primary_cfg.base_url.is_some() => {
            let model = primary_cfg.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            tracing::info!(model = %model, "using OpenAI as primary LLM");
            Arc::new(
                OpenAiClient::new(primary_cfg.base_url.as_deref(), &model, key.as_deref())
                    .with_timeout(timeouts.request()),
            )
        }
        "mock" => {
            tracing::info!("using mock LLM");
            Arc::new(MockLlmClient::echo())
        }
        other => {
            tracing::warn!(provider = %other, "no usable LLM provider configured, using mock LLM");
            Arc::new(MockLlmClient::echo())
        }
    };

    let primary_is_openai = primary.provider() == "openai";
    let fallback: Option<Arc<dyn LlmClient>> = match key {
        Some(ref key) if cfg.llm.fallback.enabled && !primary_is_openai => {
            tracing::info!(model = %cfg.llm.fallback.model, "OpenAI fallback enabled");
            Some(Arc::new(
                OpenAiClient::new(cfg.llm.fallback.base_url.as_deref(), &cfg.llm.fallback.model, Some(key))
                    .with_timeout(timeouts.request()),
            ))
        }
        _ => None,
    };

    Arc::new(FallbackLlmClient::new(primary, fallback).with_primary_timeout(timeouts.primary()))
}

/// 组装 Orchestrator；未显式给出的组件按配置创建
pub struct CompanionBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    embedder: Option<Option<Arc<dyn EmbeddingProvider>>>,
    corpus: Option<Vec<Document>>,
}

impl CompanionBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            embedder: None,
            corpus: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// None 表示不使用嵌入（检索退回关键词后端）
    pub fn with_embedder(mut self, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// 直接给出文档，跳过 corpus_path
    pub fn with_corpus(mut self, corpus: Vec<Document>) -> Self {
        self.corpus = Some(corpus);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn build_embedder(&self) -> Option<Arc<dyn EmbeddingProvider>> {
        if let Some(ref e) = self.embedder {
            return e.clone();
        }
        let e = &self.config.llm.embedding;
        create_embedder_from_config(
            e.enabled,
            e.base_url.as_deref(),
            &e.model,
            None,
            self.config.llm.timeouts.embed(),
        )
    }

    async fn build_corpus(&self) -> Vec<Document> {
        if let Some(ref docs) = self.corpus {
            return docs.clone();
        }
        let path = &self.config.retrieval.corpus_path;
        match load_corpus(path).await {
            Ok(docs) => {
                tracing::info!(path = %path.display(), documents = docs.len(), "corpus loaded");
                docs
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not load corpus, starting empty");
                Vec::new()
            }
        }
    }

    pub async fn build(self) -> Result<Orchestrator, AgentError> {
        let cfg = &self.config;
        let timeouts = &cfg.llm.timeouts;
        let llm = self
            .llm
            .clone()
            .unwrap_or_else(|| create_llm_from_config(cfg));
        let embedder = self.build_embedder();
        let corpus = self.build_corpus().await;

        let retriever = Retriever::new(
            RetrieverConfig {
                backend: cfg.retrieval.backend,
                top_k: cfg.retrieval.top_k,
                min_similarity: cfg.retrieval.min_similarity,
                rerank_timeout: timeouts.rerank(),
                cache_path: cfg.retrieval.cache_path.clone(),
                chroma_url: cfg.retrieval.chroma.url.clone(),
                chroma_collection: cfg.retrieval.chroma.collection.clone(),
            },
            llm.clone(),
            embedder,
            corpus,
        );

        let memory_cfg = &cfg.memory;
        let memory = ContextManager::new(
            ContextManagerConfig {
                sliding_window_size: memory_cfg.sliding_window_size,
                summarize_threshold: memory_cfg.summarize_threshold,
                insight_interval: memory_cfg.insight_interval,
                llm_timeout: timeouts.summarize(),
                summarization_enabled: memory_cfg.enabled,
            },
            llm.clone(),
            memory_cfg
                .enabled
                .then(|| MemoryStore::new(&memory_cfg.memory_file)),
        )
        .await;

        let synthesizer = Arc::new(
            Synthesizer::new(llm.clone(), timeouts.synthesize())
                .with_temperature(cfg.llm.temperature)
                .with_persona(cfg.app.persona.clone()),
        );
        let evaluator = cfg
            .generation
            .enable_evaluation
            .then(|| Arc::new(Evaluator::new(llm.clone(), timeouts.evaluate())));
        let retry = RetryOrchestrator::new(synthesizer.clone(), evaluator);

        Ok(Orchestrator::new(
            llm.clone(),
            Parser::new(llm, timeouts.parse()),
            Arc::new(retriever),
            synthesizer,
            retry,
            memory,
            PipelineSettings {
                top_k: cfg.retrieval.top_k,
                max_attempts: cfg.generation.max_attempts,
                history_turns: memory_cfg.sliding_window_size,
            },
        ))
    }
}

/// 便捷函数：加载配置并构建 Orchestrator；配置加载失败时使用默认值
pub async fn create_orchestrator(config_path: Option<PathBuf>) -> Result<Orchestrator, AgentError> {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    CompanionBuilder::new(config).build().await
}
