//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `COMPANION__*` 覆盖（双下划线表示嵌套，如 `COMPANION__RETRIEVAL__TOP_K=8`）。
//! 每个字段都有默认值，没有配置文件也能运行。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::rag::BackendKind;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub retrieval: RetrievalSection,
    pub generation: GenerationSection,
    pub memory: MemorySection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 助手身份描述，写入生成提示
    pub persona: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "companion".to_string(),
            persona: "an intelligent, conversational AI assistant".to_string(),
        }
    }
}

/// [llm] 段：主/备 provider、嵌入、温度与各环节超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub primary: PrimarySection,
    pub fallback: FallbackSection,
    pub embedding: EmbeddingSection,
    pub temperature: f32,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            primary: PrimarySection::default(),
            fallback: FallbackSection::default(),
            embedding: EmbeddingSection::default(),
            temperature: 0.7,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

/// [llm.primary]：provider 为 ollama / openai / mock
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrimarySection {
    pub provider: String,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

impl Default for PrimarySection {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            base_url: None,
            model: None,
        }
    }
}

/// [llm.fallback]：主 provider 失败时改用的 OpenAI 兼容端点；需要 OPENAI_API_KEY
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackSection {
    pub enabled: bool,
    pub base_url: Option<String>,
    pub model: String,
}

impl Default for FallbackSection {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            model: "gpt-4o-mini".to_string(),
        }
    }
}

/// [llm.embedding]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    pub enabled: bool,
    pub base_url: Option<String>,
    pub model: String,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            model: "text-embedding-3-small".to_string(),
        }
    }
}

/// [llm.timeouts]（秒）
///
/// primary 为有备用 provider 时主 provider 的单次上限，应小于各环节时限，给备用留出时间；
/// request 为 HTTP 客户端的整体上限。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    pub primary: u64,
    pub request: u64,
    pub parse: u64,
    pub rerank: u64,
    pub synthesize: u64,
    pub evaluate: u64,
    pub summarize: u64,
    pub embed: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            primary: 15,
            request: 90,
            parse: 20,
            rerank: 30,
            synthesize: 60,
            evaluate: 30,
            summarize: 60,
            embed: 30,
        }
    }
}

impl LlmTimeoutsSection {
    pub fn primary(&self) -> Duration {
        Duration::from_secs(self.primary)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request)
    }

    pub fn parse(&self) -> Duration {
        Duration::from_secs(self.parse)
    }

    pub fn rerank(&self) -> Duration {
        Duration::from_secs(self.rerank)
    }

    pub fn synthesize(&self) -> Duration {
        Duration::from_secs(self.synthesize)
    }

    pub fn evaluate(&self) -> Duration {
        Duration::from_secs(self.evaluate)
    }

    pub fn summarize(&self) -> Duration {
        Duration::from_secs(self.summarize)
    }

    pub fn embed(&self) -> Duration {
        Duration::from_secs(self.embed)
    }
}

/// [retrieval] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalSection {
    pub backend: BackendKind,
    pub top_k: usize,
    pub min_similarity: f32,
    /// 外部加载器产出的文档 JSON
    pub corpus_path: PathBuf,
    /// 向量索引缓存文件
    pub cache_path: Option<PathBuf>,
    pub chroma: ChromaSection,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            top_k: 5,
            min_similarity: 0.1,
            corpus_path: PathBuf::from("data/corpus.json"),
            cache_path: Some(PathBuf::from("data/embeddings.json")),
            chroma: ChromaSection::default(),
        }
    }
}

/// [retrieval.chroma]；未设置 url 时 auto 模式跳过 Chroma
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChromaSection {
    pub url: Option<String>,
    pub collection: String,
}

impl Default for ChromaSection {
    fn default() -> Self {
        Self {
            url: None,
            collection: "knowledge_base".to_string(),
        }
    }
}

/// [generation] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationSection {
    pub max_attempts: usize,
    pub enable_evaluation: bool,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            enable_evaluation: true,
        }
    }
}

/// [memory] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// 关闭后只保留滑动窗口，不做摘要与洞察
    pub enabled: bool,
    pub sliding_window_size: usize,
    pub summarize_threshold: usize,
    pub insight_interval: usize,
    pub memory_file: PathBuf,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            enabled: true,
            sliding_window_size: 6,
            summarize_threshold: 10,
            insight_interval: 5,
            memory_file: PathBuf::from("data/conversation_memory.json"),
        }
    }
}

/// 从 config 目录加载配置，环境变量 COMPANION__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 COMPANION__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("COMPANION")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.retrieval.top_k, 5);
        assert_eq!(cfg.generation.max_attempts, 3);
        assert_eq!(cfg.memory.sliding_window_size, 6);
        assert_eq!(cfg.memory.summarize_threshold, 10);
        assert_eq!(cfg.llm.timeouts.synthesize(), Duration::from_secs(60));
        assert!(cfg.llm.timeouts.primary() < cfg.llm.timeouts.parse());
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[retrieval]\nbackend = \"keyword\"\ntop_k = 8\n\n[generation]\nmax_attempts = 2\n",
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.retrieval.backend, BackendKind::Keyword);
        assert_eq!(cfg.retrieval.top_k, 8);
        assert_eq!(cfg.generation.max_attempts, 2);
        // 未写的段保持默认
        assert!(cfg.generation.enable_evaluation);
        assert_eq!(cfg.memory.insight_interval, 5);
    }
}
