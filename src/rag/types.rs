//! 检索层数据类型

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// 检索范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextScope {
    Personal,
    Professional,
    Creative,
    #[default]
    General,
    All,
}

impl ContextScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextScope::Personal => "personal",
            ContextScope::Professional => "professional",
            ContextScope::Creative => "creative",
            ContextScope::General => "general",
            ContextScope::All => "all",
        }
    }

    /// 宽松解析；未知值为 None
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "personal" => Some(ContextScope::Personal),
            "professional" => Some(ContextScope::Professional),
            "creative" => Some(ContextScope::Creative),
            "general" => Some(ContextScope::General),
            "all" => Some(ContextScope::All),
            _ => None,
        }
    }

    /// 对应的元数据过滤条件；general / all 不过滤
    pub fn to_filter(&self) -> Option<MetadataFilter> {
        match self {
            ContextScope::General | ContextScope::All => None,
            scope => Some(MetadataFilter::new().with("category", scope.as_str())),
        }
    }
}

impl fmt::Display for ContextScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 待入库文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_source() -> String {
    "knowledge_base".to_string()
}

impl Document {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            source: default_source(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// 后端返回的原始命中
#[derive(Debug, Clone, PartialEq)]
pub struct RawHit {
    pub content: String,
    pub source: String,
    /// 相似度，[0, 1]
    pub score: f32,
    pub metadata: HashMap<String, String>,
}

impl RawHit {
    pub fn from_document(doc: &Document, score: f32) -> Self {
        Self {
            content: doc.content.clone(),
            source: doc.source.clone(),
            score: score.clamp(0.0, 1.0),
            metadata: doc.metadata.clone(),
        }
    }
}

/// 元数据等值过滤（所有键都需匹配）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    pub conditions: HashMap<String, String>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.conditions.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, metadata: &HashMap<String, String>) -> bool {
        self.conditions
            .iter()
            .all(|(k, v)| metadata.get(k).is_some_and(|m| m.eq_ignore_ascii_case(v)))
    }
}

/// 经推理打分的检索上下文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    pub content: String,
    pub source: String,
    /// [0, 1]
    pub relevance_score: f32,
    pub relevance_reasoning: String,
    pub context_type: String,
    pub topic_tags: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl RetrievedContext {
    /// 未经 LLM 重排时的直接转换
    pub fn from_hit(hit: RawHit) -> Self {
        let context_type = hit
            .metadata
            .get("category")
            .cloned()
            .unwrap_or_else(|| "general".to_string());
        Self {
            content: hit.content,
            source: hit.source,
            relevance_score: hit.score.clamp(0.0, 1.0),
            relevance_reasoning: "similarity match".to_string(),
            context_type,
            topic_tags: Vec::new(),
            metadata: hit.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_filter() {
        assert!(ContextScope::General.to_filter().is_none());
        assert!(ContextScope::All.to_filter().is_none());
        let f = ContextScope::Professional.to_filter().unwrap();
        let doc = Document::new("1", "x").with_metadata("category", "Professional");
        assert!(f.matches(&doc.metadata));
        assert!(!f.matches(&HashMap::new()));
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!(ContextScope::parse(" Creative "), Some(ContextScope::Creative));
        assert_eq!(ContextScope::parse("unknown"), None);
    }

    #[test]
    fn test_context_from_hit_uses_similarity_reasoning() {
        let hit = RawHit::from_document(&Document::new("1", "rust").with_metadata("category", "professional"), 1.4);
        let ctx = RetrievedContext::from_hit(hit);
        assert_eq!(ctx.relevance_score, 1.0);
        assert_eq!(ctx.relevance_reasoning, "similarity match");
        assert_eq!(ctx.context_type, "professional");
    }

    #[test]
    fn test_document_deserialize_defaults() {
        let doc: Document = serde_json::from_str(r#"{"id": "a", "content": "hello"}"#).unwrap();
        assert_eq!(doc.source, "knowledge_base");
        assert!(doc.metadata.is_empty());
    }
}
