//! 知识检索：后端抽象、三种后端实现与带 LLM 重排的 Retriever

pub mod backend;
pub mod chroma;
pub mod keyword;
pub mod retriever;
pub mod types;
pub mod vector;

pub use backend::{load_corpus, BackendKind, BackendStats, RetrievalBackend};
pub use chroma::{ChromaBackend, ChromaError};
pub use keyword::{keyword_search, KeywordBackend};
pub use retriever::{Retrieval, Retriever, RetrieverConfig};
pub use types::{ContextScope, Document, MetadataFilter, RawHit, RetrievedContext};
pub use vector::{cosine_similarity, EmbeddingIndex};
