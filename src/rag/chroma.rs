//! Chroma 托管向量库后端（HTTP API v1）
//!
//! 需要可用的嵌入提供方与可达的 Chroma 服务；任一缺失则 initialize 返回 false，由 Retriever 换下一个后端。
//! 集合以 cosine 空间创建，相似度 = 1 - distance。查询嵌入失败时取回文档做关键词打分。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::llm::EmbeddingProvider;
use crate::rag::backend::rank_hits;
use crate::rag::keyword::keyword_search;
use crate::rag::{BackendStats, Document, MetadataFilter, RawHit, RetrievalBackend};

#[derive(Error, Debug)]
pub enum ChromaError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Chroma returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Backend not initialized")]
    NotInitialized,
}

#[derive(Debug, Deserialize)]
struct CollectionInfo {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    documents: Vec<Vec<Option<String>>>,
    #[serde(default)]
    metadatas: Vec<Vec<Option<HashMap<String, Value>>>>,
    #[serde(default)]
    distances: Vec<Vec<Option<f32>>>,
}

#[derive(Debug, Default, Deserialize)]
struct GetResponse {
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    documents: Vec<Option<String>>,
    #[serde(default)]
    metadatas: Vec<Option<HashMap<String, Value>>>,
}

#[derive(Debug, Serialize)]
struct AddRequest {
    ids: Vec<String>,
    embeddings: Vec<Vec<f32>>,
    documents: Vec<String>,
    metadatas: Vec<HashMap<String, String>>,
}

pub struct ChromaBackend {
    base_url: String,
    collection_name: String,
    embedder: Arc<dyn EmbeddingProvider>,
    seed: Vec<Document>,
    client: reqwest::Client,
    collection_id: RwLock<Option<String>>,
}

impl ChromaBackend {
    pub fn new(
        base_url: &str,
        collection_name: &str,
        embedder: Arc<dyn EmbeddingProvider>,
        seed: Vec<Document>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            collection_name: collection_name.to_string(),
            embedder,
            seed,
            client,
            collection_id: RwLock::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ChromaError> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(ChromaError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn heartbeat(&self) -> Result<(), ChromaError> {
        let resp = self.client.get(self.url("/heartbeat")).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn get_or_create_collection(&self) -> Result<String, ChromaError> {
        let body = json!({
            "name": self.collection_name,
            "get_or_create": true,
            "metadata": {"hnsw:space": "cosine"},
        });
        let resp = self.client.post(self.url("/collections")).json(&body).send().await?;
        let info: CollectionInfo = Self::check(resp).await?.json().await?;
        Ok(info.id)
    }

    async fn count(&self, id: &str) -> Result<usize, ChromaError> {
        let resp = self
            .client
            .get(self.url(&format!("/collections/{}/count", id)))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn add(&self, id: &str, documents: Vec<Document>) -> Result<(), ChromaError> {
        if documents.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let embeddings = self
            .embedder
            .embed_batch(&texts)
            .await
            .map_err(|e| ChromaError::Embedding(e.to_string()))?;
        let request = AddRequest {
            ids: documents
                .iter()
                .map(|d| {
                    if d.id.is_empty() {
                        uuid::Uuid::new_v4().to_string()
                    } else {
                        d.id.clone()
                    }
                })
                .collect(),
            embeddings,
            documents: texts,
            metadatas: documents
                .iter()
                .map(|d| {
                    let mut m = d.metadata.clone();
                    m.insert("source".to_string(), d.source.clone());
                    m
                })
                .collect(),
        };
        let resp = self
            .client
            .post(self.url(&format!("/collections/{}/add", id)))
            .json(&request)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn collection(&self) -> Result<String, ChromaError> {
        self.collection_id
            .read()
            .await
            .clone()
            .ok_or(ChromaError::NotInitialized)
    }

    async fn query(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RawHit>, ChromaError> {
        let id = self.collection().await?;
        let embedding = match self.embedder.embed(query).await {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => return self.keyword_fallback(&id, query, k, filter).await,
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed, falling back to keyword matching");
                return self.keyword_fallback(&id, query, k, filter).await;
            }
        };

        let mut body = json!({
            "query_embeddings": [embedding],
            "n_results": k.max(1),
            "include": ["documents", "metadatas", "distances"],
        });
        if let Some(w) = filter.and_then(where_clause) {
            body["where"] = w;
        }
        let resp = self
            .client
            .post(self.url(&format!("/collections/{}/query", id)))
            .json(&body)
            .send()
            .await?;
        let result: QueryResponse = Self::check(resp).await?.json().await?;

        let documents = result.documents.into_iter().next().unwrap_or_default();
        let metadatas = result.metadatas.into_iter().next().unwrap_or_default();
        let distances = result.distances.into_iter().next().unwrap_or_default();

        let hits = documents
            .into_iter()
            .enumerate()
            .filter_map(|(i, doc)| {
                let content = doc?;
                let metadata = flatten_metadata(metadatas.get(i).cloned().flatten());
                let distance = distances.get(i).copied().flatten().unwrap_or(1.0);
                Some(RawHit {
                    source: metadata
                        .get("source")
                        .cloned()
                        .unwrap_or_else(|| "unknown".to_string()),
                    content,
                    score: (1.0 - distance).clamp(0.0, 1.0),
                    metadata,
                })
            })
            .collect();
        Ok(rank_hits(hits, k))
    }

    async fn keyword_fallback(
        &self,
        id: &str,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RawHit>, ChromaError> {
        let body = json!({"include": ["documents", "metadatas"]});
        let resp = self
            .client
            .post(self.url(&format!("/collections/{}/get", id)))
            .json(&body)
            .send()
            .await?;
        let result: GetResponse = Self::check(resp).await?.json().await?;
        let documents: Vec<Document> = result
            .ids
            .into_iter()
            .enumerate()
            .filter_map(|(i, doc_id)| {
                let content = result.documents.get(i).cloned().flatten()?;
                let metadata = flatten_metadata(result.metadatas.get(i).cloned().flatten());
                let source = metadata
                    .get("source")
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string());
                Some(Document {
                    id: doc_id,
                    content,
                    source,
                    metadata,
                })
            })
            .collect();
        Ok(keyword_search(&documents, query, k, filter))
    }
}

/// MetadataFilter → Chroma where 子句；多个条件用 $and
fn where_clause(filter: &MetadataFilter) -> Option<Value> {
    let mut conditions: Vec<Value> = filter
        .conditions
        .iter()
        .map(|(k, v)| {
            let mut cond = serde_json::Map::new();
            cond.insert(k.clone(), Value::String(v.clone()));
            Value::Object(cond)
        })
        .collect();
    match conditions.len() {
        0 => None,
        1 => conditions.pop(),
        _ => Some(json!({ "$and": conditions })),
    }
}

fn flatten_metadata(meta: Option<HashMap<String, Value>>) -> HashMap<String, String> {
    meta.unwrap_or_default()
        .into_iter()
        .map(|(k, v)| {
            let s = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, s)
        })
        .collect()
}

#[async_trait]
impl RetrievalBackend for ChromaBackend {
    fn name(&self) -> &str {
        "chroma"
    }

    async fn initialize(&self) -> bool {
        let mut slot = self.collection_id.write().await;
        if slot.is_some() {
            return true;
        }
        let result = async {
            self.heartbeat().await?;
            let id = self.get_or_create_collection().await?;
            let count = self.count(&id).await?;
            if count == 0 && !self.seed.is_empty() {
                tracing::info!(documents = self.seed.len(), "populating chroma collection");
                self.add(&id, self.seed.clone()).await?;
            }
            Ok::<_, ChromaError>(id)
        }
        .await;
        match result {
            Ok(id) => {
                tracing::info!(collection = %self.collection_name, "chroma backend initialized");
                *slot = Some(id);
                true
            }
            Err(e) => {
                tracing::warn!(url = %self.base_url, error = %e, "chroma backend unavailable");
                false
            }
        }
    }

    async fn query_similar(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Vec<RawHit> {
        match self.query(query, k, filter).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, "chroma query failed");
                Vec::new()
            }
        }
    }

    async fn add_documents(&self, documents: Vec<Document>) -> bool {
        let id = match self.collection().await {
            Ok(id) => id,
            Err(_) => return false,
        };
        match self.add(&id, documents).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "could not add documents to chroma");
                false
            }
        }
    }

    async fn stats(&self) -> BackendStats {
        let id = self.collection_id.read().await.clone();
        let document_count = match id {
            Some(ref id) => self.count(id).await.unwrap_or(0),
            None => 0,
        };
        BackendStats {
            backend: "chroma".to_string(),
            mode: "embedding".to_string(),
            document_count,
            initialized: id.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockEmbedder;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// 进程内的最小 Chroma：一个集合，文档按写入顺序返回
    #[derive(Default)]
    struct StubChroma {
        docs: Mutex<Vec<(Value, Value)>>,
        requests: Mutex<Vec<(String, String, Value)>>,
    }

    impl StubChroma {
        fn respond(&self, method: &str, path: &str, body: &Value) -> (&'static str, Value) {
            self.requests
                .lock()
                .unwrap()
                .push((method.to_string(), path.to_string(), body.clone()));
            let mut docs = self.docs.lock().unwrap();
            match (method, path) {
                ("GET", "/api/v1/heartbeat") => ("200 OK", json!({"nanosecond heartbeat": 1})),
                ("POST", "/api/v1/collections") => ("200 OK", json!({"id": "col-1", "name": body["name"]})),
                ("GET", "/api/v1/collections/col-1/count") => ("200 OK", json!(docs.len())),
                ("POST", "/api/v1/collections/col-1/add") => {
                    let texts = body["documents"].as_array().cloned().unwrap_or_default();
                    let metas = body["metadatas"].as_array().cloned().unwrap_or_default();
                    docs.extend(texts.into_iter().zip(metas));
                    ("201 Created", json!(true))
                }
                ("POST", "/api/v1/collections/col-1/query") => {
                    let n = body["n_results"].as_u64().unwrap_or(1) as usize;
                    let hits: Vec<&(Value, Value)> = docs.iter().take(n).collect();
                    let texts: Vec<Value> = hits.iter().map(|(t, _)| t.clone()).collect();
                    let metas: Vec<Value> = hits.iter().map(|(_, m)| m.clone()).collect();
                    let distances: Vec<f32> = (0..hits.len()).map(|i| 0.1 + 0.5 * i as f32).collect();
                    (
                        "200 OK",
                        json!({"documents": [texts], "metadatas": [metas], "distances": [distances]}),
                    )
                }
                _ => ("404 Not Found", json!({"error": "not found"})),
            }
        }

        fn requests_to(&self, path: &str) -> Vec<Value> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, p, _)| p == path)
                .map(|(_, _, b)| b.clone())
                .collect()
        }
    }

    async fn read_request(stream: &mut TcpStream) -> Option<(String, String, Value)> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = head.lines();
        let mut first = lines.next()?.split_whitespace();
        let method = first.next()?.to_string();
        let path = first.next()?.to_string();
        let length = lines
            .filter_map(|l| l.split_once(':'))
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < header_end + length {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let body = serde_json::from_slice(&buf[header_end..]).unwrap_or(Value::Null);
        Some((method, path, body))
    }

    async fn spawn_stub() -> (String, Arc<StubChroma>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stub = Arc::new(StubChroma::default());
        let shared = stub.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let stub = shared.clone();
                tokio::spawn(async move {
                    let Some((method, path, body)) = read_request(&mut stream).await else {
                        return;
                    };
                    let (status, reply) = stub.respond(&method, &path, &body);
                    let payload = reply.to_string();
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        payload.len(),
                        payload
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        (format!("http://{}", addr), stub)
    }

    fn seed() -> Vec<Document> {
        vec![
            Document::new("1", "rust compiler work")
                .with_source("projects.md")
                .with_metadata("category", "professional"),
            Document::new("2", "sourdough bread on weekends")
                .with_source("about.md")
                .with_metadata("category", "personal"),
        ]
    }

    #[tokio::test]
    async fn test_seeds_queries_and_adds_against_server() {
        let (url, stub) = spawn_stub().await;
        let backend = ChromaBackend::new(&url, "companion", Arc::new(MockEmbedder::default()), seed());

        assert!(backend.initialize().await);
        let created = stub.requests_to("/api/v1/collections");
        assert_eq!(created[0]["name"], "companion");
        assert_eq!(created[0]["metadata"]["hnsw:space"], "cosine");
        let added = stub.requests_to("/api/v1/collections/col-1/add");
        assert_eq!(added.len(), 1);
        assert_eq!(added[0]["ids"], json!(["1", "2"]));
        assert_eq!(added[0]["embeddings"].as_array().map(|a| a.len()), Some(2));
        assert_eq!(added[0]["metadatas"][0]["source"], "projects.md");

        let filter = MetadataFilter::new().with("category", "professional");
        let hits = backend.query_similar("rust compiler", 2, Some(&filter)).await;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "rust compiler work");
        assert_eq!(hits[0].source, "projects.md");
        assert_eq!(hits[0].metadata["category"], "professional");
        assert!((hits[0].score - 0.9).abs() < 1e-5);
        assert!(hits[0].score > hits[1].score);
        let queries = stub.requests_to("/api/v1/collections/col-1/query");
        assert_eq!(queries[0]["where"], json!({"category": "professional"}));
        assert_eq!(queries[0]["n_results"], 2);

        assert!(backend.add_documents(vec![Document::new("3", "kubernetes operator")]).await);
        let stats = backend.stats().await;
        assert!(stats.initialized);
        assert_eq!(stats.document_count, 3);
    }

    #[tokio::test]
    async fn test_existing_collection_is_not_reseeded() {
        let (url, stub) = spawn_stub().await;
        let first = ChromaBackend::new(&url, "companion", Arc::new(MockEmbedder::default()), seed());
        assert!(first.initialize().await);
        let second = ChromaBackend::new(&url, "companion", Arc::new(MockEmbedder::default()), seed());
        assert!(second.initialize().await);
        assert_eq!(stub.requests_to("/api/v1/collections/col-1/add").len(), 1);
    }

    #[test]
    fn test_where_clause_shapes() {
        assert!(where_clause(&MetadataFilter::new()).is_none());
        let single = where_clause(&MetadataFilter::new().with("category", "personal")).unwrap();
        assert_eq!(single, json!({"category": "personal"}));
        let multi = where_clause(
            &MetadataFilter::new()
                .with("category", "personal")
                .with("type", "story"),
        )
        .unwrap();
        assert_eq!(multi["$and"].as_array().map(|a| a.len()), Some(2));
    }

    #[test]
    fn test_flatten_metadata_stringifies() {
        let mut m = HashMap::new();
        m.insert("source".to_string(), json!("resume.yaml"));
        m.insert("year".to_string(), json!(2021));
        let flat = flatten_metadata(Some(m));
        assert_eq!(flat["source"], "resume.yaml");
        assert_eq!(flat["year"], "2021");
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_initialize() {
        // 端口 9 (discard) 通常无人监听
        let backend = ChromaBackend::new(
            "http://127.0.0.1:9",
            "test",
            Arc::new(MockEmbedder::default()),
            vec![],
        );
        assert!(!backend.initialize().await);
        assert!(backend.query_similar("anything", 3, None).await.is_empty());
        assert!(!backend.stats().await.initialized);
    }
}
