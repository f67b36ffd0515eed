//! 有界对话记忆
//!
//! 工作集只保留最近若干轮；轮数达到阈值时在后台把较早的轮次交给 LLM 摘要，
//! 与已有摘要合并后再移出工作集。每隔若干轮提取一次用户洞察写入长期记忆并落盘。
//!
//! 状态读写走 RwLock；压缩由单独的 Mutex 串行化，LLM 调用期间不持有状态锁，
//! 最终「删前缀 + 写摘要」在同一个写锁临界区内完成，读者只会看到压缩前或压缩后的状态。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::core::AgentError;
use crate::llm::{complete_within, CompletionRequest, LlmClient};
use crate::memory::{
    ContextEntry, ConversationMemoryState, ConversationTurn, MemoryStore, PersistedMemory,
    SessionMetadata,
};
use crate::reasoning::json::parse_json_output;

/// ContextManager 参数
#[derive(Debug, Clone)]
pub struct ContextManagerConfig {
    /// 压缩后保留的轮数
    pub sliding_window_size: usize,
    /// 工作集达到该轮数时触发压缩
    pub summarize_threshold: usize,
    /// 每隔多少轮提取一次洞察；0 表示关闭
    pub insight_interval: usize,
    /// 摘要 / 合并 / 洞察单次调用时限
    pub llm_timeout: Duration,
    /// false 时不调用 LLM：工作集按窗口直接截断，也不落盘
    pub summarization_enabled: bool,
}

impl Default for ContextManagerConfig {
    fn default() -> Self {
        Self {
            sliding_window_size: 6,
            summarize_threshold: 10,
            insight_interval: 5,
            llm_timeout: Duration::from_secs(60),
            summarization_enabled: true,
        }
    }
}

/// 按请求类型挑选的上下文
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub conversation: Vec<ContextEntry>,
    /// 运行摘要；conversation 里没有摘要条目时由生成提示单独带上
    pub summary: Option<String>,
    pub relevant_memory: serde_json::Map<String, Value>,
    pub session: SessionMetadata,
}

/// 对话记忆管理器（可廉价 Clone 的句柄）
#[derive(Clone)]
pub struct ContextManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ContextManagerConfig,
    llm: Arc<dyn LlmClient>,
    store: Option<MemoryStore>,
    state: RwLock<ConversationMemoryState>,
    compaction: Mutex<()>,
    /// 快照与写盘在同一把锁内，后写入的总是较新的快照
    persisting: Mutex<()>,
    compaction_pending: AtomicBool,
    background: StdMutex<Vec<JoinHandle<()>>>,
}

impl ContextManager {
    /// 创建并从 store 加载已持久化的摘要与长期记忆；加载失败时从空状态开始
    pub async fn new(
        config: ContextManagerConfig,
        llm: Arc<dyn LlmClient>,
        store: Option<MemoryStore>,
    ) -> Self {
        let mut state = ConversationMemoryState::default();
        if let Some(ref store) = store {
            match store.load().await {
                Ok(record) => {
                    state.summary = record.summary();
                    state.long_term_memory = record.long_term_memory;
                    state.session_metadata = record.session_metadata;
                    tracing::info!(path = %store.path().display(), "loaded conversation memory");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "could not load memory, starting fresh");
                }
            }
        }

        Self {
            inner: Arc::new(Inner {
                config,
                llm,
                store,
                state: RwLock::new(state),
                compaction: Mutex::new(()),
                persisting: Mutex::new(()),
                compaction_pending: AtomicBool::new(false),
                background: StdMutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &ContextManagerConfig {
        &self.inner.config
    }

    /// 追加一轮；达到阈值时后台压缩，按间隔后台提取洞察，均不阻塞调用方
    pub async fn add_turn(
        &self,
        user_input: impl Into<String>,
        assistant_response: impl Into<String>,
        metadata: HashMap<String, Value>,
    ) {
        let turn = ConversationTurn::new(user_input, assistant_response, metadata);
        let cfg = &self.inner.config;

        let (len, total) = {
            let mut state = self.inner.state.write().await;
            state.session_metadata.record(&turn);
            state.turns.push(turn);
            if !cfg.summarization_enabled && state.turns.len() > cfg.sliding_window_size {
                let excess = state.turns.len() - cfg.sliding_window_size;
                state.turns.drain(..excess);
            }
            (state.turns.len(), state.session_metadata.total_turns)
        };

        if !cfg.summarization_enabled {
            return;
        }

        if len >= cfg.summarize_threshold
            && self
                .inner
                .compaction_pending
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            tracing::info!(turns = len, threshold = cfg.summarize_threshold, "triggering summarization");
            let this = self.clone();
            self.track(tokio::spawn(async move {
                let keep = this.inner.config.sliding_window_size;
                if let Err(e) = this.compact(keep).await {
                    tracing::warn!(error = %e, "summarization failed, keeping all turns");
                }
                this.inner.compaction_pending.store(false, Ordering::Release);
            }));
        }

        if cfg.insight_interval > 0 && total % cfg.insight_interval as u64 == 0 {
            let this = self.clone();
            self.track(tokio::spawn(async move {
                if let Err(e) = this.extract_insights().await {
                    tracing::warn!(error = %e, "insight extraction failed");
                }
            }));
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut handles) = self.inner.background.lock() {
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
        }
    }

    /// 等待所有已触发的后台任务结束
    pub async fn wait_for_background(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = match self.inner.background.lock() {
                Ok(mut h) => h.drain(..).collect(),
                Err(_) => return,
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "background memory task panicked");
                }
            }
        }
    }

    /// 压缩：摘要除最近 keep_recent 轮以外的轮次（与旧摘要合并），然后移出工作集。
    /// 轮数不超过 keep_recent 时什么也不做，返回 Ok(false)。
    /// 任何一次 LLM 调用失败都保留全部轮次并返回错误。
    pub async fn compact(&self, keep_recent: usize) -> Result<bool, AgentError> {
        let _guard = self.inner.compaction.lock().await;

        let (older, existing) = {
            let state = self.inner.state.read().await;
            if state.turns.len() <= keep_recent {
                return Ok(false);
            }
            let cut = state.turns.len() - keep_recent;
            (state.turns[..cut].to_vec(), state.summary.clone())
        };

        let new_summary = self.summarize_turns(&older).await?;
        let summary = match existing {
            Some(old) => self.merge_summaries(&old, &new_summary).await?,
            None => new_summary,
        };

        {
            let mut state = self.inner.state.write().await;
            // 压缩串行化且其他路径只追加，前缀仍是 older
            state.turns.drain(..older.len());
            state.summary = Some(summary);
        }
        tracing::info!(summarized = older.len(), kept = keep_recent, "conversation compacted");

        self.persist().await;
        Ok(true)
    }

    async fn summarize_turns(&self, turns: &[ConversationTurn]) -> Result<String, AgentError> {
        let mut conversation = String::new();
        for t in turns {
            conversation.push_str(&format!(
                "\nUser: {}\nAssistant: {}\n",
                t.user_input, t.assistant_response
            ));
        }
        let prompt = format!(
            "Summarize this conversation, focusing on:\n\
             1. Key topics discussed\n\
             2. User goals and interests that emerged\n\
             3. Important context about the user's situation\n\
             4. Progression of the conversation\n\
             5. Any insights about the user's preferences or communication style\n\n\
             Conversation to summarize:\n{}\n\n\
             Create a concise but comprehensive summary that will help provide context for future conversations.",
            conversation
        );
        self.ask(prompt, 500).await
    }

    async fn merge_summaries(&self, existing: &str, new: &str) -> Result<String, AgentError> {
        let prompt = format!(
            "Merge these two conversation summaries into one coherent summary:\n\n\
             EXISTING SUMMARY:\n{}\n\nNEW SUMMARY:\n{}\n\n\
             Create a comprehensive summary that captures the key themes, insights, and progression of the conversation.",
            existing, new
        );
        self.ask(prompt, 600).await
    }

    async fn ask(&self, prompt: String, max_tokens: u32) -> Result<String, AgentError> {
        let request = CompletionRequest::user(prompt)
            .with_temperature(0.3)
            .with_max_tokens(max_tokens);
        let completion =
            complete_within(self.inner.llm.as_ref(), &request, self.inner.config.llm_timeout).await?;
        let text = completion.text.trim().to_string();
        if text.is_empty() {
            return Err(AgentError::JsonParse("empty summary".to_string()));
        }
        Ok(text)
    }

    /// 对最近若干轮提取分类洞察并合并进长期记忆；少于 3 轮时不提取。
    /// 输出无法解析时记录日志并丢弃，返回空 map。
    pub async fn extract_insights(&self) -> Result<serde_json::Map<String, Value>, AgentError> {
        let window = self.inner.config.insight_interval.max(1);
        let recent: Vec<ConversationTurn> = {
            let state = self.inner.state.read().await;
            if state.turns.len() < 3 {
                return Ok(serde_json::Map::new());
            }
            let start = state.turns.len().saturating_sub(window);
            state.turns[start..].to_vec()
        };

        let mut formatted = String::new();
        for t in &recent {
            formatted.push_str(&format!("User: {}\nAssistant: {}\n\n", t.user_input, t.assistant_response));
        }
        let prompt = format!(
            "Analyze this conversation and extract key insights about the user:\n\n{}\n\
             Extract insights in these categories:\n\
             1. PREFERENCES: User preferences, likes, dislikes\n\
             2. GOALS: User goals, aspirations, objectives\n\
             3. CONTEXT: Important context about user's situation\n\
             4. COMMUNICATION_STYLE: How the user prefers to communicate\n\
             5. TOPICS_OF_INTEREST: What the user is interested in discussing\n\n\
             Return as JSON with these keys. Only include insights that are clearly evident.",
            formatted
        );
        let request = CompletionRequest::user(prompt)
            .with_temperature(0.3)
            .with_max_tokens(400);
        let completion =
            complete_within(self.inner.llm.as_ref(), &request, self.inner.config.llm_timeout).await?;

        let insights: serde_json::Map<String, Value> = match parse_json_output(&completion.text) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "could not parse insights, discarding");
                return Ok(serde_json::Map::new());
            }
        };

        let changed = {
            let mut state = self.inner.state.write().await;
            state.merge_insights(insights.clone())
        };
        if changed {
            self.persist().await;
        }
        Ok(insights)
    }

    /// 写入一条长期记忆并落盘
    pub async fn update_long_term_memory(&self, key: impl Into<String>, value: Value) {
        {
            let mut state = self.inner.state.write().await;
            state.long_term_memory.insert(key.into(), value);
        }
        self.persist().await;
    }

    /// 最近 turns_back 轮；工作集超过滑动窗口且已有摘要时，摘要条目放在最前
    pub async fn get_conversation_context(&self, turns_back: usize) -> Vec<ContextEntry> {
        let state = self.inner.state.read().await;
        let mut out = Vec::with_capacity(turns_back + 1);
        if let Some(ref summary) = state.summary {
            if state.turns.len() > self.inner.config.sliding_window_size {
                out.push(ContextEntry::Summary(summary.clone()));
            }
        }
        let start = state.turns.len().saturating_sub(turns_back);
        out.extend(state.turns[start..].iter().cloned().map(ContextEntry::Turn));
        out
    }

    /// 按请求类型挑选相关的长期记忆
    pub async fn context_for_request(&self, request_type: &str) -> RequestContext {
        let conversation = self
            .get_conversation_context(self.inner.config.sliding_window_size)
            .await;
        let state = self.inner.state.read().await;
        let pick = |keys: &[(&str, &str)]| {
            let mut m = serde_json::Map::new();
            for (out_key, category) in keys {
                let v = state
                    .long_term_memory
                    .get(*category)
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default()));
                m.insert(out_key.to_string(), v);
            }
            m
        };
        let relevant_memory = if request_type.contains("resume") {
            pick(&[("goals", "GOALS"), ("experience", "CONTEXT"), ("preferences", "PREFERENCES")])
        } else if request_type.contains("explain") {
            pick(&[
                ("communication_style", "COMMUNICATION_STYLE"),
                ("topics_of_interest", "TOPICS_OF_INTEREST"),
            ])
        } else {
            state.long_term_memory.clone()
        };
        RequestContext {
            conversation,
            summary: state.summary.clone(),
            relevant_memory,
            session: state.session_metadata.clone(),
        }
    }

    pub async fn summary(&self) -> Option<String> {
        self.inner.state.read().await.summary.clone()
    }

    pub async fn long_term_memory(&self) -> serde_json::Map<String, Value> {
        self.inner.state.read().await.long_term_memory.clone()
    }

    pub async fn session_metadata(&self) -> SessionMetadata {
        self.inner.state.read().await.session_metadata.clone()
    }

    pub async fn turn_count(&self) -> usize {
        self.inner.state.read().await.turns.len()
    }

    pub async fn turns(&self) -> Vec<ConversationTurn> {
        self.inner.state.read().await.turns.clone()
    }

    async fn persist(&self) {
        let Some(ref store) = self.inner.store else {
            return;
        };
        let _guard = self.inner.persisting.lock().await;
        let record = {
            let state = self.inner.state.read().await;
            PersistedMemory {
                conversation_summary: state.summary.clone().unwrap_or_default(),
                long_term_memory: state.long_term_memory.clone(),
                session_metadata: state.session_metadata.clone(),
                last_updated: Some(Utc::now()),
            }
        };
        if let Err(e) = store.save(&record).await {
            tracing::warn!(error = %e, "could not save memory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient};
    use serde_json::json;

    fn summarizer() -> MockLlmClient {
        MockLlmClient::new(|req| {
            let prompt = &req.messages[0].content;
            if prompt.starts_with("Merge") {
                Ok("merged summary".to_string())
            } else if prompt.starts_with("Analyze") {
                Ok(r#"{"GOALS": {"career": "compilers"}, "PREFERENCES": ""}"#.to_string())
            } else {
                Ok("summary of older turns".to_string())
            }
        })
    }

    fn config(window: usize, threshold: usize) -> ContextManagerConfig {
        ContextManagerConfig {
            sliding_window_size: window,
            summarize_threshold: threshold,
            insight_interval: 0,
            ..Default::default()
        }
    }

    async fn manager_with(llm: MockLlmClient, cfg: ContextManagerConfig) -> ContextManager {
        ContextManager::new(cfg, Arc::new(llm), None).await
    }

    async fn fill(cm: &ContextManager, n: usize) {
        for i in 0..n {
            cm.add_turn(format!("q{}", i), format!("a{}", i), HashMap::new()).await;
        }
    }

    #[tokio::test]
    async fn test_compact_keeps_exactly_recent_and_sets_summary() {
        let cm = manager_with(summarizer(), config(3, 100)).await;
        fill(&cm, 8).await;

        assert!(cm.compact(3).await.unwrap());
        let turns = cm.turns().await;
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].user_input, "q5");
        assert_eq!(cm.summary().await.as_deref(), Some("summary of older turns"));
    }

    #[tokio::test]
    async fn test_compact_noop_when_short() {
        let llm = summarizer();
        let cm = manager_with(llm.clone(), config(6, 100)).await;
        fill(&cm, 4).await;

        assert!(!cm.compact(6).await.unwrap());
        assert_eq!(cm.turn_count().await, 4);
        assert!(cm.summary().await.is_none());
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_second_compaction_merges_summaries() {
        let llm = summarizer();
        let cm = manager_with(llm.clone(), config(2, 100)).await;
        fill(&cm, 4).await;
        cm.compact(2).await.unwrap();
        fill(&cm, 3).await;
        cm.compact(2).await.unwrap();

        assert_eq!(cm.summary().await.as_deref(), Some("merged summary"));
        assert_eq!(cm.turn_count().await, 2);
        // 摘要、摘要+合并
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn test_turns_added_during_compaction_are_kept_in_order() {
        let llm = summarizer().with_delay(std::time::Duration::from_millis(100));
        let cm = manager_with(llm, config(3, 100)).await;
        fill(&cm, 6).await;

        let compacting = cm.clone();
        let handle = tokio::spawn(async move { compacting.compact(3).await });
        // 摘要调用进行中追加
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cm.add_turn("late0", "b0", HashMap::new()).await;
        cm.add_turn("late1", "b1", HashMap::new()).await;

        assert!(handle.await.unwrap().unwrap());
        let inputs: Vec<String> = cm.turns().await.into_iter().map(|t| t.user_input).collect();
        assert_eq!(inputs, vec!["q3", "q4", "q5", "late0", "late1"]);
        assert_eq!(cm.summary().await.as_deref(), Some("summary of older turns"));
        assert_eq!(cm.session_metadata().await.total_turns, 8);
    }

    #[tokio::test]
    async fn test_failed_summary_keeps_all_turns() {
        let cm = manager_with(MockLlmClient::failing(), config(2, 100)).await;
        fill(&cm, 5).await;
        assert!(cm.compact(2).await.is_err());
        assert_eq!(cm.turn_count().await, 5);
        assert!(cm.summary().await.is_none());
    }

    #[tokio::test]
    async fn test_threshold_triggers_background_compaction() {
        let cm = manager_with(summarizer(), config(6, 10)).await;
        fill(&cm, 9).await;
        cm.wait_for_background().await;
        assert_eq!(cm.turn_count().await, 9);

        fill(&cm, 1).await;
        cm.wait_for_background().await;
        assert_eq!(cm.turn_count().await, 6);
        assert!(cm.summary().await.is_some());
    }

    #[tokio::test]
    async fn test_context_puts_summary_before_recent_turns() {
        let cm = manager_with(summarizer(), config(2, 100)).await;
        fill(&cm, 5).await;
        cm.compact(2).await.unwrap();
        // 压缩后工作集恰为窗口大小：不带摘要条目
        fill(&cm, 1).await;

        let ctx = cm.get_conversation_context(1).await;
        assert_eq!(ctx.len(), 2);
        assert!(matches!(ctx[0], ContextEntry::Summary(_)));
        match &ctx[1] {
            ContextEntry::Turn(t) => assert_eq!(t.user_input, "q0"),
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_summary_entry_while_turns_fit_window() {
        let cm = manager_with(summarizer(), config(6, 10)).await;
        fill(&cm, 10).await;
        cm.wait_for_background().await;
        assert_eq!(cm.turn_count().await, 6);
        assert!(cm.summary().await.is_some());

        let ctx = cm.get_conversation_context(6).await;
        assert_eq!(ctx.len(), 6);
        assert!(ctx.iter().all(|e| matches!(e, ContextEntry::Turn(_))));
        // 摘要仍随请求上下文提供给生成环节
        let request_ctx = cm.context_for_request("general").await;
        assert_eq!(request_ctx.summary.as_deref(), Some("summary of older turns"));

        // 再多一轮就超出窗口，摘要条目出现在最前
        fill(&cm, 1).await;
        let ctx = cm.get_conversation_context(6).await;
        assert_eq!(ctx.len(), 7);
        assert!(matches!(ctx[0], ContextEntry::Summary(_)));
    }

    #[tokio::test]
    async fn test_insights_merge_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path().join("memory.json"));
        let cfg = ContextManagerConfig {
            insight_interval: 5,
            ..config(6, 100)
        };
        let cm = ContextManager::new(cfg.clone(), Arc::new(summarizer()), Some(store.clone())).await;
        fill(&cm, 5).await;
        cm.wait_for_background().await;

        let ltm = cm.long_term_memory().await;
        assert_eq!(ltm["GOALS"], json!({"career": "compilers"}));
        assert!(!ltm.contains_key("PREFERENCES"));

        let reloaded = ContextManager::new(cfg, Arc::new(summarizer()), Some(store)).await;
        assert_eq!(reloaded.long_term_memory().await, ltm);
        assert_eq!(reloaded.turn_count().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_insights_are_discarded() {
        let llm = MockLlmClient::new(|_| Ok("no json here".to_string()));
        let cm = manager_with(llm, config(6, 100)).await;
        fill(&cm, 4).await;
        let insights = cm.extract_insights().await.unwrap();
        assert!(insights.is_empty());
        assert!(cm.long_term_memory().await.is_empty());
        assert_eq!(cm.turn_count().await, 4);
    }

    #[tokio::test]
    async fn test_insight_provider_error_surfaces() {
        let llm = MockLlmClient::new(|_| Err(LlmError::Api("boom".into())));
        let cm = manager_with(llm, config(6, 100)).await;
        fill(&cm, 3).await;
        assert!(matches!(cm.extract_insights().await, Err(AgentError::Llm(_))));
    }

    #[tokio::test]
    async fn test_disabled_summarization_truncates_to_window() {
        let llm = summarizer();
        let cfg = ContextManagerConfig {
            summarization_enabled: false,
            ..config(3, 4)
        };
        let cm = manager_with(llm.clone(), cfg).await;
        fill(&cm, 10).await;
        cm.wait_for_background().await;
        assert_eq!(cm.turn_count().await, 3);
        assert_eq!(llm.call_count(), 0);
        assert_eq!(cm.session_metadata().await.total_turns, 10);
    }

    #[tokio::test]
    async fn test_context_for_resume_picks_goal_memory() {
        let cm = manager_with(summarizer(), config(6, 100)).await;
        cm.update_long_term_memory("GOALS", json!({"role": "staff engineer"})).await;
        cm.update_long_term_memory("TOPICS_OF_INTEREST", json!(["rust"])).await;

        let ctx = cm.context_for_request("resume_generation").await;
        assert_eq!(ctx.relevant_memory["goals"], json!({"role": "staff engineer"}));
        assert!(!ctx.relevant_memory.contains_key("TOPICS_OF_INTEREST"));

        let general = cm.context_for_request("general").await;
        assert!(general.relevant_memory.contains_key("TOPICS_OF_INTEREST"));
    }
}
