//! 上下文注入
//!
//! 每次话语处理完成后：检索最相关的事实与最近的待办事件，
//! 连同分类摘要拼成一段 grounding 文本回注给音频侧，
//! 让语音端点的下一句回复落在已知信息上。
//!
//! 对调用方是 fire-and-forget：grounding 是增强项而非正确性前提，
//! 失败只记日志，不向上传播。

use std::sync::Arc;

use crate::memory::MemoryStore;

use super::registry::{Injection, SessionRegistry};

/// 上下文注入器
pub struct ContextInjector {
    store: Arc<dyn MemoryStore>,
    top_k_facts: usize,
    upcoming_events_limit: usize,
}

impl ContextInjector {
    pub fn new(store: Arc<dyn MemoryStore>, top_k_facts: usize, upcoming_events_limit: usize) -> Self {
        Self {
            store,
            top_k_facts,
            upcoming_events_limit,
        }
    }

    /// 组装 grounding 串并注入音频侧
    pub async fn inject(
        &self,
        registry: &SessionRegistry,
        username: &str,
        utterance: &str,
        summary: &str,
    ) {
        let grounding = self.compose(username, utterance, summary).await;
        match registry.inject_context(username, &grounding).await {
            Injection::Injected => {
                tracing::debug!("grounding injected for {}", username);
            }
            Injection::NotReady => {
                tracing::debug!("audio side not ready for {}, grounding deferred", username);
            }
        }
    }

    async fn compose(&self, username: &str, utterance: &str, summary: &str) -> String {
        let facts = self
            .store
            .search_facts(username, utterance, self.top_k_facts)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("fact retrieval failed for {}: {}", username, e);
                Vec::new()
            });
        let events = self
            .store
            .upcoming_events(username, self.upcoming_events_limit)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("event retrieval failed for {}: {}", username, e);
                Vec::new()
            });

        let mut parts = vec![summary.to_string()];
        if !facts.is_empty() {
            let list = facts
                .iter()
                .map(|f| f.fact.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            parts.push(format!("Known facts: {}", list));
        }
        if !events.is_empty() {
            let list = events
                .iter()
                .map(|e| format!("{} at {}", e.description, e.event_time.format("%Y-%m-%d %H:%M UTC")))
                .collect::<Vec<_>>()
                .join("; ");
            parts.push(format!("Upcoming events: {}", list));
        }
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FactCategory, InMemoryStore, MemoryStore};
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_compose_includes_facts_events_and_summary() {
        let store = Arc::new(InMemoryStore::new());
        store
            .store_fact("ada", "likes pizza", FactCategory::Preference)
            .await
            .unwrap();
        store
            .store_event("ada", "call mom", Utc::now() + Duration::minutes(30))
            .await
            .unwrap();

        let injector = ContextInjector::new(Arc::clone(&store) as _, 5, 5);
        let grounding = injector
            .compose("ada", "pizza tonight?", "Intent detected: CHAT")
            .await;

        assert!(grounding.starts_with("Intent detected: CHAT"));
        assert!(grounding.contains("likes pizza"));
        assert!(grounding.contains("call mom"));
    }

    #[tokio::test]
    async fn test_compose_without_memories_is_just_summary() {
        let store = Arc::new(InMemoryStore::new());
        let injector = ContextInjector::new(store, 5, 5);
        let grounding = injector.compose("ada", "hi", "Intent detected: CHAT").await;
        assert_eq!(grounding, "Intent detected: CHAT");
    }
}
