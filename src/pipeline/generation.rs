//! 生成节点（条件执行）
//!
//! 仅当还欠用户一条文本回复时运行（audio_mode = false）；
//! 提示由档案、检索到的事实/事件、近期历史与分类摘要组成。
//! 任何失败都落到固定的致歉串，不向外传播。

use std::sync::Arc;

use crate::llm::LlmClient;
use crate::memory::{MemoryStore, Message, Role};
use crate::pipeline::state::PipelineState;

/// 生成彻底失败时的回退回复
pub const FALLBACK_REPLY: &str = "I'm having trouble generating a response right now.";

/// 生成节点
pub struct GenerationNode {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn MemoryStore>,
    top_k_facts: usize,
    upcoming_events_limit: usize,
}

impl GenerationNode {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn MemoryStore>,
        top_k_facts: usize,
        upcoming_events_limit: usize,
    ) -> Self {
        Self {
            llm,
            store,
            top_k_facts,
            upcoming_events_limit,
        }
    }

    /// 执行节点：audio_mode 下短路为空回复
    pub async fn run(&self, state: &mut PipelineState) {
        if state.audio_mode {
            state.final_response = String::new();
            return;
        }

        let prompt = self.compose_prompt(state).await;
        let messages = vec![
            Message::system(prompt),
            Message::user(state.input_text.clone()),
        ];

        state.final_response = match self.llm.complete(&messages).await {
            Ok(reply) => reply.trim().to_string(),
            Err(e) => {
                tracing::warn!("generation failed for {}: {}", state.username, e);
                FALLBACK_REPLY.to_string()
            }
        };
    }

    async fn compose_prompt(&self, state: &PipelineState) -> String {
        // 检索失败降级为空集合：grounding 是增强项，不是正确性前提
        let facts = self
            .store
            .search_facts(&state.username, &state.input_text, self.top_k_facts)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("fact retrieval failed for {}: {}", state.username, e);
                Vec::new()
            });
        let events = self
            .store
            .upcoming_events(&state.username, self.upcoming_events_limit)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("event retrieval failed for {}: {}", state.username, e);
                Vec::new()
            });

        let facts_str = if facts.is_empty() {
            "None".to_string()
        } else {
            facts
                .iter()
                .map(|f| format!("- {}", f.fact))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let events_str = if events.is_empty() {
            "None".to_string()
        } else {
            events
                .iter()
                .map(|e| format!("- {} at {}", e.description, e.event_time.format("%Y-%m-%d %H:%M UTC")))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let history_str = if state.chat_history.is_empty() {
            "No previous messages".to_string()
        } else {
            let skip = state.chat_history.len().saturating_sub(5);
            state.chat_history[skip..]
                .iter()
                .map(|m| {
                    let role = match m.role {
                        Role::User => "user",
                        Role::Assistant => "assistant",
                        Role::System => "system",
                    };
                    format!("{}: {}", role, m.content)
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let reasoning_section = if state.reasoning_context.is_empty() {
            String::new()
        } else {
            format!("\nRecent context (from reasoning):\n{}\n", state.reasoning_context)
        };

        format!(
            "You are an AI companion. You are talking to {name}.\n\n\
             Relevant memories:\n{facts}\n\n\
             Upcoming events:\n{events}\n\n\
             Chat history:\n{history}\n\
             {reasoning}\n\
             Respond naturally, empathetically, and concisely to the user. \
             If the recent context shows a fact was just stored or an event was scheduled, acknowledge it warmly.",
            name = state.profile.name,
            facts = facts_str,
            events = events_str,
            history = history_str,
            reasoning = reasoning_section,
        )
    }
}
