//! 分类抽取节点
//!
//! 对每条冲刷话语恰好调用一次外部推理函数，产出 ReasoningResult：
//! - CHAT：无副作用
//! - FACT：向存储写入一条事实（恰好一次）
//! - EVENT：钳制时间偏移后写入一条待办事件（恰好一次）
//!
//! 推理应答不可解析属可恢复失败：降级为 CHAT 并在摘要中注明，绝不抛出流水线。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::llm::LlmClient;
use crate::memory::{FactCategory, MemoryStore, Message};
use crate::pipeline::state::PipelineState;

const CLASSIFY_PROMPT: &str = r#"Analyze the user's input and classify it into ONE category.

- FACT: the user states a preference, habit, or memory (e.g. "I like pizza", "My birthday is in June").
- EVENT: the user mentions a task, meeting, or reminder (e.g. "Remind me to buy milk", "Meeting tomorrow at 9").
- CHAT: general conversation.

Respond with ONLY a JSON object, no explanation:
{"category": "CHAT" | "FACT" | "EVENT",
 "fact": "<the core fact statement, FACT only>",
 "fact_category": "preference" | "memory" | "other" (FACT only),
 "description": "<the event description, EVENT only>",
 "time_offset_minutes": <integer estimate, EVENT only>}"#;

/// 检测出的意图类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentCategory {
    Chat,
    Fact,
    Event,
}

/// 一次话语的分类抽取结果（瞬态值，仅其副作用被持久化）
#[derive(Debug, Clone)]
pub struct ReasoningResult {
    pub category: IntentCategory,
    pub fact: Option<(String, FactCategory)>,
    pub event: Option<(String, DateTime<Utc>)>,
    pub summary: String,
}

impl ReasoningResult {
    fn chat(summary: impl Into<String>) -> Self {
        Self {
            category: IntentCategory::Chat,
            fact: None,
            event: None,
            summary: summary.into(),
        }
    }
}

/// 推理应答的原始抽取字段（模型可能在 JSON 外包裹文字，先截取再解析）
#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    category: String,
    #[serde(default)]
    fact: Option<String>,
    #[serde(default)]
    fact_category: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    time_offset_minutes: Option<i64>,
}

/// 从应答文本中截取首个 `{` 到末个 `}` 并解析
fn salvage_json(raw: &str) -> Result<RawExtraction, String> {
    let start = raw.find('{').ok_or("no JSON object in response")?;
    let end = raw.rfind('}').ok_or("no JSON object in response")?;
    if end < start {
        return Err("no JSON object in response".to_string());
    }
    serde_json::from_str(&raw[start..=end]).map_err(|e| e.to_string())
}

/// 偏移钳制：负值归零，超出上限取上限
fn clamp_offset_minutes(minutes: i64, max: i64) -> i64 {
    minutes.clamp(0, max)
}

/// 由固定 now 与（钳制后的）偏移算出事件时间
fn event_time_from_offset(now: DateTime<Utc>, minutes: i64, max: i64) -> DateTime<Utc> {
    now + Duration::minutes(clamp_offset_minutes(minutes, max))
}

/// 分类抽取节点
pub struct ReasoningNode {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn MemoryStore>,
    max_offset_minutes: i64,
}

impl ReasoningNode {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<dyn MemoryStore>, max_offset_minutes: i64) -> Self {
        Self {
            llm,
            store,
            max_offset_minutes,
        }
    }

    /// 执行节点：分类、抽取、持久化，摘要写回 state
    pub async fn run(&self, state: &mut PipelineState) -> ReasoningResult {
        let result = self.classify(&state.input_text, &state.username).await;
        state.reasoning_context = result.summary.clone();
        result
    }

    async fn classify(&self, input_text: &str, username: &str) -> ReasoningResult {
        let messages = vec![
            Message::system(CLASSIFY_PROMPT),
            Message::user(format!("Input: {}", input_text)),
        ];

        let raw = match self.llm.complete(&messages).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("reasoning call failed, degrading to CHAT: {}", e);
                return ReasoningResult::chat(
                    "Intent detected: CHAT (reasoning unavailable)",
                );
            }
        };

        let extraction = match salvage_json(&raw) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("unparseable reasoning response, degrading to CHAT: {}", e);
                return ReasoningResult::chat(format!(
                    "Intent detected: CHAT (failed to parse extraction: {})",
                    e
                ));
            }
        };

        let category = extraction.category.trim().to_uppercase();
        if category.contains("FACT") {
            self.handle_fact(username, extraction).await
        } else if category.contains("EVENT") {
            self.handle_event(username, extraction).await
        } else {
            ReasoningResult::chat("Intent detected: CHAT")
        }
    }

    async fn handle_fact(&self, username: &str, extraction: RawExtraction) -> ReasoningResult {
        let Some(fact) = extraction.fact.filter(|f| !f.trim().is_empty()) else {
            return ReasoningResult::chat("Intent detected: CHAT (no fact extracted)");
        };
        let fact = fact.trim().to_string();
        let category = extraction
            .fact_category
            .as_deref()
            .map(FactCategory::parse)
            .unwrap_or(FactCategory::Other);

        let mut summary = format!("Intent detected: FACT. Stored fact: {}", fact);
        if let Err(e) = self.store.store_fact(username, &fact, category).await {
            tracing::warn!("fact persistence failed for {}: {}", username, e);
            summary = format!("Intent detected: FACT. Could not store fact: {}", fact);
        }

        ReasoningResult {
            category: IntentCategory::Fact,
            fact: Some((fact, category)),
            event: None,
            summary,
        }
    }

    async fn handle_event(&self, username: &str, extraction: RawExtraction) -> ReasoningResult {
        let description = extraction
            .description
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| "Untitled event".to_string())
            .trim()
            .to_string();
        let minutes = extraction.time_offset_minutes.unwrap_or(60);
        let event_time = event_time_from_offset(Utc::now(), minutes, self.max_offset_minutes);

        let mut summary = format!(
            "Intent detected: EVENT. Scheduled: {} at {}",
            description,
            event_time.format("%Y-%m-%d %H:%M UTC")
        );
        if let Err(e) = self.store.store_event(username, &description, event_time).await {
            tracing::warn!("event persistence failed for {}: {}", username, e);
            summary = format!("Intent detected: EVENT. Could not schedule: {}", description);
        }

        ReasoningResult {
            category: IntentCategory::Event,
            fact: None,
            event: Some((description, event_time)),
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::memory::{InMemoryStore, UserProfile};

    fn state(input: &str) -> PipelineState {
        PipelineState::new(input, "ada", Vec::new(), UserProfile::fallback("ada"), true)
    }

    #[test]
    fn test_clamp_offset() {
        assert_eq!(clamp_offset_minutes(-30, 525_600), 0);
        assert_eq!(clamp_offset_minutes(60, 525_600), 60);
        assert_eq!(clamp_offset_minutes(9_999_999, 525_600), 525_600);
    }

    #[test]
    fn test_event_time_exact() {
        let now = Utc::now();
        let t = event_time_from_offset(now, 60, 525_600);
        assert_eq!(t, now + Duration::minutes(60));
    }

    #[test]
    fn test_salvage_json_with_surrounding_prose() {
        let raw = r#"Sure! Here is the result: {"category": "EVENT", "description": "Buy milk", "time_offset_minutes": 60} Hope that helps."#;
        let extraction = salvage_json(raw).unwrap();
        assert_eq!(extraction.category, "EVENT");
        assert_eq!(extraction.description.as_deref(), Some("Buy milk"));
    }

    #[tokio::test]
    async fn test_malformed_response_degrades_to_chat() {
        let llm = Arc::new(MockLlmClient::with_responses(vec!["not json at all"]));
        let store = Arc::new(InMemoryStore::new());
        let node = ReasoningNode::new(llm, Arc::clone(&store) as _, 525_600);

        let mut s = state("hello there");
        let result = node.run(&mut s).await;
        assert_eq!(result.category, IntentCategory::Chat);
        assert!(s.reasoning_context.contains("CHAT"));
        assert!(s.reasoning_context.contains("failed to parse"));
        assert_eq!(store.fact_count("ada").await, 0);
    }

    #[tokio::test]
    async fn test_fact_stored_exactly_once() {
        let llm = Arc::new(MockLlmClient::with_responses(vec![
            r#"{"category": "FACT", "fact": "likes pizza", "fact_category": "preference"}"#,
        ]));
        let store = Arc::new(InMemoryStore::new());
        let node = ReasoningNode::new(Arc::clone(&llm) as _, Arc::clone(&store) as _, 525_600);

        let mut s = state("I like pizza");
        let result = node.run(&mut s).await;
        assert_eq!(result.category, IntentCategory::Fact);
        assert_eq!(store.fact_count("ada").await, 1);
        assert_eq!(llm.call_count(), 1);
        assert!(s.reasoning_context.contains("likes pizza"));
    }

    #[tokio::test]
    async fn test_event_with_negative_offset_clamped() {
        let llm = Arc::new(MockLlmClient::with_responses(vec![
            r#"{"category": "EVENT", "description": "call mom", "time_offset_minutes": -500}"#,
        ]));
        let store = Arc::new(InMemoryStore::new());
        let node = ReasoningNode::new(llm, Arc::clone(&store) as _, 525_600);

        let before = Utc::now();
        let mut s = state("Remind me to call mom");
        let result = node.run(&mut s).await;

        assert_eq!(result.category, IntentCategory::Event);
        let (description, event_time) = result.event.unwrap();
        assert_eq!(description, "call mom");
        // 负偏移钳制为 0：事件时间不早于调用前一刻
        assert!(event_time >= before);
        assert_eq!(store.event_count("ada").await, 1);
    }

    #[tokio::test]
    async fn test_llm_error_degrades_without_persistence() {
        struct FailingLlm;
        #[async_trait::async_trait]
        impl crate::llm::LlmClient for FailingLlm {
            async fn complete(&self, _m: &[Message]) -> Result<String, String> {
                Err("connection refused".to_string())
            }
        }

        let store = Arc::new(InMemoryStore::new());
        let node = ReasoningNode::new(Arc::new(FailingLlm), Arc::clone(&store) as _, 525_600);

        let mut s = state("Remind me to call mom");
        let result = node.run(&mut s).await;
        assert_eq!(result.category, IntentCategory::Chat);
        assert_eq!(store.event_count("ada").await, 0);
    }
}
