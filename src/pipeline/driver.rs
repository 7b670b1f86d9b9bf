//! 两节点流水线驱动
//!
//! 顺序固定：分类抽取先完成再考虑生成，生成的提示依赖刚写入的事实/事件。

use std::sync::Arc;

use crate::config::ReasoningSection;
use crate::llm::LlmClient;
use crate::memory::MemoryStore;
use crate::pipeline::generation::GenerationNode;
use crate::pipeline::reasoning::{ReasoningNode, ReasoningResult};
use crate::pipeline::state::PipelineState;

/// 流水线驱动：持有两个节点，run 消费并返回状态
pub struct PipelineDriver {
    reasoning: ReasoningNode,
    generation: GenerationNode,
}

impl PipelineDriver {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn MemoryStore>,
        section: &ReasoningSection,
    ) -> Self {
        Self {
            reasoning: ReasoningNode::new(
                Arc::clone(&llm),
                Arc::clone(&store),
                section.max_offset_minutes,
            ),
            generation: GenerationNode::new(
                llm,
                store,
                section.top_k_facts,
                section.upcoming_events_limit,
            ),
        }
    }

    /// 跑完整条流水线；节点内部各自降级，此处不会失败
    pub async fn run(&self, mut state: PipelineState) -> (PipelineState, ReasoningResult) {
        let result = self.reasoning.run(&mut state).await;
        self.generation.run(&mut state).await;
        (state, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::memory::{InMemoryStore, UserProfile};
    use crate::pipeline::reasoning::IntentCategory;

    #[tokio::test]
    async fn test_classification_runs_before_generation() {
        // 第一应答给分类节点，第二应答给生成节点
        let llm = Arc::new(MockLlmClient::with_responses(vec![
            r#"{"category": "FACT", "fact": "likes pizza", "fact_category": "preference"}"#,
            "Noted, you like pizza!",
        ]));
        let store = Arc::new(InMemoryStore::new());
        let driver = PipelineDriver::new(
            Arc::clone(&llm) as _,
            Arc::clone(&store) as _,
            &ReasoningSection::default(),
        );

        let state = PipelineState::new(
            "I like pizza",
            "ada",
            Vec::new(),
            UserProfile::fallback("ada"),
            false,
        );
        let (state, result) = driver.run(state).await;

        assert_eq!(result.category, IntentCategory::Fact);
        assert_eq!(state.final_response, "Noted, you like pizza!");
        // 生成节点运行时事实已可检索
        assert_eq!(store.fact_count("ada").await, 1);
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_audio_mode_runs_extraction_only() {
        let llm = Arc::new(MockLlmClient::with_responses(vec![
            r#"{"category": "EVENT", "description": "call mom", "time_offset_minutes": 60}"#,
        ]));
        let store = Arc::new(InMemoryStore::new());
        let driver = PipelineDriver::new(
            Arc::clone(&llm) as _,
            Arc::clone(&store) as _,
            &ReasoningSection::default(),
        );

        let state = PipelineState::new(
            "Remind me to call mom",
            "ada",
            Vec::new(),
            UserProfile::fallback("ada"),
            true,
        );
        let (state, result) = driver.run(state).await;

        assert_eq!(result.category, IntentCategory::Event);
        assert!(state.final_response.is_empty());
        assert_eq!(store.event_count("ada").await, 1);
        // audio_mode 下生成节点未调用 LLM
        assert_eq!(llm.call_count(), 1);
    }
}
