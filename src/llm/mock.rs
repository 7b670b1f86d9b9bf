//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 维护一个预置应答队列：依次弹出，弹空后回退到固定的 CHAT 分类 JSON，
//! 便于脚本化驱动分类/生成两个节点。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::memory::Message;

/// Mock 客户端：按队列吐出预置应答
#[derive(Debug, Default)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一串应答，按调用顺序弹出
    pub fn with_responses(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_response(&self, response: &str) {
        self.responses.lock().unwrap().push_back(response.to_string());
    }

    /// 累计调用次数
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.responses.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| r#"{"category": "CHAT"}"#.to_string()))
    }
}
