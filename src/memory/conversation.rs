//! 短期记忆：对话历史
//!
//! 有界环形缓冲：保留最近 N 轮对话（user/assistant 对），插入顺序保持，
//! 超出时最旧的先被驱逐，供流水线上下文与生成提示使用。

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 对话历史环形缓冲：最多 max_turns 轮（每轮约 user + assistant 两条）
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    messages: VecDeque<Message>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            max_turns,
        }
    }

    /// 追加一条消息；超出容量时从队首驱逐最旧的
    pub fn push(&mut self, msg: Message) {
        self.messages.push_back(msg);
        while self.messages.len() > self.max_turns * 2 {
            self.messages.pop_front();
        }
    }

    /// 按插入顺序复制全部消息（供流水线快照使用）
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    /// 最近 n 条消息，按插入顺序
    pub fn recent(&self, n: usize) -> Vec<Message> {
        let skip = self.messages.len().saturating_sub(n);
        self.messages.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
