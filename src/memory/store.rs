//! 事实/事件存储边界
//!
//! 持久化层是外部协作者：这里只定义协调层依赖的 trait 与数据类型，
//! 具体实现见 in_memory（进程内）与 sqlite（rusqlite）。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 用户档案快照：连接时加载一次，连接存续期内不变
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub username: String,
    pub name: String,
}

impl UserProfile {
    /// 档案缺失时的回退：用 username 充当显示名
    pub fn fallback(username: &str) -> Self {
        Self {
            username: username.to_string(),
            name: username.to_string(),
        }
    }
}

/// 事实子类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactCategory {
    Preference,
    Memory,
    Other,
}

impl FactCategory {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "preference" => Self::Preference,
            "memory" => Self::Memory,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preference => "preference",
            Self::Memory => "memory",
            Self::Other => "other",
        }
    }
}

/// 已存储的事实
#[derive(Debug, Clone)]
pub struct StoredFact {
    pub fact: String,
    pub category: FactCategory,
    pub stored_at: DateTime<Utc>,
}

/// 已存储的待办事件
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub description: String,
    pub event_time: DateTime<Utc>,
}

/// 存储 trait：档案读取、事实/事件写入与检索
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn get_profile(&self, username: &str) -> Result<Option<UserProfile>, String>;

    async fn upsert_profile(&self, profile: &UserProfile) -> Result<(), String>;

    /// 写入事实；同一用户同一事实重复写入视为刷新而非新增
    async fn store_fact(
        &self,
        username: &str,
        fact: &str,
        category: FactCategory,
    ) -> Result<(), String>;

    /// 检索与 query 最相关的 k 条事实
    async fn search_facts(
        &self,
        username: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<StoredFact>, String>;

    /// 新建一条待办事件
    async fn store_event(
        &self,
        username: &str,
        description: &str,
        event_time: DateTime<Utc>,
    ) -> Result<(), String>;

    /// 未来的待办事件，最近的在前
    async fn upcoming_events(
        &self,
        username: &str,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, String>;
}

/// 关键词重合度打分：query 与 fact 共有的词数
///
/// 两个实现共用；向量相似度属于外部存储的事，协调层只依赖这个 trait 口径。
pub(crate) fn keyword_overlap(query: &str, text: &str) -> usize {
    let query_words: Vec<String> = query
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect();
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty() && query_words.contains(w))
        .count()
}
