//! 进程内存储：按用户隔离的事实/事件/档案
//!
//! 默认后端（未配置 SQLite 路径时），也是测试用的标准替身。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::store::{
    keyword_overlap, FactCategory, MemoryStore, StoredEvent, StoredFact, UserProfile,
};

#[derive(Default)]
struct UserRecord {
    profile: Option<UserProfile>,
    facts: Vec<StoredFact>,
    events: Vec<StoredEvent>,
}

/// 进程内事实/事件存储
#[derive(Default)]
pub struct InMemoryStore {
    users: RwLock<HashMap<String, UserRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 某用户当前存储的事实条数（测试断言用）
    pub async fn fact_count(&self, username: &str) -> usize {
        self.users
            .read()
            .await
            .get(username)
            .map(|r| r.facts.len())
            .unwrap_or(0)
    }

    /// 某用户当前存储的事件条数（测试断言用）
    pub async fn event_count(&self, username: &str) -> usize {
        self.users
            .read()
            .await
            .get(username)
            .map(|r| r.events.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn get_profile(&self, username: &str) -> Result<Option<UserProfile>, String> {
        Ok(self
            .users
            .read()
            .await
            .get(username)
            .and_then(|r| r.profile.clone()))
    }

    async fn upsert_profile(&self, profile: &UserProfile) -> Result<(), String> {
        let mut users = self.users.write().await;
        users
            .entry(profile.username.clone())
            .or_default()
            .profile = Some(profile.clone());
        Ok(())
    }

    async fn store_fact(
        &self,
        username: &str,
        fact: &str,
        category: FactCategory,
    ) -> Result<(), String> {
        let mut users = self.users.write().await;
        let record = users.entry(username.to_string()).or_default();

        // 重复事实刷新时间戳，不新增
        if let Some(existing) = record.facts.iter_mut().find(|f| f.fact == fact) {
            existing.stored_at = Utc::now();
            return Ok(());
        }
        record.facts.push(StoredFact {
            fact: fact.to_string(),
            category,
            stored_at: Utc::now(),
        });
        Ok(())
    }

    async fn search_facts(
        &self,
        username: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<StoredFact>, String> {
        let users = self.users.read().await;
        let Some(record) = users.get(username) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<(usize, &StoredFact)> = record
            .facts
            .iter()
            .map(|f| (keyword_overlap(query, &f.fact), f))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored.into_iter().take(k).map(|(_, f)| f.clone()).collect())
    }

    async fn store_event(
        &self,
        username: &str,
        description: &str,
        event_time: DateTime<Utc>,
    ) -> Result<(), String> {
        let mut users = self.users.write().await;
        users
            .entry(username.to_string())
            .or_default()
            .events
            .push(StoredEvent {
                description: description.to_string(),
                event_time,
            });
        Ok(())
    }

    async fn upcoming_events(
        &self,
        username: &str,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, String> {
        let now = Utc::now();
        let users = self.users.read().await;
        let Some(record) = users.get(username) else {
            return Ok(Vec::new());
        };
        let mut upcoming: Vec<StoredEvent> = record
            .events
            .iter()
            .filter(|e| e.event_time > now)
            .cloned()
            .collect();
        upcoming.sort_by_key(|e| e.event_time);
        upcoming.truncate(limit);
        Ok(upcoming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_fact_dedup() {
        let store = InMemoryStore::new();
        store
            .store_fact("ada", "likes pizza", FactCategory::Preference)
            .await
            .unwrap();
        store
            .store_fact("ada", "likes pizza", FactCategory::Preference)
            .await
            .unwrap();
        assert_eq!(store.fact_count("ada").await, 1);
    }

    #[tokio::test]
    async fn test_search_ranks_by_overlap() {
        let store = InMemoryStore::new();
        store
            .store_fact("ada", "birthday is in June", FactCategory::Memory)
            .await
            .unwrap();
        store
            .store_fact("ada", "likes pizza with mushrooms", FactCategory::Preference)
            .await
            .unwrap();

        let hits = store.search_facts("ada", "pizza for dinner", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].fact.contains("pizza"));
    }

    #[tokio::test]
    async fn test_upcoming_events_ordered_and_future_only() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store
            .store_event("ada", "past", now - Duration::minutes(5))
            .await
            .unwrap();
        store
            .store_event("ada", "later", now + Duration::minutes(120))
            .await
            .unwrap();
        store
            .store_event("ada", "soon", now + Duration::minutes(10))
            .await
            .unwrap();

        let events = store.upcoming_events("ada", 5).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].description, "soon");
        assert_eq!(events[1].description, "later");
    }

    #[tokio::test]
    async fn test_user_isolation() {
        let store = InMemoryStore::new();
        store
            .store_fact("ada", "likes pizza", FactCategory::Preference)
            .await
            .unwrap();
        assert_eq!(store.fact_count("bob").await, 0);
        let hits = store.search_facts("bob", "pizza", 5).await.unwrap();
        assert!(hits.is_empty());
    }
}
