//! SQLite 存储：用户档案、事实、事件
//!
//! 单连接 + 互斥锁即可覆盖本系统的写入频率（每次冲刷至多一条事实或事件）。
//! 表结构：user_details / user_knowledge / events。

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use super::store::{
    keyword_overlap, FactCategory, MemoryStore, StoredEvent, StoredFact, UserProfile,
};

/// SQLite 事实/事件存储
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件并初始化表结构
    pub fn open(path: impl AsRef<Path>) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// 进程内数据库（测试用）
    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory().map_err(|e| e.to_string())?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), String> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS user_details (
                username  TEXT PRIMARY KEY,
                name      TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS user_knowledge (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                username  TEXT NOT NULL,
                fact      TEXT NOT NULL,
                category  TEXT NOT NULL,
                stored_at TEXT NOT NULL,
                UNIQUE(username, fact)
            );
            CREATE TABLE IF NOT EXISTS events (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                username    TEXT NOT NULL,
                description TEXT NOT NULL,
                event_time  TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'pending'
            );
            "#,
        )
        .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl MemoryStore for SqliteStore {
    async fn get_profile(&self, username: &str) -> Result<Option<UserProfile>, String> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT username, name FROM user_details WHERE username = ?1")
            .map_err(|e| e.to_string())?;
        let mut rows = stmt
            .query_map(params![username], |row| {
                Ok(UserProfile {
                    username: row.get(0)?,
                    name: row.get(1)?,
                })
            })
            .map_err(|e| e.to_string())?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(|e| e.to_string())?)),
            None => Ok(None),
        }
    }

    async fn upsert_profile(&self, profile: &UserProfile) -> Result<(), String> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO user_details (username, name) VALUES (?1, ?2)
             ON CONFLICT(username) DO UPDATE SET name = ?2",
            params![profile.username, profile.name],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn store_fact(
        &self,
        username: &str,
        fact: &str,
        category: FactCategory,
    ) -> Result<(), String> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO user_knowledge (username, fact, category, stored_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(username, fact) DO UPDATE SET stored_at = ?4",
            params![username, fact, category.as_str(), Utc::now()],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn search_facts(
        &self,
        username: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<StoredFact>, String> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT fact, category, stored_at FROM user_knowledge WHERE username = ?1")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![username], |row| {
                let category: String = row.get(1)?;
                Ok(StoredFact {
                    fact: row.get(0)?,
                    category: FactCategory::parse(&category),
                    stored_at: row.get(2)?,
                })
            })
            .map_err(|e| e.to_string())?;

        let mut scored: Vec<(usize, StoredFact)> = Vec::new();
        for row in rows {
            let fact = row.map_err(|e| e.to_string())?;
            scored.push((keyword_overlap(query, &fact.fact), fact));
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored.into_iter().take(k).map(|(_, f)| f).collect())
    }

    async fn store_event(
        &self,
        username: &str,
        description: &str,
        event_time: DateTime<Utc>,
    ) -> Result<(), String> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO events (username, description, event_time, status)
             VALUES (?1, ?2, ?3, 'pending')",
            params![username, description, event_time],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn upcoming_events(
        &self,
        username: &str,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, String> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT description, event_time FROM events
                 WHERE username = ?1 AND status = 'pending' AND event_time > ?2
                 ORDER BY event_time ASC
                 LIMIT ?3",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![username, Utc::now(), limit as i64], |row| {
                Ok(StoredEvent {
                    description: row.get(0)?,
                    event_time: row.get(1)?,
                })
            })
            .map_err(|e| e.to_string())?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(|e| e.to_string())?);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_profile_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get_profile("ada").await.unwrap().is_none());

        let profile = UserProfile {
            username: "ada".into(),
            name: "Ada Lovelace".into(),
        };
        store.upsert_profile(&profile).await.unwrap();
        assert_eq!(store.get_profile("ada").await.unwrap(), Some(profile));
    }

    #[tokio::test]
    async fn test_fact_conflict_refreshes() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .store_fact("ada", "likes pizza", FactCategory::Preference)
            .await
            .unwrap();
        store
            .store_fact("ada", "likes pizza", FactCategory::Preference)
            .await
            .unwrap();

        let hits = store.search_facts("ada", "pizza", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_upcoming_events_pending_future_only() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .store_event("ada", "past", now - Duration::minutes(10))
            .await
            .unwrap();
        store
            .store_event("ada", "later", now + Duration::minutes(90))
            .await
            .unwrap();
        store
            .store_event("ada", "soon", now + Duration::minutes(15))
            .await
            .unwrap();

        let events = store.upcoming_events("ada", 5).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].description, "soon");
        assert_eq!(events[1].description, "later");
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buddy.db");
        let store = SqliteStore::open(&path).unwrap();
        store
            .store_fact("ada", "birthday is in June", FactCategory::Memory)
            .await
            .unwrap();
        drop(store);

        let reopened = SqliteStore::open(&path).unwrap();
        let hits = reopened.search_facts("ada", "birthday", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
