//! 记忆层：短期对话历史（环形缓冲）与事实/事件存储边界

pub mod conversation;
pub mod in_memory;
pub mod sqlite;
pub mod store;

pub use conversation::{ConversationMemory, Message, Role};
pub use in_memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use store::{FactCategory, MemoryStore, StoredEvent, StoredFact, UserProfile};
