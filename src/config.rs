//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BUDDY__*` 覆盖（双下划线表示嵌套，如 `BUDDY__LLM__MODEL=...`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub debounce: DebounceSection,
    #[serde(default)]
    pub reasoning: ReasoningSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub store: StoreSection,
}

/// [app] 段：应用名、对话历史轮数上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 对话历史保留轮数（短期记忆，每轮 user + assistant 两条）
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_history_turns: default_max_history_turns(),
        }
    }
}

fn default_max_history_turns() -> usize {
    20
}

/// [gateway] 段：监听地址与各轮询/抑制窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// WebSocket 监听地址
    pub bind_addr: String,
    /// 握手超时（秒）：首帧必须在此窗口内送达用户名
    pub handshake_timeout_secs: u64,
    /// 近期音频活动抑制 text 帧的窗口（秒）
    pub text_suppress_window_secs: u64,
    /// 上下文变更重新注入语音端点的检查间隔（秒）
    pub context_refresh_secs: u64,
    /// 语音端点回复/转写队列的轮询间隔（毫秒）
    pub reply_poll_ms: u64,
    /// 视频帧转发最小间隔（秒），超频帧丢弃
    pub video_frame_interval_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
            handshake_timeout_secs: 10,
            text_suppress_window_secs: 10,
            context_refresh_secs: 3,
            reply_poll_ms: 10,
            video_frame_interval_secs: 1,
        }
    }
}

/// [debounce] 段：转写去抖与处理窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebounceSection {
    /// 最后一个转写片段之后多少毫秒触发冲刷
    pub flush_delay_ms: u64,
    /// end_of_utterance 事件的重入抑制窗口（秒）
    pub processing_window_secs: u64,
}

impl Default for DebounceSection {
    fn default() -> Self {
        Self {
            flush_delay_ms: 1500,
            processing_window_secs: 2,
        }
    }
}

/// [reasoning] 段：抽取边界与检索条数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReasoningSection {
    /// 事件时间偏移上限（分钟）；越界值被钳制而非报错
    pub max_offset_minutes: i64,
    /// 注入上下文时检索的相关事实条数
    pub top_k_facts: usize,
    /// 注入上下文时检索的待办事件条数
    pub upcoming_events_limit: usize,
}

impl Default for ReasoningSection {
    fn default() -> Self {
        Self {
            // 一年
            max_offset_minutes: 525_600,
            top_k_facts: 5,
            upcoming_events_limit: 5,
        }
    }
}

/// [llm] 段：OpenAI 兼容端点与采样参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    /// 兼容端点地址；未设置时用官方默认
    pub base_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "mistralai/mistral-7b-instruct-v0.3".to_string(),
            base_url: None,
            temperature: 0.2,
            max_tokens: 512,
        }
    }
}

/// [store] 段：SQLite 文件路径；未设置时用进程内存储
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreSection {
    pub path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            gateway: GatewaySection::default(),
            debounce: DebounceSection::default(),
            reasoning: ReasoningSection::default(),
            llm: LlmSection::default(),
            store: StoreSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 BUDDY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BUDDY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BUDDY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.debounce.flush_delay_ms, 1500);
        assert_eq!(cfg.debounce.processing_window_secs, 2);
        assert_eq!(cfg.reasoning.max_offset_minutes, 525_600);
        assert_eq!(cfg.app.max_history_turns, 20);
        assert!(cfg.store.path.is_none());
    }
}
