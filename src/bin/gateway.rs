//! Buddy Gateway - 双通道语音伴侣服务端
//!
//! 同一监听地址上的两个 WebSocket 端点：
//! - /api/assistant/stream（音频：实时语音编解码 I/O）
//! - /api/cognition/stream（认知：推理与记忆副作用）
//!
//! 运行方式：
//! ```bash
//! cargo run --bin buddy-gateway
//! ```

use std::sync::Arc;

use buddy::config::load_config;
use buddy::gateway::Hub;
use buddy::llm::{LlmClient, OpenAiClient};
use buddy::memory::{InMemoryStore, MemoryStore, SqliteStore};
use buddy::voice::{ChannelVoiceConnector, VoiceConnector};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("buddy=info".parse().unwrap()),
        )
        .init();

    let cfg = load_config(None).unwrap_or_default();

    let store: Arc<dyn MemoryStore> = match &cfg.store.path {
        Some(path) => {
            tracing::info!("using sqlite store at {}", path.display());
            Arc::new(SqliteStore::open(path).map_err(anyhow::Error::msg)?)
        }
        None => {
            tracing::info!("no store path configured, using in-memory store");
            Arc::new(InMemoryStore::new())
        }
    };

    let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::from_section(&cfg.llm));

    // 托管语音后端在网关之外接入；进程内用队列端点占位
    let voice: Arc<dyn VoiceConnector> = Arc::new(ChannelVoiceConnector::new());

    let hub = Hub::new(&cfg, llm, store, voice);
    let addr = hub.start().await?;

    tracing::info!("buddy gateway up on ws://{}", addr);
    tracing::info!("press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down gateway...");
    hub.stop();

    Ok(())
}
