//! 网关错误类型
//!
//! 传播策略：传输错误只拆除所属会话；上游服务错误在调用点降级（空回复 /
//! CHAT 分类 / 跳过持久化）；仅握手失败以终结性错误帧回给客户端。

use thiserror::Error;

/// 网关运行过程中可能出现的错误（握手、传输、上游服务、解析等）
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Bind error: {0}")]
    Bind(String),

    #[error("Voice endpoint error: {0}")]
    Voice(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),
}
