//! 双通道网关
//!
//! 每个用户两条独立的 WebSocket 长连接，按升级路径区分角色：
//!
//! - **音频通道**（/api/assistant/stream）：实时语音编解码 I/O。
//!   只负责"听与说"：音频转发给语音端点、回复转发给客户端、
//!   识别出的转写经注册表投递给认知侧。
//! - **认知通道**（/api/cognition/stream）：较慢的符号推理。
//!   转写片段先去抖聚合成完整话语，再进分类/抽取流水线，
//!   产出的上下文回注给音频侧做 grounding。
//!
//! 两侧独立连接、独立断开，共享一个以用户名为键的会话对；
//! 任一侧在线会话对即存在，两侧都断开的瞬间删除。

pub mod audio;
pub mod cognition;
pub mod debounce;
pub mod hub;
pub mod injector;
pub mod message;
pub mod registry;

pub use audio::{AudioSession, AudioSessionConfig};
pub use cognition::{CognitionSession, CognitionSessionConfig};
pub use debounce::TranscriptionDebouncer;
pub use hub::{Hub, OutboundTx};
pub use injector::ContextInjector;
pub use message::{
    AudioClientMessage, AudioServerMessage, CognitionClientMessage, CognitionServerMessage,
    Handshake, TranscriptEvent,
};
pub use registry::{
    AudioHandle, CognitionHandle, Forwarded, Injection, SessionRegistry, SocketRole,
};
