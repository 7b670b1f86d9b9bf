//! 语音端点接口
//!
//! 回复与转写都按"就绪即取"轮询：队列为空不是错误，只是"还没有"。

use std::sync::Arc;

use async_trait::async_trait;

/// 一段可下发给客户端的语音回复（PCM 字节 + 采样率）
#[derive(Debug, Clone)]
pub struct AudioReply {
    pub sample_rate: u32,
    pub data: Vec<u8>,
}

/// 语音端点：音频/文本双工
#[async_trait]
pub trait VoiceEndpoint: Send + Sync {
    /// 端点是否就绪（可接收音频与 grounding）
    fn is_ready(&self) -> bool;

    /// 送入一段用户音频（PCM 字节）
    async fn send_audio(&self, pcm: &[u8]) -> Result<(), String>;

    /// 送入一帧视频图像（JPEG 字节）
    async fn send_video(&self, frame: &[u8]) -> Result<(), String>;

    /// 旁路注入 grounding 文本（不触发语音回复，仅影响后续生成）
    async fn send_grounding(&self, text: &str) -> Result<(), String>;

    /// 取一段就绪的语音回复；无则 None
    async fn next_reply(&self) -> Option<AudioReply>;

    /// 取一条就绪的用户语音转写；无则 None
    async fn next_transcription(&self) -> Option<String>;

    /// 关闭端点连接（之后 is_ready 返回 false）
    async fn close(&self);
}

/// 按会话创建语音端点的工厂
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    async fn connect(&self, username: &str) -> Result<Arc<dyn VoiceEndpoint>, String>;
}
