//! 网关消息协议定义
//!
//! 两条通道各自的入站/出站帧。入站帧按 `type`（音频）/ `event`（认知）
//! 判别路由；未知判别值解析为 Unknown，忽略而不致命。
//! 两条通道的首帧都必须是 `{"username": ...}` 身份声明。

use serde::{Deserialize, Serialize};

use crate::memory::UserProfile;

/// 握手首帧
#[derive(Debug, Clone, Deserialize)]
pub struct Handshake {
    #[serde(default)]
    pub username: String,
}

/// 音频通道入站帧（按 type 判别）
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudioClientMessage {
    /// base64 PCM 音频块
    Audio { data: String },
    /// base64 JPEG 视频帧
    Video { data: String },
    CameraOn,
    CameraOff,
    /// 自由文本；近期有音频活动时被抑制
    Text { text: String },
    /// 显式要求完整文本回复
    TextOnly { text: String },
    Close,
    #[serde(other)]
    Unknown,
}

/// 音频通道出站帧
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudioServerMessage {
    AudioReply { data: String, sample_rate: u32 },
    TextResponse { response: String, context: String },
}

/// 认知通道入站帧（按 event 判别）
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CognitionClientMessage {
    /// 语音端点判定的话语结束，携带整句转写
    EndOfUtterance {
        #[serde(default)]
        transcription: String,
        #[serde(default)]
        timestamp: Option<f64>,
    },
    /// 流式转写片段（常规路径）
    Transcription {
        #[serde(default)]
        text: String,
        #[serde(default)]
        timestamp: Option<f64>,
    },
    EmotionData {
        #[serde(default)]
        emotion: String,
        #[serde(default)]
        confidence: f64,
    },
    UserAction {
        #[serde(default)]
        action: String,
    },
    Close,
    #[serde(other)]
    Unknown,
}

/// 认知通道出站帧
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CognitionServerMessage {
    ReasoningComplete { context: String, timestamp: f64 },
    Error { error: String },
}

/// 跨通道投递的转写事件（音频侧 → 认知侧）
#[derive(Debug, Clone)]
pub struct TranscriptEvent {
    pub text: String,
    /// 秒级 UNIX 时间戳
    pub timestamp: f64,
}

impl TranscriptEvent {
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp: unix_now(),
        }
    }
}

/// 当前时刻的秒级 UNIX 时间戳
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// 握手成功帧：`{"status":"connected","user":{...}}`
pub fn connected_frame(profile: &UserProfile) -> String {
    serde_json::json!({
        "status": "connected",
        "user": profile,
    })
    .to_string()
}

/// 终结性错误帧：`{"error": ...}`
pub fn error_frame(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}
