//! 队列式语音端点
//!
//! 进程内双工替身：入站音频计数，回复/转写由外部喂入队列。
//! 测试用它驱动音频会话的各 duty，也可作为未接入托管后端时的回环占位。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::traits::{AudioReply, VoiceConnector, VoiceEndpoint};

/// 队列式端点：replies / transcriptions 两个出队列，grounding 全量留痕
#[derive(Default)]
pub struct ChannelVoiceEndpoint {
    closed: AtomicBool,
    audio_chunks_in: AtomicUsize,
    video_frames_in: AtomicUsize,
    replies: Mutex<VecDeque<AudioReply>>,
    transcriptions: Mutex<VecDeque<String>>,
    groundings: Mutex<Vec<String>>,
}

impl ChannelVoiceEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// 喂入一段语音回复（模拟语音模型开口）
    pub async fn push_reply(&self, reply: AudioReply) {
        self.replies.lock().await.push_back(reply);
    }

    /// 喂入一条用户语音转写（模拟语音模型的识别输出）
    pub async fn push_transcription(&self, text: &str) {
        self.transcriptions.lock().await.push_back(text.to_string());
    }

    /// 已注入的 grounding 文本（断言用）
    pub async fn groundings(&self) -> Vec<String> {
        self.groundings.lock().await.clone()
    }

    /// 已收到的音频块数（断言用）
    pub fn audio_chunks_in(&self) -> usize {
        self.audio_chunks_in.load(Ordering::SeqCst)
    }

    /// 已收到的视频帧数（断言用）
    pub fn video_frames_in(&self) -> usize {
        self.video_frames_in.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceEndpoint for ChannelVoiceEndpoint {
    fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn send_audio(&self, _pcm: &[u8]) -> Result<(), String> {
        if !self.is_ready() {
            return Err("voice endpoint closed".to_string());
        }
        self.audio_chunks_in.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_video(&self, _frame: &[u8]) -> Result<(), String> {
        if !self.is_ready() {
            return Err("voice endpoint closed".to_string());
        }
        self.video_frames_in.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_grounding(&self, text: &str) -> Result<(), String> {
        if !self.is_ready() {
            return Err("voice endpoint closed".to_string());
        }
        self.groundings.lock().await.push(text.to_string());
        Ok(())
    }

    async fn next_reply(&self) -> Option<AudioReply> {
        self.replies.lock().await.pop_front()
    }

    async fn next_transcription(&self) -> Option<String> {
        self.transcriptions.lock().await.pop_front()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.replies.lock().await.clear();
        self.transcriptions.lock().await.clear();
    }
}

/// 队列式端点工厂：按用户名保留端点引用，便于测试侧喂入
#[derive(Default)]
pub struct ChannelVoiceConnector {
    endpoints: Mutex<HashMap<String, Arc<ChannelVoiceEndpoint>>>,
}

impl ChannelVoiceConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取某用户当前的端点（测试侧喂入回复/转写用）
    pub async fn endpoint(&self, username: &str) -> Option<Arc<ChannelVoiceEndpoint>> {
        self.endpoints.lock().await.get(username).cloned()
    }
}

#[async_trait]
impl VoiceConnector for ChannelVoiceConnector {
    async fn connect(&self, username: &str) -> Result<Arc<dyn VoiceEndpoint>, String> {
        let endpoint = Arc::new(ChannelVoiceEndpoint::new());
        self.endpoints
            .lock()
            .await
            .insert(username.to_string(), Arc::clone(&endpoint));
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_not_ready_after_close() {
        let endpoint = ChannelVoiceEndpoint::new();
        assert!(endpoint.is_ready());
        endpoint.push_transcription("hello").await;

        endpoint.close().await;
        assert!(!endpoint.is_ready());
        // 关闭清空队列，之后的注入被拒绝
        assert!(endpoint.next_transcription().await.is_none());
        assert!(endpoint.send_grounding("ctx").await.is_err());
    }

    #[tokio::test]
    async fn test_queues_fifo() {
        let endpoint = ChannelVoiceEndpoint::new();
        endpoint.push_transcription("first").await;
        endpoint.push_transcription("second").await;
        assert_eq!(endpoint.next_transcription().await.as_deref(), Some("first"));
        assert_eq!(endpoint.next_transcription().await.as_deref(), Some("second"));
        assert!(endpoint.next_transcription().await.is_none());
    }
}
