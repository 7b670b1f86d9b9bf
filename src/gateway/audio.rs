//! 音频会话
//!
//! 只负责"听与说"：音频/视频进语音端点，回复出给客户端，
//! 识别出的转写经注册表投递给认知侧。连接存续期内跑四个 duty：
//! 入站分发（hub 的读循环）、出站回复转发、转写转发、上下文变更注入。
//! 任一 duty 失败只终止自身，其余继续；断开时全部随取消令牌一起结束。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::memory::{ConversationMemory, Message, UserProfile};
use crate::pipeline::{PipelineDriver, PipelineState};
use crate::voice::VoiceEndpoint;

use super::hub::OutboundTx;
use super::message::{AudioClientMessage, AudioServerMessage, TranscriptEvent};
use super::registry::{SessionRegistry, SocketRole};

/// 音频会话的窗口与轮询参数
#[derive(Debug, Clone)]
pub struct AudioSessionConfig {
    pub max_history_turns: usize,
    /// 近期音频活动抑制 text 帧的窗口
    pub text_suppress_window: Duration,
    /// 上下文变更检查间隔
    pub context_refresh_interval: Duration,
    /// 回复/转写队列轮询间隔
    pub reply_poll_interval: Duration,
    /// 视频帧最小转发间隔
    pub video_frame_interval: Duration,
}

impl AudioSessionConfig {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_history_turns: cfg.app.max_history_turns,
            text_suppress_window: Duration::from_secs(cfg.gateway.text_suppress_window_secs),
            context_refresh_interval: Duration::from_secs(cfg.gateway.context_refresh_secs),
            reply_poll_interval: Duration::from_millis(cfg.gateway.reply_poll_ms),
            video_frame_interval: Duration::from_secs(cfg.gateway.video_frame_interval_secs),
        }
    }
}

impl Default for AudioSessionConfig {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 最近一次注入语音端点的 grounding 文本缓存
#[derive(Default)]
struct GroundingCache {
    latest: String,
    pushed: String,
}

/// 音频会话：每条音频连接一个，断开即弃，重连新建
pub struct AudioSession {
    username: String,
    profile: UserProfile,
    voice: Arc<dyn VoiceEndpoint>,
    registry: Arc<SessionRegistry>,
    driver: Arc<PipelineDriver>,
    config: AudioSessionConfig,
    history: Mutex<ConversationMemory>,
    last_audio_at: Mutex<Option<Instant>>,
    last_frame_at: Mutex<Option<Instant>>,
    camera_on: AtomicBool,
    grounding: Mutex<GroundingCache>,
    cancel: CancellationToken,
}

impl AudioSession {
    pub fn new(
        username: &str,
        profile: UserProfile,
        voice: Arc<dyn VoiceEndpoint>,
        registry: Arc<SessionRegistry>,
        driver: Arc<PipelineDriver>,
        config: AudioSessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            username: username.to_string(),
            profile,
            voice,
            registry,
            driver,
            history: Mutex::new(ConversationMemory::new(config.max_history_turns)),
            config,
            last_audio_at: Mutex::new(None),
            last_frame_at: Mutex::new(None),
            camera_on: AtomicBool::new(false),
            grounding: Mutex::new(GroundingCache::default()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// 启动后台 duty：出站回复转发、转写转发、上下文注入循环
    pub fn spawn_duties(self: &Arc<Self>, tx: OutboundTx) {
        let session = Arc::clone(self);
        let reply_tx = tx;
        tokio::spawn(async move { session.outbound_relay(reply_tx).await });

        let session = Arc::clone(self);
        tokio::spawn(async move { session.transcription_relay().await });

        let session = Arc::clone(self);
        tokio::spawn(async move { session.context_refresh_loop().await });
    }

    /// 入站分发：按 type 路由一帧；返回 false 表示连接应当关闭
    pub async fn handle_message(&self, msg: AudioClientMessage, tx: &OutboundTx) -> bool {
        match msg {
            AudioClientMessage::Audio { data } => {
                let pcm = match BASE64.decode(data.as_bytes()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!("undecodable audio payload from {}: {}", self.username, e);
                        return true;
                    }
                };
                *self.last_audio_at.lock().unwrap() = Some(Instant::now());
                if let Err(e) = self.voice.send_audio(&pcm).await {
                    tracing::warn!("voice endpoint rejected audio for {}: {}", self.username, e);
                }
                true
            }

            AudioClientMessage::Video { data } => {
                if !self.camera_on.load(Ordering::SeqCst) {
                    tracing::debug!("video frame from {} dropped: camera flag off", self.username);
                    return true;
                }
                // 限频 1 帧/秒，超频帧直接丢弃
                {
                    let mut last = self.last_frame_at.lock().unwrap();
                    if let Some(prev) = *last {
                        if prev.elapsed() < self.config.video_frame_interval {
                            return true;
                        }
                    }
                    *last = Some(Instant::now());
                }
                let frame = match BASE64.decode(data.as_bytes()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!("undecodable video payload from {}: {}", self.username, e);
                        return true;
                    }
                };
                if let Err(e) = self.voice.send_video(&frame).await {
                    tracing::warn!("voice endpoint rejected video for {}: {}", self.username, e);
                }
                true
            }

            AudioClientMessage::CameraOn => {
                self.camera_on.store(true, Ordering::SeqCst);
                true
            }

            AudioClientMessage::CameraOff => {
                self.camera_on.store(false, Ordering::SeqCst);
                true
            }

            AudioClientMessage::Text { text } => {
                let recently_speaking = {
                    let last = self.last_audio_at.lock().unwrap();
                    last.map(|t| t.elapsed() < self.config.text_suppress_window)
                        .unwrap_or(false)
                };
                if recently_speaking {
                    tracing::debug!("text from {} suppressed by recent audio activity", self.username);
                    return true;
                }
                self.history.lock().unwrap().push(Message::user(&text));
                let outcome = self
                    .registry
                    .forward(SocketRole::Audio, &self.username, TranscriptEvent::now(text))
                    .await;
                tracing::debug!("text forward for {}: {:?}", self.username, outcome);
                true
            }

            AudioClientMessage::TextOnly { text } => {
                self.history.lock().unwrap().push(Message::user(&text));
                let snapshot = self.history.lock().unwrap().snapshot();
                let state = PipelineState::new(
                    &text,
                    &self.username,
                    snapshot,
                    self.profile.clone(),
                    false,
                );
                let (state, _) = self.driver.run(state).await;
                self.history
                    .lock()
                    .unwrap()
                    .push(Message::assistant(&state.final_response));

                let frame = AudioServerMessage::TextResponse {
                    response: state.final_response,
                    context: state.reasoning_context,
                };
                if let Ok(json) = serde_json::to_string(&frame) {
                    let _ = tx.send(json);
                }
                true
            }

            AudioClientMessage::Close => false,

            AudioClientMessage::Unknown => {
                tracing::debug!("unknown frame type from {}, ignored", self.username);
                true
            }
        }
    }

    /// 语音端点是否就绪
    pub fn voice_ready(&self) -> bool {
        self.voice.is_ready()
    }

    /// 收下一段 grounding：总是更新缓存；端点就绪时立即注入。
    /// 返回是否已送达（未送达的留给注入循环在端点就绪后补发）
    pub async fn accept_grounding(&self, text: &str) -> bool {
        self.grounding.lock().unwrap().latest = text.to_string();
        if !self.voice.is_ready() {
            return false;
        }
        match self.voice.send_grounding(text).await {
            Ok(()) => {
                self.grounding.lock().unwrap().pushed = text.to_string();
                true
            }
            Err(e) => {
                tracing::warn!("grounding injection failed for {}: {}", self.username, e);
                false
            }
        }
    }

    /// duty：把语音端点就绪的回复转成 audio_reply 帧发给客户端
    async fn outbound_relay(&self, tx: OutboundTx) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reply_poll_interval) => {
                    while let Some(reply) = self.voice.next_reply().await {
                        let frame = AudioServerMessage::AudioReply {
                            data: BASE64.encode(&reply.data),
                            sample_rate: reply.sample_rate,
                        };
                        let Ok(json) = serde_json::to_string(&frame) else { continue };
                        if tx.send(json).is_err() {
                            // 写端已关，本 duty 终止，其余照常
                            return;
                        }
                    }
                }
            }
        }
    }

    /// duty：把识别出的用户转写投递给认知侧
    async fn transcription_relay(&self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reply_poll_interval) => {
                    while let Some(text) = self.voice.next_transcription().await {
                        self.history.lock().unwrap().push(Message::user(&text));
                        let outcome = self
                            .registry
                            .forward(SocketRole::Audio, &self.username, TranscriptEvent::now(text))
                            .await;
                        if outcome == super::registry::Forwarded::NoCounterpart {
                            tracing::debug!("transcript for {} dropped: no cognition side", self.username);
                        }
                    }
                }
            }
        }
    }

    /// duty：缓存的 grounding 变更后（重新）注入语音端点；未变不重发
    async fn context_refresh_loop(&self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.context_refresh_interval) => {
                    let pending = {
                        let cache = self.grounding.lock().unwrap();
                        if !cache.latest.is_empty() && cache.latest != cache.pushed {
                            Some(cache.latest.clone())
                        } else {
                            None
                        }
                    };
                    let Some(text) = pending else { continue };
                    if !self.voice.is_ready() {
                        continue;
                    }
                    match self.voice.send_grounding(&text).await {
                        Ok(()) => self.grounding.lock().unwrap().pushed = text,
                        Err(e) => tracing::warn!("context refresh failed for {}: {}", self.username, e),
                    }
                }
            }
        }
    }

    /// 断开拆除：取消 duty → 注销 → 关语音端点。各步独立兜底，前一步失败不吞后一步
    pub async fn teardown(&self) {
        self.cancel.cancel();
        self.registry
            .unregister(SocketRole::Audio, &self.username)
            .await;
        self.voice.close().await;
        tracing::info!("audio session closed for {}", self.username);
    }
}
