//! 认知会话
//!
//! 接收转写片段（跨通道投递或直连），去抖聚合成完整话语后送入
//! 分类/抽取流水线；处理结果回给客户端并回注音频侧做 grounding。
//!
//! 串行契约：同一会话的话语处理由处理锁串行化；end_of_utterance 事件
//! 另有 2 秒窗口抑制重入，防止推理没跑完又被触发一次、对同一份历史
//! 交错两次推理调用。

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::AppConfig;
use crate::memory::{ConversationMemory, MemoryStore, Message, UserProfile};
use crate::pipeline::{PipelineDriver, PipelineState};

use super::debounce::TranscriptionDebouncer;
use super::hub::OutboundTx;
use super::injector::ContextInjector;
use super::message::{unix_now, CognitionClientMessage, CognitionServerMessage, TranscriptEvent};
use super::registry::{SessionRegistry, SocketRole};

/// 认知会话的去抖与检索参数
#[derive(Debug, Clone)]
pub struct CognitionSessionConfig {
    pub max_history_turns: usize,
    /// 去抖冲刷延迟 D
    pub flush_delay: Duration,
    /// end_of_utterance 重入抑制窗口
    pub processing_window: Duration,
    pub top_k_facts: usize,
    pub upcoming_events_limit: usize,
}

impl CognitionSessionConfig {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_history_turns: cfg.app.max_history_turns,
            flush_delay: Duration::from_millis(cfg.debounce.flush_delay_ms),
            processing_window: Duration::from_secs(cfg.debounce.processing_window_secs),
            top_k_facts: cfg.reasoning.top_k_facts,
            upcoming_events_limit: cfg.reasoning.upcoming_events_limit,
        }
    }
}

impl Default for CognitionSessionConfig {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 认知会话：每条认知连接一个，断开即弃
pub struct CognitionSession {
    username: String,
    profile: UserProfile,
    history: Mutex<ConversationMemory>,
    debouncer: TranscriptionDebouncer,
    /// 处理锁 + 上次处理时刻：串行化话语处理并承载 2 秒窗口
    processing: tokio::sync::Mutex<Option<Instant>>,
    processing_window: Duration,
    driver: Arc<PipelineDriver>,
    injector: ContextInjector,
    registry: Arc<SessionRegistry>,
    outbound: OutboundTx,
}

impl CognitionSession {
    pub fn new(
        username: &str,
        profile: UserProfile,
        driver: Arc<PipelineDriver>,
        store: Arc<dyn MemoryStore>,
        registry: Arc<SessionRegistry>,
        outbound: OutboundTx,
        config: CognitionSessionConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<CognitionSession>| {
            // 冲刷回调经弱引用回到会话：会话拆除后在途冲刷自然失效
            let weak = weak.clone();
            let debouncer = TranscriptionDebouncer::new(config.flush_delay, move |utterance| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(session) = weak.upgrade() {
                        session.process_transcription(&utterance, None).await;
                    }
                })
            });

            Self {
                username: username.to_string(),
                profile,
                history: Mutex::new(ConversationMemory::new(config.max_history_turns)),
                debouncer,
                processing: tokio::sync::Mutex::new(None),
                processing_window: config.processing_window,
                driver,
                injector: ContextInjector::new(store, config.top_k_facts, config.upcoming_events_limit),
                registry,
                outbound,
            }
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// 跨通道事件入口（注册表 forward 调到这里）：片段进去抖缓冲。
    /// 返回是否消费（空文本不消费）
    pub async fn intake_transcript(&self, event: TranscriptEvent) -> bool {
        if event.text.trim().is_empty() {
            tracing::debug!("empty transcript for {} ignored", self.username);
            return false;
        }
        self.debouncer.append(&event.text);
        true
    }

    /// 入站分发：按 event 路由一帧；返回 false 表示连接应当关闭
    pub async fn handle_message(&self, msg: CognitionClientMessage) -> bool {
        match msg {
            CognitionClientMessage::Transcription { text, .. } => {
                if text.trim().is_empty() {
                    tracing::debug!("empty transcription frame from {}", self.username);
                } else {
                    self.debouncer.append(&text);
                }
                true
            }

            CognitionClientMessage::EndOfUtterance {
                transcription,
                timestamp,
            } => {
                if transcription.trim().is_empty() {
                    tracing::warn!("end_of_utterance without transcription from {}", self.username);
                } else {
                    self.process_utterance(&transcription, timestamp).await;
                }
                true
            }

            CognitionClientMessage::EmotionData { emotion, confidence } => {
                // 留痕备用，暂不参与推理上下文
                tracing::info!(
                    "emotion sample for {}: {} ({:.2})",
                    self.username,
                    emotion,
                    confidence
                );
                true
            }

            CognitionClientMessage::UserAction { action } => {
                tracing::info!("user action from {}: {}", self.username, action);
                true
            }

            CognitionClientMessage::Close => false,

            CognitionClientMessage::Unknown => {
                tracing::debug!("unknown event from {}, ignored", self.username);
                true
            }
        }
    }

    /// end_of_utterance 路径：窗口内的重入直接丢弃
    pub async fn process_utterance(&self, transcription: &str, timestamp: Option<f64>) {
        let mut gate = self.processing.lock().await;
        let now = Instant::now();
        if let Some(last) = *gate {
            if now.duration_since(last) < self.processing_window {
                tracing::debug!("utterance for {} dropped by processing window", self.username);
                return;
            }
        }
        *gate = Some(now);
        self.run_pipeline(transcription, timestamp).await;
    }

    /// 去抖冲刷路径：处理锁串行化，不走窗口
    pub async fn process_transcription(&self, utterance: &str, timestamp: Option<f64>) {
        let _gate = self.processing.lock().await;
        self.run_pipeline(utterance, timestamp).await;
    }

    async fn run_pipeline(&self, utterance: &str, timestamp: Option<f64>) {
        tracing::info!("processing utterance for {}: {:.80}", self.username, utterance);
        self.history.lock().unwrap().push(Message::user(utterance));
        let snapshot = self.history.lock().unwrap().snapshot();

        // 语音端点负责口头回复：这里只做抽取与记忆副作用
        let state = PipelineState::new(
            utterance,
            &self.username,
            snapshot,
            self.profile.clone(),
            true,
        );
        let (state, _result) = self.driver.run(state).await;

        let frame = CognitionServerMessage::ReasoningComplete {
            context: state.reasoning_context.clone(),
            timestamp: timestamp.unwrap_or_else(unix_now),
        };
        if let Ok(json) = serde_json::to_string(&frame) {
            let _ = self.outbound.send(json);
        }

        self.injector
            .inject(
                &self.registry,
                &self.username,
                utterance,
                &state.reasoning_context,
            )
            .await;
    }

    /// 去抖缓冲是否非空（测试断言用）
    #[cfg(test)]
    pub(crate) fn debouncer_accumulating(&self) -> bool {
        self.debouncer.is_accumulating()
    }

    /// 断开拆除：作废在途冲刷 → 注销。各步独立兜底
    pub async fn teardown(&self) {
        self.debouncer.cancel();
        self.registry
            .unregister(SocketRole::Cognition, &self.username)
            .await;
        tracing::info!("cognition session closed for {}", self.username);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReasoningSection;
    use crate::llm::MockLlmClient;
    use crate::memory::InMemoryStore;
    use tokio::sync::mpsc;
    use tokio::time::advance;

    fn make_session(
        llm: Arc<MockLlmClient>,
    ) -> (
        Arc<CognitionSession>,
        Arc<InMemoryStore>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(SessionRegistry::new());
        let driver = Arc::new(PipelineDriver::new(
            llm,
            Arc::clone(&store) as _,
            &ReasoningSection::default(),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let session = CognitionSession::new(
            "ada",
            UserProfile::fallback("ada"),
            driver,
            Arc::clone(&store) as _,
            registry,
            tx,
            CognitionSessionConfig::default(),
        );
        (session, store, rx)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragments_debounce_into_single_event() {
        let llm = Arc::new(MockLlmClient::with_responses(vec![
            r#"{"category": "EVENT", "description": "call mom", "time_offset_minutes": 60}"#,
        ]));
        let (session, store, mut rx) = make_session(Arc::clone(&llm));

        for fragment in ["Remind", "me to", "call mom"] {
            session
                .intake_transcript(TranscriptEvent {
                    text: fragment.to_string(),
                    timestamp: 0.0,
                })
                .await;
            advance(Duration::from_millis(200)).await;
        }

        // 1.5 秒静默后恰好一次冲刷、一次推理、一条事件
        advance(Duration::from_millis(1600)).await;
        settle().await;

        assert_eq!(llm.call_count(), 1);
        assert_eq!(store.event_count("ada").await, 1);

        let frame = rx.try_recv().unwrap();
        assert!(frame.contains(r#""event":"reasoning_complete""#));
        assert!(frame.contains("call mom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_utterance_window_drops_reentrant_event() {
        let llm = Arc::new(MockLlmClient::with_responses(vec![
            r#"{"category": "FACT", "fact": "likes pizza", "fact_category": "preference"}"#,
            r#"{"category": "FACT", "fact": "likes sushi", "fact_category": "preference"}"#,
        ]));
        let (session, store, _rx) = make_session(Arc::clone(&llm));

        session.process_utterance("I like pizza", None).await;
        advance(Duration::from_millis(500)).await;
        // 2 秒窗口内的第二个 end_of_utterance 被丢弃：只有一次外部写入
        session.process_utterance("I like sushi", None).await;

        assert_eq!(llm.call_count(), 1);
        assert_eq!(store.fact_count("ada").await, 1);

        advance(Duration::from_secs(3)).await;
        session.process_utterance("I like sushi", None).await;
        assert_eq!(store.fact_count("ada").await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_transcript_not_consumed() {
        let (session, store, _rx) = make_session(Arc::new(MockLlmClient::new()));
        let consumed = session
            .intake_transcript(TranscriptEvent {
                text: "   ".into(),
                timestamp: 0.0,
            })
            .await;
        assert!(!consumed);

        advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(store.fact_count("ada").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_cancels_pending_flush() {
        let llm = Arc::new(MockLlmClient::new());
        let (session, _store, _rx) = make_session(Arc::clone(&llm));

        session
            .intake_transcript(TranscriptEvent {
                text: "doomed fragment".into(),
                timestamp: 0.0,
            })
            .await;
        session.teardown().await;

        advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_close_and_unknown_events() {
        let (session, _store, _rx) = make_session(Arc::new(MockLlmClient::new()));
        assert!(!session.handle_message(CognitionClientMessage::Close).await);
        assert!(session.handle_message(CognitionClientMessage::Unknown).await);
        assert!(
            session
                .handle_message(CognitionClientMessage::EmotionData {
                    emotion: "happy".into(),
                    confidence: 0.9,
                })
                .await
        );
    }
}
