//! 会话注册表
//!
//! 以用户名为键的会话对：配对音频/认知两侧，中转跨通道调用。
//! 不是全局单例：实例由 Hub 持有并注入各会话。
//!
//! 并发纪律：映射的全部变更在单把锁内完成；转发/注入先在锁内克隆出
//! 对端句柄、释放锁，再做任何可能触网的调用，绝不持锁跨 I/O。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::audio::AudioSession;
use super::cognition::CognitionSession;
use super::hub::OutboundTx;
use super::message::TranscriptEvent;

/// 连接角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    Audio,
    Cognition,
}

impl std::fmt::Display for SocketRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketRole::Audio => write!(f, "audio"),
            SocketRole::Cognition => write!(f, "cognition"),
        }
    }
}

/// forward 的结果：投递与否都不是错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    /// 对端收下了事件
    Delivered,
    /// 对端在线但没有消费（如空文本）
    Ignored,
    /// 对端未连接，事件被丢弃
    NoCounterpart,
}

/// inject_context 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Injection {
    Injected,
    /// 音频侧未连接或语音端点未就绪
    NotReady,
}

/// 音频侧句柄：会话引用 + 出站帧发送端
#[derive(Clone)]
pub struct AudioHandle {
    pub session: Arc<AudioSession>,
    pub tx: OutboundTx,
}

/// 认知侧句柄
#[derive(Clone)]
pub struct CognitionHandle {
    pub session: Arc<CognitionSession>,
    pub tx: OutboundTx,
}

/// 一个用户的会话对：至少一侧在线时存在
#[derive(Default)]
struct SessionPair {
    audio: Option<AudioHandle>,
    cognition: Option<CognitionHandle>,
}

impl SessionPair {
    fn is_empty(&self) -> bool {
        self.audio.is_none() && self.cognition.is_none()
    }
}

/// 会话注册表
#[derive(Default)]
pub struct SessionRegistry {
    pairs: Mutex<HashMap<String, SessionPair>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记音频侧；同角色重复登记视为重连，替换句柄
    pub async fn register_audio(&self, username: &str, handle: AudioHandle) {
        let mut pairs = self.pairs.lock().await;
        pairs.entry(username.to_string()).or_default().audio = Some(handle);
        tracing::info!("audio socket registered for {}", username);
    }

    /// 登记认知侧；同角色重复登记视为重连，替换句柄
    pub async fn register_cognition(&self, username: &str, handle: CognitionHandle) {
        let mut pairs = self.pairs.lock().await;
        pairs.entry(username.to_string()).or_default().cognition = Some(handle);
        tracing::info!("cognition socket registered for {}", username);
    }

    /// 注销某一侧；两侧都空时删除会话对。重复注销是无害的 no-op
    pub async fn unregister(&self, role: SocketRole, username: &str) {
        let mut pairs = self.pairs.lock().await;
        let Some(pair) = pairs.get_mut(username) else {
            return;
        };
        match role {
            SocketRole::Audio => pair.audio = None,
            SocketRole::Cognition => pair.cognition = None,
        }
        if pair.is_empty() {
            pairs.remove(username);
            tracing::info!("session pair removed for {}", username);
        } else {
            tracing::info!("{} socket unregistered for {}", role, username);
        }
    }

    /// 把事件投递给对端角色；对端缺席时丢弃事件并返回 NoCounterpart
    pub async fn forward(
        &self,
        from: SocketRole,
        username: &str,
        event: TranscriptEvent,
    ) -> Forwarded {
        match from {
            SocketRole::Audio => {
                let handle = {
                    let pairs = self.pairs.lock().await;
                    pairs.get(username).and_then(|p| p.cognition.clone())
                };
                let Some(handle) = handle else {
                    tracing::debug!("no cognition session for {}, transcript dropped", username);
                    return Forwarded::NoCounterpart;
                };
                if handle.session.intake_transcript(event).await {
                    Forwarded::Delivered
                } else {
                    Forwarded::Ignored
                }
            }
            SocketRole::Cognition => {
                let handle = {
                    let pairs = self.pairs.lock().await;
                    pairs.get(username).and_then(|p| p.audio.clone())
                };
                let Some(handle) = handle else {
                    tracing::debug!("no audio session for {}, directive dropped", username);
                    return Forwarded::NoCounterpart;
                };
                if handle.session.accept_grounding(&event.text).await {
                    Forwarded::Delivered
                } else {
                    Forwarded::Ignored
                }
            }
        }
    }

    /// 向音频侧注入 grounding 文本；未连接或端点未就绪时返回 NotReady，不抛错
    pub async fn inject_context(&self, username: &str, text: &str) -> Injection {
        let handle = {
            let pairs = self.pairs.lock().await;
            pairs.get(username).and_then(|p| p.audio.clone())
        };
        let Some(handle) = handle else {
            return Injection::NotReady;
        };
        if handle.session.accept_grounding(text).await {
            Injection::Injected
        } else {
            Injection::NotReady
        }
    }

    /// 某角色是否在线
    pub async fn is_registered(&self, role: SocketRole, username: &str) -> bool {
        let pairs = self.pairs.lock().await;
        pairs
            .get(username)
            .map(|p| match role {
                SocketRole::Audio => p.audio.is_some(),
                SocketRole::Cognition => p.cognition.is_some(),
            })
            .unwrap_or(false)
    }

    /// 当前会话对数量
    pub async fn pair_count(&self) -> usize {
        self.pairs.lock().await.len()
    }
}
