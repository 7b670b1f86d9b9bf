//! 网关服务端
//!
//! 单个 TCP 监听器承载两类 WebSocket 端点，按 HTTP 升级路径分角色：
//! /api/assistant/stream → 音频，/api/cognition/stream → 认知。
//! 每条连接：握手（首帧身份声明）→ 建会话并登记 → 读循环分发 → 拆除。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::config::AppConfig;
use crate::core::GatewayError;
use crate::llm::LlmClient;
use crate::memory::{MemoryStore, UserProfile};
use crate::pipeline::PipelineDriver;
use crate::voice::VoiceConnector;

use super::audio::{AudioSession, AudioSessionConfig};
use super::cognition::{CognitionSession, CognitionSessionConfig};
use super::message::{connected_frame, error_frame, AudioClientMessage, CognitionClientMessage, Handshake};
use super::registry::{AudioHandle, CognitionHandle, SessionRegistry, SocketRole};

/// 出站帧发送端：每条连接一个写任务，各 duty 经它写回客户端
pub type OutboundTx = mpsc::UnboundedSender<String>;

/// 连接处理所需的共享依赖
#[derive(Clone)]
struct ConnectionDeps {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn MemoryStore>,
    voice: Arc<dyn VoiceConnector>,
    driver: Arc<PipelineDriver>,
    audio_cfg: AudioSessionConfig,
    cognition_cfg: CognitionSessionConfig,
    handshake_timeout: Duration,
}

/// 网关：监听、分角色、管理连接生命周期
pub struct Hub {
    bind_addr: String,
    deps: ConnectionDeps,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl Hub {
    pub fn new(
        cfg: &AppConfig,
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn MemoryStore>,
        voice: Arc<dyn VoiceConnector>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let driver = Arc::new(PipelineDriver::new(llm, Arc::clone(&store), &cfg.reasoning));
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Self {
            bind_addr: cfg.gateway.bind_addr.clone(),
            deps: ConnectionDeps {
                registry,
                store,
                voice,
                driver,
                audio_cfg: AudioSessionConfig::from_config(cfg),
                cognition_cfg: CognitionSessionConfig::from_config(cfg),
                handshake_timeout: Duration::from_secs(cfg.gateway.handshake_timeout_secs),
            },
            shutdown: shutdown_tx,
        }
    }

    /// 会话注册表（测试与诊断用）
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.deps.registry)
    }

    /// 启动监听；返回实际绑定地址（bind_addr 端口可为 0）
    pub async fn start(&self) -> Result<SocketAddr, GatewayError> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| GatewayError::Bind(format!("{}: {}", self.bind_addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| GatewayError::Bind(e.to_string()))?;

        tracing::info!("gateway listening on ws://{}", local_addr);

        let mut shutdown_rx = self.shutdown.subscribe();
        let deps = self.deps.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        // Sender 已丢弃同样视为关闭
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let deps = deps.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, addr, deps).await {
                                        tracing::warn!("connection error from {}: {}", addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("accept error: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// 停止接收新连接；既有连接随客户端断开自然拆除
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// 升级路径 → 连接角色
fn role_for_path(path: &str) -> Option<SocketRole> {
    if path.starts_with("/api/assistant/stream") {
        Some(SocketRole::Audio)
    } else if path.starts_with("/api/cognition/stream") {
        Some(SocketRole::Cognition)
    } else {
        None
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    deps: ConnectionDeps,
) -> Result<(), GatewayError> {
    let mut path: Option<String> = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        path = Some(req.uri().path().to_string());
        Ok(resp)
    })
    .await
    .map_err(|e| GatewayError::Transport(format!("WebSocket handshake failed: {}", e)))?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // 写任务：所有出站帧都经 tx 串行写回
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let role = match path.as_deref().and_then(role_for_path) {
        Some(role) => role,
        None => {
            let _ = tx.send(error_frame("unknown endpoint path"));
            drop(tx);
            let _ = writer.await;
            return Ok(());
        }
    };

    tracing::info!("new {} connection from {}", role, addr);

    // 身份握手：缺失/空用户名是终结性错误
    let username = match read_identity(&mut ws_rx, deps.handshake_timeout).await {
        Ok(username) => username,
        Err(e) => {
            tracing::warn!("{} handshake from {} failed: {}", role, addr, e);
            let _ = tx.send(error_frame(&e.to_string()));
            drop(tx);
            let _ = writer.await;
            return Ok(());
        }
    };

    // 档案快照：加载一次，连接存续期内不变
    let profile = match deps.store.get_profile(&username).await {
        Ok(Some(profile)) => profile,
        Ok(None) => UserProfile::fallback(&username),
        Err(e) => {
            tracing::warn!("profile load failed for {}: {}", username, e);
            UserProfile::fallback(&username)
        }
    };
    let _ = tx.send(connected_frame(&profile));

    match role {
        SocketRole::Audio => {
            run_audio_connection(&mut ws_rx, tx.clone(), &username, profile, &deps).await
        }
        SocketRole::Cognition => {
            run_cognition_connection(&mut ws_rx, tx.clone(), &username, profile, &deps).await
        }
    }

    tracing::info!("{} connection from {} closed", role, addr);
    drop(tx);
    let _ = writer.await;
    Ok(())
}

type WsReader = SplitStream<WebSocketStream<TcpStream>>;

/// 等待并校验首帧身份声明 `{"username": ...}`
async fn read_identity(ws_rx: &mut WsReader, timeout: Duration) -> Result<String, GatewayError> {
    let frame = tokio::time::timeout(timeout, ws_rx.next())
        .await
        .map_err(|_| GatewayError::Handshake("timed out waiting for identity frame".into()))?
        .ok_or_else(|| GatewayError::Handshake("connection closed before identity frame".into()))?
        .map_err(|e| GatewayError::Handshake(e.to_string()))?;

    let text = match frame {
        WsMessage::Text(text) => text,
        _ => return Err(GatewayError::Handshake("identity frame must be text".into())),
    };

    let identity: Handshake = serde_json::from_str(&text)
        .map_err(|e| GatewayError::Handshake(format!("invalid identity frame: {}", e)))?;
    let username = identity.username.trim().to_string();
    if username.is_empty() {
        return Err(GatewayError::Handshake("username required".into()));
    }
    Ok(username)
}

async fn run_audio_connection(
    ws_rx: &mut WsReader,
    tx: OutboundTx,
    username: &str,
    profile: UserProfile,
    deps: &ConnectionDeps,
) {
    let voice = match deps.voice.connect(username).await {
        Ok(voice) => voice,
        Err(e) => {
            tracing::error!("voice endpoint connect failed for {}: {}", username, e);
            let _ = tx.send(error_frame("voice endpoint unavailable"));
            return;
        }
    };

    let session = AudioSession::new(
        username,
        profile,
        voice,
        Arc::clone(&deps.registry),
        Arc::clone(&deps.driver),
        deps.audio_cfg.clone(),
    );
    deps.registry
        .register_audio(
            username,
            AudioHandle {
                session: Arc::clone(&session),
                tx: tx.clone(),
            },
        )
        .await;
    session.spawn_duties(tx.clone());

    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("receive error on audio socket for {}: {}", username, e);
                break;
            }
        };
        match frame {
            WsMessage::Text(text) => {
                let msg: AudioClientMessage = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!("malformed frame on audio socket for {}: {}", username, e);
                        break;
                    }
                };
                if !session.handle_message(msg, &tx).await {
                    break;
                }
            }
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            _ => {}
        }
    }

    session.teardown().await;
}

async fn run_cognition_connection(
    ws_rx: &mut WsReader,
    tx: OutboundTx,
    username: &str,
    profile: UserProfile,
    deps: &ConnectionDeps,
) {
    let session = CognitionSession::new(
        username,
        profile,
        Arc::clone(&deps.driver),
        Arc::clone(&deps.store),
        Arc::clone(&deps.registry),
        tx.clone(),
        deps.cognition_cfg.clone(),
    );
    deps.registry
        .register_cognition(
            username,
            CognitionHandle {
                session: Arc::clone(&session),
                tx: tx.clone(),
            },
        )
        .await;

    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("receive error on cognition socket for {}: {}", username, e);
                break;
            }
        };
        match frame {
            WsMessage::Text(text) => {
                let msg: CognitionClientMessage = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!("malformed frame on cognition socket for {}: {}", username, e);
                        break;
                    }
                };
                if !session.handle_message(msg).await {
                    break;
                }
            }
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            _ => {}
        }
    }

    session.teardown().await;
}
