//! 连接接入
//!
//! TCP 与 WebSocket 两种接入方式汇入同一个连接调度器：
//! - TCP：长度前缀帧，握手字段随首帧（会话创建请求）到达
//! - WebSocket：握手字段由 HTTP 头携带，连接建立即认证；
//!   空的二进制消息等价于零长度帧（心跳）
//!
//! 每个连接一个事件循环任务：入站帧、出站队列、空闲超时在同一循环内
//! 协调，帧按到达顺序处理，空闲超时由任何入站帧重置

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ember_im_core::codes::CloseCode;

use crate::domain::model::{DeviceType, SinkCommand};
use crate::interface::connection::{ClientConnection, FrameOutcome, HandshakeInfo};
use crate::protocol::{self, ClientFrameCodec, KIND_CLOSE_NOTICE};
use crate::service::GatewayContext;

/// TCP 接入监听循环
pub async fn serve_tcp(ctx: Arc<GatewayContext>, listener: TcpListener, cancel: CancellationToken) {
    info!(addr = ?listener.local_addr().ok(), "TCP listener started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "TCP connection accepted");
                    tokio::spawn(run_tcp_connection(Arc::clone(&ctx), stream));
                }
                Err(err) => warn!(error = %err, "Failed to accept TCP connection"),
            },
        }
    }
    info!("TCP listener stopped");
}

/// WebSocket 接入监听循环
pub async fn serve_ws(ctx: Arc<GatewayContext>, listener: TcpListener, cancel: CancellationToken) {
    info!(addr = ?listener.local_addr().ok(), "WebSocket listener started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "WebSocket connection accepted");
                    tokio::spawn(run_ws_connection(Arc::clone(&ctx), stream));
                }
                Err(err) => warn!(error = %err, "Failed to accept WebSocket connection"),
            },
        }
    }
    info!("WebSocket listener stopped");
}

/// 空闲超时定时器；未配置时永不触发
async fn idle_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// 单个 TCP 连接的事件循环
pub async fn run_tcp_connection(ctx: Arc<GatewayContext>, stream: TcpStream) {
    let idle = ctx.settings.heartbeat_timeout;
    let mut framed = Framed::new(stream, ClientFrameCodec::new(ctx.settings.max_frame_bytes));
    let (tx, mut rx) = mpsc::channel(ctx.settings.outbound_queue);
    let cancel = CancellationToken::new();
    let mut conn = ClientConnection::new(Arc::clone(&ctx), tx, cancel.clone());
    ctx.metrics.connections_total.inc();

    let mut deadline = idle.map(|window| Instant::now() + window);
    let close_code = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                break conn
                    .session()
                    .and_then(|session| session.close_reason())
                    .unwrap_or(CloseCode::Normal);
            }

            cmd = rx.recv() => match cmd {
                Some(SinkCommand::Frame { bytes, guard }) => {
                    let sent = framed.send(bytes).await;
                    // 投递尝试到此完成，引用随之释放
                    drop(guard);
                    if sent.is_err() {
                        break CloseCode::Normal;
                    }
                }
                Some(SinkCommand::Close(code)) => break code,
                None => break CloseCode::Normal,
            },

            inbound = framed.next() => match inbound {
                Some(Ok(frame)) => {
                    if let Some(window) = idle {
                        deadline = Some(Instant::now() + window);
                    }
                    match conn.on_frame(frame).await {
                        FrameOutcome::Continue => {}
                        FrameOutcome::Close(code) => break code,
                    }
                }
                Some(Err(err)) => {
                    warn!(conn_id = %conn.conn_id(), error = %err, "Inbound frame error");
                    break CloseCode::BadData;
                }
                None => break CloseCode::Normal,
            },

            _ = idle_sleep(deadline), if deadline.is_some() => {
                info!(conn_id = %conn.conn_id(), "Heartbeat timeout");
                break CloseCode::HeartbeatTimeout;
            }
        }
    };

    // 冲刷已排队的出站帧，再下发关闭通告
    while let Ok(cmd) = rx.try_recv() {
        if let SinkCommand::Frame { bytes, guard } = cmd {
            let _ = framed.send(bytes).await;
            drop(guard);
        }
    }
    let notice =
        protocol::server_notice(KIND_CLOSE_NOTICE, close_code.as_i32(), close_code.reason());
    let _ = framed.send(notice).await;

    conn.teardown(close_code).await;
}

/// 从 WS 握手请求头提取握手字段
///
/// 没有 x-user-id 头的连接保持未认证状态，仍可发首帧完成会话创建
fn parse_handshake_headers(request: &Request) -> Option<HandshakeInfo> {
    let headers = request.headers();
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };

    let user_id_raw = get("x-user-id")?;
    let user_id = user_id_raw.parse().unwrap_or(0);

    let device_type = get("x-device-type")
        .map(|raw| {
            raw.parse::<DeviceType>()
                .unwrap_or_else(|_| DeviceType::from_i32(raw.parse::<i32>().unwrap_or(0)))
        })
        .unwrap_or(DeviceType::Unrecognized);

    Some(HandshakeInfo {
        request_id: get("x-request-id")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0),
        user_id,
        credential: get("x-credential").unwrap_or_default(),
        device_type,
        location: get("x-location").and_then(|raw| raw.parse().ok()),
        device_detail: get("x-device-detail"),
    })
}

/// 单个 WebSocket 连接的事件循环
pub async fn run_ws_connection(ctx: Arc<GatewayContext>, stream: TcpStream) {
    let mut handshake: Option<HandshakeInfo> = None;
    let ws: WebSocketStream<TcpStream> = match tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            handshake = parse_handshake_headers(request);
            Ok(response)
        },
    )
    .await
    {
        Ok(ws) => ws,
        Err(err) => {
            debug!(error = %err, "WebSocket handshake failed");
            return;
        }
    };

    let idle = ctx.settings.heartbeat_timeout;
    let (tx, mut rx) = mpsc::channel(ctx.settings.outbound_queue);
    let cancel = CancellationToken::new();
    let mut conn = ClientConnection::new(Arc::clone(&ctx), tx, cancel.clone());
    ctx.metrics.connections_total.inc();
    let mut ws = ws;

    // 握手头齐备时直接认证，拒绝原因通过关闭码带给客户端
    let mut early_close: Option<CloseCode> = None;
    if let Some(info) = handshake {
        if let FrameOutcome::Close(code) = conn.authenticate(info).await {
            early_close = Some(code);
        }
    }

    let close_code = match early_close {
        Some(code) => code,
        None => {
            let mut deadline = idle.map(|window| Instant::now() + window);
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        break conn
                            .session()
                            .and_then(|session| session.close_reason())
                            .unwrap_or(CloseCode::Normal);
                    }

                    cmd = rx.recv() => match cmd {
                        Some(SinkCommand::Frame { bytes, guard }) => {
                            let sent = ws.send(Message::Binary(bytes.to_vec())).await;
                            drop(guard);
                            if sent.is_err() {
                                break CloseCode::Normal;
                            }
                        }
                        Some(SinkCommand::Close(code)) => break code,
                        None => break CloseCode::Normal,
                    },

                    inbound = ws.next() => match inbound {
                        Some(Ok(message)) => {
                            if let Some(window) = idle {
                                deadline = Some(Instant::now() + window);
                            }
                            match message {
                                Message::Binary(data) => {
                                    match conn.on_frame(Bytes::from(data)).await {
                                        FrameOutcome::Continue => {}
                                        FrameOutcome::Close(code) => break code,
                                    }
                                }
                                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                                Message::Text(_) => {
                                    ctx.metrics.protocol_violations_total.inc();
                                    break CloseCode::BadData;
                                }
                                Message::Close(_) => break CloseCode::Normal,
                            }
                        }
                        Some(Err(err)) => {
                            debug!(conn_id = %conn.conn_id(), error = %err, "WebSocket read error");
                            break CloseCode::BadData;
                        }
                        None => break CloseCode::Normal,
                    },

                    _ = idle_sleep(deadline), if deadline.is_some() => {
                        info!(conn_id = %conn.conn_id(), "Heartbeat timeout");
                        break CloseCode::HeartbeatTimeout;
                    }
                }
            }
        }
    };

    while let Ok(cmd) = rx.try_recv() {
        if let SinkCommand::Frame { bytes, guard } = cmd {
            let _ = ws.send(Message::Binary(bytes.to_vec())).await;
            drop(guard);
        }
    }
    let _ = ws
        .send(Message::Close(Some(CloseFrame {
            code: WsCloseCode::from(close_code.as_u16()),
            reason: close_code.reason().into(),
        })))
        .await;

    conn.teardown(close_code).await;
}
