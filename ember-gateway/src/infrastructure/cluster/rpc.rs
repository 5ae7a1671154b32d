//! 节点间投递通道
//!
//! 显式的带超时 RPC：定长前缀帧 + 版本号 + 消息类别的有限标签集。
//! 调用方式固定为“发出、带超时等待应答、超时即失败”，默认不重试。
//! 接收侧对携带去重标签的任务维护 TTL 记忆窗口，重复任务直接重放上次结果

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use async_trait::async_trait;

use super::task::{ClusterDeliveryTask, TaskError};

/// 通道协议版本
pub const RPC_VERSION: u8 = 1;

const MSG_DELIVER: u8 = 1;
const MSG_ACK: u8 = 2;

const LENGTH_PREFIX: usize = 4;
/// 单条 RPC 消息上限：任务头部 + 最大载荷 + 全量接收方
const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// 集群通道错误
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("unknown peer node: {0}")]
    UnknownNode(String),

    #[error("cluster rpc timed out after {0:?}")]
    Timeout(Duration),

    #[error("peer closed connection before acknowledging")]
    PeerClosed,

    #[error("cluster protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 投递应答
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliverAck {
    /// 至少一个接收方在目标节点收到通知
    pub delivered: bool,
}

/// 节点间消息（有限、带版本的标签集）
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterMessage {
    Deliver(ClusterDeliveryTask),
    Ack(DeliverAck),
}

/// 节点间帧编解码器
///
/// 帧格式：u32 大端长度 + u8 版本 + u8 消息类别 + 消息体
#[derive(Debug, Default)]
pub struct RpcCodec;

impl Decoder for RpcCodec {
    type Item = ClusterMessage;
    type Error = ClusterError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ClusterMessage>, ClusterError> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let mut length_bytes = [0u8; LENGTH_PREFIX];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_MESSAGE_BYTES {
            return Err(ClusterError::Protocol(format!(
                "message of {} bytes exceeds limit",
                length
            )));
        }
        if src.len() < LENGTH_PREFIX + length {
            src.reserve(LENGTH_PREFIX + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let mut body = src.split_to(length).freeze();
        if body.remaining() < 2 {
            return Err(ClusterError::Protocol("message too short".into()));
        }

        let version = body.get_u8();
        if version != RPC_VERSION {
            return Err(ClusterError::Protocol(format!(
                "unsupported version {}",
                version
            )));
        }

        match body.get_u8() {
            MSG_DELIVER => Ok(Some(ClusterMessage::Deliver(ClusterDeliveryTask::decode(
                body,
            )?))),
            MSG_ACK => {
                if body.remaining() < 1 {
                    return Err(ClusterError::Protocol("ack body missing".into()));
                }
                Ok(Some(ClusterMessage::Ack(DeliverAck {
                    delivered: body.get_u8() != 0,
                })))
            }
            other => Err(ClusterError::Protocol(format!(
                "unknown message kind {}",
                other
            ))),
        }
    }
}

impl Encoder<ClusterMessage> for RpcCodec {
    type Error = ClusterError;

    fn encode(&mut self, item: ClusterMessage, dst: &mut BytesMut) -> Result<(), ClusterError> {
        let (kind, body): (u8, Bytes) = match item {
            ClusterMessage::Deliver(task) => (MSG_DELIVER, task.encode()),
            ClusterMessage::Ack(ack) => {
                (MSG_ACK, Bytes::from(vec![u8::from(ack.delivered)]))
            }
        };

        dst.reserve(LENGTH_PREFIX + 2 + body.len());
        dst.put_u32((2 + body.len()) as u32);
        dst.put_u8(RPC_VERSION);
        dst.put_u8(kind);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

/// 集群投递客户端
pub struct ClusterClient {
    peers: HashMap<String, String>,
    timeout: Duration,
}

impl ClusterClient {
    pub fn new(peers: HashMap<String, String>, timeout: Duration) -> Self {
        Self { peers, timeout }
    }

    /// 向指定节点投递任务并等待应答
    ///
    /// 超时视为失败，由调用方决定后续（默认不重试）
    pub async fn deliver(
        &self,
        node: &str,
        task: &ClusterDeliveryTask,
    ) -> Result<DeliverAck, ClusterError> {
        let addr = self
            .peers
            .get(node)
            .ok_or_else(|| ClusterError::UnknownNode(node.to_string()))?;

        let exchange = async {
            let stream = TcpStream::connect(addr.as_str()).await?;
            let mut framed = Framed::new(stream, RpcCodec);
            framed
                .send(ClusterMessage::Deliver(task.clone()))
                .await?;
            match framed.next().await {
                Some(Ok(ClusterMessage::Ack(ack))) => Ok(ack),
                Some(Ok(_)) => Err(ClusterError::Protocol(
                    "expected ack, got another message".into(),
                )),
                Some(Err(err)) => Err(err),
                None => Err(ClusterError::PeerClosed),
            }
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ClusterError::Timeout(self.timeout))?
    }
}

/// 本地投递执行器
///
/// 接收节点以本地扇出的身份消费任务（由出站中继实现）
#[async_trait]
pub trait LocalDeliveryExecutor: Send + Sync {
    async fn execute(&self, task: &ClusterDeliveryTask) -> bool;
}

/// 去重标签记忆窗口
///
/// 记录窗口期内见过的标签及其投递结果；重复任务重放结果而不重复执行
pub struct DedupWindow {
    ttl: Duration,
    seen: Mutex<HashMap<u64, (bool, Instant)>>,
}

impl DedupWindow {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// 若标签在窗口内出现过，返回当时的投递结果
    pub async fn replay(&self, tag: u64) -> Option<bool> {
        let now = Instant::now();
        let mut seen = self.seen.lock().await;
        match seen.get(&tag) {
            Some((delivered, recorded_at)) if now.duration_since(*recorded_at) < self.ttl => {
                Some(*delivered)
            }
            Some(_) => {
                seen.remove(&tag);
                None
            }
            None => None,
        }
    }

    /// 记录标签与结果，顺带清扫过期条目
    pub async fn record(&self, tag: u64, delivered: bool) {
        let now = Instant::now();
        let mut seen = self.seen.lock().await;
        seen.retain(|_, (_, recorded_at)| now.duration_since(*recorded_at) < self.ttl);
        seen.insert(tag, (delivered, now));
    }
}

/// 集群监听循环
///
/// 逐条解码对端消息：投递任务先过去重窗口，再交给本地执行器，
/// 最后回写应答
pub async fn serve_cluster(
    listener: TcpListener,
    executor: Arc<dyn LocalDeliveryExecutor>,
    window: Arc<DedupWindow>,
    cancel: CancellationToken,
) {
    info!("Cluster delivery listener started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Cluster peer connected");
                    let executor = Arc::clone(&executor);
                    let window = Arc::clone(&window);
                    tokio::spawn(handle_peer(stream, executor, window));
                }
                Err(err) => {
                    warn!(error = %err, "Failed to accept cluster peer");
                }
            },
        }
    }
    info!("Cluster delivery listener stopped");
}

async fn handle_peer(
    stream: TcpStream,
    executor: Arc<dyn LocalDeliveryExecutor>,
    window: Arc<DedupWindow>,
) {
    let mut framed = Framed::new(stream, RpcCodec);

    while let Some(message) = framed.next().await {
        match message {
            Ok(ClusterMessage::Deliver(task)) => {
                let delivered = match task.dedup_tag() {
                    Some(tag) => match window.replay(tag).await {
                        Some(previous) => {
                            debug!(tag = tag, "Duplicate delivery task suppressed");
                            previous
                        }
                        None => {
                            let delivered = executor.execute(&task).await;
                            window.record(tag, delivered).await;
                            delivered
                        }
                    },
                    None => executor.execute(&task).await,
                };

                if framed
                    .send(ClusterMessage::Ack(DeliverAck { delivered }))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(ClusterMessage::Ack(_)) => {
                warn!("Unexpected ack from cluster peer");
                break;
            }
            Err(err) => {
                warn!(error = %err, "Cluster peer protocol error");
                break;
            }
        }
    }
}
