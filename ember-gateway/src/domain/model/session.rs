//! Session 模型
//!
//! 职责：表示一台已认证设备的活跃连接
//!
//! 生命周期约束：
//! 1. 仅在连接认证成功后创建，随连接关闭销毁，永不脱离连接存活
//! 2. 插入/摘除只经由会话注册表，心跳刷新只经由所属连接的事件循环
//! 3. 出站写入是非阻塞的，队列满即视为该次尝试失败

use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use ember_im_core::codes::CloseCode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::device::DeviceType;
use super::envelope::NotificationEnvelope;

/// 出站队列命令
#[derive(Debug)]
pub enum SinkCommand {
    /// 下发一帧；guard 在帧实际写出（或写出失败）后随命令释放
    Frame {
        bytes: Bytes,
        guard: Option<NotificationEnvelope>,
    },
    /// 以指定原因关闭连接
    Close(CloseCode),
}

/// 地理位置点
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

impl FromStr for GeoPoint {
    type Err = String;

    /// 解析 "longitude:latitude" 形式
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lon, lat) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid location: {}", s))?;
        let longitude: f64 = lon
            .trim()
            .parse()
            .map_err(|_| format!("invalid longitude: {}", lon))?;
        let latitude: f64 = lat
            .trim()
            .parse()
            .map_err(|_| format!("invalid latitude: {}", lat))?;
        Ok(GeoPoint {
            longitude,
            latitude,
        })
    }
}

/// Session 创建参数
pub struct SessionCreateParams {
    pub user_id: i64,
    pub device_type: DeviceType,
    /// 连接关联标识（日志用）
    pub conn_id: String,
    pub location: Option<GeoPoint>,
    pub device_detail: Option<String>,
    /// 出站队列发送端
    pub sink: mpsc::Sender<SinkCommand>,
    /// 所属连接事件循环的取消令牌（强制关闭通道）
    pub cancel: CancellationToken,
}

/// 一台已认证设备的活跃连接
pub struct Session {
    user_id: i64,
    device_type: DeviceType,
    conn_id: String,

    login_at: DateTime<Utc>,
    last_heartbeat_ms: AtomicI64,

    location: Option<GeoPoint>,
    device_detail: Option<String>,

    sink: mpsc::Sender<SinkCommand>,
    cancel: CancellationToken,
    close_reason: OnceLock<CloseCode>,
}

impl Session {
    pub fn new(params: SessionCreateParams) -> Self {
        let now = Utc::now();
        Self {
            user_id: params.user_id,
            device_type: params.device_type,
            conn_id: params.conn_id,
            login_at: now,
            last_heartbeat_ms: AtomicI64::new(now.timestamp_millis()),
            location: params.location,
            device_detail: params.device_detail,
            sink: params.sink,
            cancel: params.cancel,
            close_reason: OnceLock::new(),
        }
    }

    // ==================== 查询 ====================

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn login_at(&self) -> DateTime<Utc> {
        self.login_at
    }

    pub fn last_heartbeat_ms(&self) -> i64 {
        self.last_heartbeat_ms.load(Ordering::Acquire)
    }

    pub fn location(&self) -> Option<GeoPoint> {
        self.location
    }

    pub fn device_detail(&self) -> Option<&str> {
        self.device_detail.as_deref()
    }

    /// 本会话是否绑定在指定连接上
    pub fn is_bound_to(&self, conn_id: &str) -> bool {
        self.conn_id == conn_id
    }

    /// 关闭时登记的原因（未显式关闭时为 None）
    pub fn close_reason(&self) -> Option<CloseCode> {
        self.close_reason.get().copied()
    }

    // ==================== 命令 ====================

    /// 刷新心跳时间戳
    ///
    /// 仅更新内存状态，无任何挂起点（心跳路径的开销约束）
    pub fn touch(&self) {
        self.last_heartbeat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// 向出站队列非阻塞写入一帧
    ///
    /// 队列满或已关闭即返回 false；guard 随命令进入队列，
    /// 在帧写出或命令被丢弃时释放
    pub fn try_push(&self, bytes: Bytes, guard: Option<NotificationEnvelope>) -> bool {
        self.sink
            .try_send(SinkCommand::Frame { bytes, guard })
            .is_ok()
    }

    /// 以指定原因关闭会话所在连接
    ///
    /// 先尽力投递关闭命令（携带原因下发给客户端），再取消事件循环；
    /// 重复关闭保留首个原因
    pub fn close(&self, code: CloseCode) {
        let _ = self.close_reason.set(code);
        let _ = self.sink.try_send(SinkCommand::Close(code));
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("device_type", &self.device_type)
            .field("conn_id", &self.conn_id)
            .field("login_at", &self.login_at)
            .field("last_heartbeat_ms", &self.last_heartbeat_ms())
            .finish()
    }
}
