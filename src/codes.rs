//! 关闭码与应用层状态码
//!
//! 关闭码使用 4000 段（WebSocket 私有区间），同时作为 TCP 连接的应用层关闭原因；
//! 状态码是应答通知中的应用层状态空间，两者均为封闭集合

use serde::{Deserialize, Serialize};

/// 连接关闭码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum CloseCode {
    /// 正常关闭（登出）
    Normal = 4000,
    /// 协议违规（无法解析的帧、未设置 kind）
    BadData = 4001,
    /// 心跳超时
    HeartbeatTimeout = 4002,
    /// 被其他设备挤下线
    DisplacedByOtherDevice = 4003,
    /// 服务端内部错误
    ServerError = 4004,
    /// 重定向到其他节点
    Redirect = 4005,
    /// 管理端强制断开
    DisconnectedByAdmin = 4006,
    /// 登录被拒绝（握手阶段）
    Rejected = 4007,
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// 从数值恢复关闭码，未知数值归入 ServerError
    pub fn from_u16(value: u16) -> Self {
        match value {
            4000 => CloseCode::Normal,
            4001 => CloseCode::BadData,
            4002 => CloseCode::HeartbeatTimeout,
            4003 => CloseCode::DisplacedByOtherDevice,
            4005 => CloseCode::Redirect,
            4006 => CloseCode::DisconnectedByAdmin,
            4007 => CloseCode::Rejected,
            _ => CloseCode::ServerError,
        }
    }

    /// 关闭原因的简短描述（随关闭帧下发）
    pub fn reason(self) -> &'static str {
        match self {
            CloseCode::Normal => "bye",
            CloseCode::BadData => "bad data",
            CloseCode::HeartbeatTimeout => "heartbeat timeout",
            CloseCode::DisplacedByOtherDevice => "displaced by other device",
            CloseCode::ServerError => "server error",
            CloseCode::Redirect => "redirect",
            CloseCode::DisconnectedByAdmin => "disconnected by admin",
            CloseCode::Rejected => "rejected",
        }
    }
}

/// 应答通知状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum StatusCode {
    /// 成功
    Ok = 200,
    /// 成功，但所有接收方都不在线
    RecipientsOffline = 201,
    /// 无效的参数
    InvalidParameter = 400,
    /// 认证失败
    Unauthorized = 401,
    /// 会话冲突
    Conflict = 409,
    /// 服务端内部错误
    ServerError = 500,
}

impl StatusCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}
