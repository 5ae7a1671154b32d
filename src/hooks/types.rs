//! Hook 类型定义

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Hook 元数据
#[derive(Debug, Clone)]
pub struct HookMetadata {
    /// Hook 名称（用于日志）
    pub name: String,
    /// 单次执行超时
    pub timeout: Duration,
    /// 执行优先级（越小越先执行）
    pub priority: i32,
}

impl HookMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: Duration::from_secs(3),
            priority: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// 扇出结束后提供给 Hook 的事件
#[derive(Debug, Clone)]
pub struct NotifyEvent {
    /// 已编码的通知内容（与在线投递共享同一份字节）
    pub notification: Bytes,
    /// 本次扇出的全部接收方
    pub all_recipients: Vec<i64>,
    /// 其中未在任何节点在线的接收方
    pub offline_recipients: Vec<i64>,
}

/// 离线通知 Hook
///
/// 约定：fire-and-collect —— 注册的全部 Hook 依优先级逐个执行并收集结果，
/// 单个 Hook 的失败或超时不会中断后续 Hook
#[async_trait]
pub trait OfflineNotifyHook: Send + Sync {
    async fn handle(&self, event: &NotifyEvent) -> Result<()>;
}
