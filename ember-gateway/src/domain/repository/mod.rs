//! 领域接口定义
//!
//! 网关核心依赖的外部协作者都收敛为这里的 trait：
//! 认证后端、业务处理器、集群归属查询、原因存储。
//! 核心只依赖接口，不关心具体实现

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ember_im_core::error::{EmberError, Result};
use thiserror::Error;

use crate::domain::model::DeviceType;
use crate::protocol::RequestEnvelope;

/// 认证错误
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credential")]
    InvalidCredential,

    #[error("missing credential")]
    MissingCredential,

    #[error("auth backend unavailable: {0}")]
    Unavailable(String),
}

/// 会话认证后端
///
/// 认证可能挂起（远端校验）；失败对当前连接是致命的，核心不做任何自动重试
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        user_id: i64,
        credential: &str,
        device_type: DeviceType,
    ) -> std::result::Result<(), AuthError>;
}

/// 已认证连接的身份视图（传递给业务处理器）
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub user_id: i64,
    pub device_type: DeviceType,
    pub conn_id: String,
}

/// 业务请求处理器
///
/// 核心不理解 kind 的业务含义，只负责按 kind 路由并包装结果：
/// - `Ok(Some(bytes))` 成功且携带应答载荷
/// - `Ok(None)` 成功且应答为空
/// - `Err(EmberError::Business{..})` 业务规则错误，映射为对应状态码
/// - 其他错误映射为通用服务端错误
#[async_trait]
pub trait BusinessHandler: Send + Sync {
    async fn handle(
        &self,
        identity: &SessionIdentity,
        request: &RequestEnvelope,
    ) -> Result<Option<Bytes>>;
}

/// kind 保留区间（网关内部类别），业务处理器不可占用
const RESERVED_KIND_MAX: i32 = 99;

/// 业务处理器注册表
///
/// 启动阶段显式注册构建 kind -> handler 的路由表
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<i32, Arc<dyn BusinessHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: i32, handler: Arc<dyn BusinessHandler>) -> Result<()> {
        if kind <= RESERVED_KIND_MAX {
            return Err(EmberError::InvalidParameter(format!(
                "kind {} is reserved for gateway internal use",
                kind
            )));
        }
        if self.handlers.contains_key(&kind) {
            return Err(EmberError::InvalidParameter(format!(
                "kind {} already registered",
                kind
            )));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn get(&self, kind: i32) -> Option<Arc<dyn BusinessHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// 集群会话归属查询
///
/// 成员发现与健康检查由外部服务承担，核心只消费这一不透明查询
#[async_trait]
pub trait ClusterDirectory: Send + Sync {
    /// 返回持有该用户会话的节点标识；查询不到归属时返回 None
    async fn owner_of(&self, user_id: i64) -> Option<String>;
}

/// 静态归属表实现（测试与单表部署用）
#[derive(Default)]
pub struct StaticClusterDirectory {
    owners: HashMap<i64, String>,
}

impl StaticClusterDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_owner(mut self, user_id: i64, node: impl Into<String>) -> Self {
        self.owners.insert(user_id, node.into());
        self
    }
}

#[async_trait]
impl ClusterDirectory for StaticClusterDirectory {
    async fn owner_of(&self, user_id: i64) -> Option<String> {
        self.owners.get(&user_id).cloned()
    }
}

/// 原因存储
///
/// 带 TTL 的键值存储；过期后的缺失是预期状态而非错误
#[async_trait]
pub trait ReasonStore: Send + Sync {
    async fn put(&self, key: String, code: i32, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<i32>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl BusinessHandler for EchoHandler {
        async fn handle(
            &self,
            _identity: &SessionIdentity,
            request: &RequestEnvelope,
        ) -> Result<Option<Bytes>> {
            Ok(Some(request.payload.clone()))
        }
    }

    #[test]
    fn test_register_rejects_reserved_kind() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.register(5, Arc::new(EchoHandler)).is_err());
        assert!(registry.register(100, Arc::new(EchoHandler)).is_ok());
    }

    #[test]
    fn test_register_rejects_duplicate_kind() {
        let mut registry = HandlerRegistry::new();
        registry.register(200, Arc::new(EchoHandler)).unwrap();
        assert!(registry.register(200, Arc::new(EchoHandler)).is_err());
        assert_eq!(registry.len(), 1);
    }
}
