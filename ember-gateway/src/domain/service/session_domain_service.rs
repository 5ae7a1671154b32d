//! 会话领域服务
//!
//! 职责：
//! - 登录登记与同设备类型冲突解决（策略来自部署配置，注册表本身只做占用即拒绝）
//! - 登出、管理端强制下线
//! - 在线状态聚合查询

use std::sync::Arc;

use ember_im_core::codes::{CloseCode, StatusCode};
use ember_im_core::error::{EmberError, Result};
use ember_im_core::metrics::GatewayMetrics;
use tracing::{info, warn};

use crate::domain::model::{ConflictPolicy, DeviceType, Session, SessionCreateParams};
use crate::infrastructure::registry::{RegistryError, SessionRegistry};
use crate::protocol::{self, KIND_DUPLICATE_LOGIN, KIND_FORCED_OFFLINE};

/// 登录结果
#[derive(Debug)]
pub enum LoginOutcome {
    /// 会话已登记
    Accepted(Arc<Session>),
    /// 因槽位冲突被拒绝（已在线会话保持不变）
    Declined {
        /// Notify 策略下是否成功向已在线会话推送了提醒
        existing_notified: bool,
    },
}

/// 会话领域服务
pub struct SessionDomainService {
    registry: Arc<SessionRegistry>,
    policy: ConflictPolicy,
    metrics: Arc<GatewayMetrics>,
}

impl SessionDomainService {
    pub fn new(
        registry: Arc<SessionRegistry>,
        policy: ConflictPolicy,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            registry,
            policy,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// 登录：登记新会话，槽位冲突时按配置策略解决
    pub fn login(&self, params: SessionCreateParams) -> Result<LoginOutcome> {
        let session = Arc::new(Session::new(params));

        match self.registry.create_or_join(Arc::clone(&session)) {
            Ok(()) => {
                self.sync_gauge();
                Ok(LoginOutcome::Accepted(session))
            }
            Err(RegistryError::Conflict {
                user_id,
                device_type,
            }) => self.resolve_conflict(session, user_id, device_type),
            Err(other) => Err(EmberError::InvalidParameter(other.to_string())),
        }
    }

    fn resolve_conflict(
        &self,
        session: Arc<Session>,
        user_id: i64,
        device_type: DeviceType,
    ) -> Result<LoginOutcome> {
        match self.policy {
            ConflictPolicy::Decline => {
                info!(user_id = user_id, device_type = %device_type, "Login declined, slot occupied");
                Ok(LoginOutcome::Declined {
                    existing_notified: false,
                })
            }
            ConflictPolicy::Notify => {
                let notified = self.notify_existing(user_id, device_type);
                info!(
                    user_id = user_id,
                    device_type = %device_type,
                    notified = notified,
                    "Login declined, existing session notified"
                );
                Ok(LoginOutcome::Declined {
                    existing_notified: notified,
                })
            }
            ConflictPolicy::Kick => {
                self.displace(user_id, device_type);
                match self.registry.create_or_join(Arc::clone(&session)) {
                    Ok(()) => {
                        self.sync_gauge();
                        Ok(LoginOutcome::Accepted(session))
                    }
                    // 并发登录竞争同一槽位，保守拒绝后来者
                    Err(RegistryError::Conflict { .. }) => Ok(LoginOutcome::Declined {
                        existing_notified: false,
                    }),
                    Err(other) => Err(EmberError::InvalidParameter(other.to_string())),
                }
            }
        }
    }

    /// 向已在线会话推送重复登录提醒（带外信号）
    fn notify_existing(&self, user_id: i64, device_type: DeviceType) -> bool {
        match self.registry.lookup_device(user_id, device_type) {
            Some(existing) => existing.try_push(
                protocol::server_notice(
                    KIND_DUPLICATE_LOGIN,
                    StatusCode::Conflict.as_i32(),
                    "duplicate login attempt detected",
                ),
                None,
            ),
            None => false,
        }
    }

    /// 将已在线会话挤下线（先尽力送达下线通知，再摘除并关闭）
    fn displace(&self, user_id: i64, device_type: DeviceType) {
        if let Some(existing) = self.registry.lookup_device(user_id, device_type) {
            if !existing.try_push(
                protocol::server_notice(
                    KIND_FORCED_OFFLINE,
                    StatusCode::Conflict.as_i32(),
                    "signed in from another connection",
                ),
                None,
            ) {
                warn!(user_id = user_id, device_type = %device_type, "Displacement notice not queued");
            }
        }
        self.registry
            .remove(user_id, device_type, CloseCode::DisplacedByOtherDevice);
        self.sync_gauge();
    }

    /// 登出
    pub fn logout(&self, user_id: i64, device_type: DeviceType) -> bool {
        let removed = self
            .registry
            .remove(user_id, device_type, CloseCode::Normal)
            .is_some();
        self.sync_gauge();
        removed
    }

    /// 管理端强制断开指定设备
    pub fn disconnect_by_admin(&self, user_id: i64, device_type: DeviceType) -> bool {
        if let Some(session) = self.registry.lookup_device(user_id, device_type) {
            session.try_push(
                protocol::server_notice(
                    KIND_FORCED_OFFLINE,
                    StatusCode::Ok.as_i32(),
                    "disconnected by admin",
                ),
                None,
            );
        }
        let removed = self
            .registry
            .remove(user_id, device_type, CloseCode::DisconnectedByAdmin)
            .is_some();
        self.sync_gauge();
        removed
    }

    /// 连接收尾：仅摘除仍绑定在该连接上的会话
    pub fn detach(&self, user_id: i64, device_type: DeviceType, conn_id: &str) -> bool {
        let detached = self.registry.detach(user_id, device_type, conn_id);
        self.sync_gauge();
        detached
    }

    // ==================== 聚合查询 ====================

    pub fn count_online(&self) -> usize {
        self.registry.count_online()
    }

    pub fn user_ids(&self) -> Vec<i64> {
        self.registry.user_ids()
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.registry.is_online(user_id)
    }

    fn sync_gauge(&self) {
        self.metrics
            .online_sessions
            .set(self.registry.count_online() as i64);
    }
}
