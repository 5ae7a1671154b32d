//! 会话注册表
//!
//! 全局共享的可变并发结构：用户 id -> (设备类型 -> 会话)。
//! 写入（登录/登出）罕见且短暂，读取（扇出遍历）高频，
//! 因此外层用分片并发映射、内层设备映射按值快照，
//! 扇出迭代永远不持有注册表锁。
//!
//! 不变性约束：任一时刻每个 (user_id, device_type) 至多一个会话；
//! 占用即拒绝，绝不静默替换

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ember_im_core::codes::CloseCode;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::model::{DeviceType, Session};

/// 注册表错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// 槽位已被占用
    #[error("session slot occupied: user {user_id} device {device_type}")]
    Conflict {
        user_id: i64,
        device_type: DeviceType,
    },

    /// 设备类型为未识别哨兵值
    #[error("unrecognized device type cannot hold a session")]
    UnrecognizedDeviceType,

    /// 用户 id 非法
    #[error("invalid user id: {0}")]
    InvalidUserId(i64),
}

/// 会话注册表
#[derive(Default)]
pub struct SessionRegistry {
    users: DashMap<i64, HashMap<DeviceType, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个新会话
    ///
    /// 槽位被占用时返回 Conflict，由调用方按部署策略决定如何解决；
    /// 注册表本身永不替换已有会话
    pub fn create_or_join(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        let user_id = session.user_id();
        let device_type = session.device_type();

        if user_id <= 0 {
            return Err(RegistryError::InvalidUserId(user_id));
        }
        if !device_type.is_recognized() {
            return Err(RegistryError::UnrecognizedDeviceType);
        }

        match self.users.entry(user_id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().contains_key(&device_type) {
                    return Err(RegistryError::Conflict {
                        user_id,
                        device_type,
                    });
                }
                occupied.get_mut().insert(device_type, session);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(HashMap::from([(device_type, session)]));
            }
        }

        info!(user_id = user_id, device_type = %device_type, "Session registered");
        Ok(())
    }

    /// 摘除会话并以指定原因关闭其连接
    ///
    /// 副作用：向出站队列投递关闭命令、取消连接事件循环（空闲定时器随之取消）。
    /// 槽位不存在时为无操作
    pub fn remove(
        &self,
        user_id: i64,
        device_type: DeviceType,
        code: CloseCode,
    ) -> Option<Arc<Session>> {
        let removed = match self.users.entry(user_id) {
            Entry::Occupied(mut occupied) => {
                let removed = occupied.get_mut().remove(&device_type);
                if occupied.get().is_empty() {
                    occupied.remove();
                }
                removed
            }
            Entry::Vacant(_) => None,
        };

        // 关闭动作在分片锁之外执行
        if let Some(session) = &removed {
            session.close(code);
            info!(
                user_id = user_id,
                device_type = %device_type,
                code = code.as_i32(),
                "Session removed"
            );
        }
        removed
    }

    /// 连接收尾时的静默摘除
    ///
    /// 仅当槽位仍绑定在指定连接上时摘除（避免误删顶替后的新会话）；
    /// 连接已死，不再投递任何关闭命令
    pub fn detach(&self, user_id: i64, device_type: DeviceType, conn_id: &str) -> bool {
        let detached = match self.users.entry(user_id) {
            Entry::Occupied(mut occupied) => {
                let matches = occupied
                    .get()
                    .get(&device_type)
                    .map(|s| s.is_bound_to(conn_id))
                    .unwrap_or(false);
                if matches {
                    occupied.get_mut().remove(&device_type);
                    if occupied.get().is_empty() {
                        occupied.remove();
                    }
                }
                matches
            }
            Entry::Vacant(_) => false,
        };

        if detached {
            debug!(user_id = user_id, device_type = %device_type, conn_id = %conn_id, "Session detached");
        }
        detached
    }

    /// 用户全部设备会话的快照
    ///
    /// 返回值与注册表解耦，扇出期间的并发登录/登出不影响本次迭代
    pub fn lookup(&self, user_id: i64) -> Vec<Arc<Session>> {
        self.users
            .get(&user_id)
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default()
    }

    /// 指定设备类型的会话
    pub fn lookup_device(&self, user_id: i64, device_type: DeviceType) -> Option<Arc<Session>> {
        self.users
            .get(&user_id)
            .and_then(|devices| devices.get(&device_type).cloned())
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.users
            .get(&user_id)
            .map(|devices| !devices.is_empty())
            .unwrap_or(false)
    }

    /// 当前在线会话总数（跨用户、跨设备类型）
    pub fn count_online(&self) -> usize {
        self.users.iter().map(|entry| entry.value().len()).sum()
    }

    /// 当前在线用户 id 列表
    pub fn user_ids(&self) -> Vec<i64> {
        self.users.iter().map(|entry| *entry.key()).collect()
    }
}
