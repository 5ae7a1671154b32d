//! 原因缓存
//!
//! 登录失败与断连原因的短 TTL 缓存，分两个独立实例。
//! 面向无法直接读取拒绝应答体的“受限”设备类型（如浏览器 WebSocket 客户端）：
//! 连接被拒或被关后，客户端通过带外查询补回原因。
//! TTL 过期后的缺失是预期状态而非错误

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ember_im_core::config::ReasonCacheCategoryConfig;
use ember_im_core::error::{EmberError, Result};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::model::DeviceType;
use crate::domain::repository::ReasonStore;

/// 原因缓存错误
#[derive(Debug, Error)]
pub enum ReasonCacheError {
    /// 该类别未启用
    #[error("reason cache disabled")]
    Disabled,

    /// 查询方设备类型不在受限集合内
    #[error("device type {0} not permitted to query reason cache")]
    ForbiddenDeviceType(DeviceType),

    /// 底层存储失败
    #[error("reason store failure: {0}")]
    Store(String),
}

/// 单类别缓存策略
#[derive(Debug, Clone)]
pub struct ReasonCachePolicy {
    pub enabled: bool,
    pub ttl: Duration,
    pub degraded: HashSet<DeviceType>,
    pub ignore_codes: HashSet<i32>,
}

impl From<&ReasonCacheCategoryConfig> for ReasonCachePolicy {
    fn from(config: &ReasonCacheCategoryConfig) -> Self {
        let mut degraded = HashSet::new();
        for name in &config.degraded_device_types {
            match DeviceType::from_str(name) {
                Ok(device) => {
                    degraded.insert(device);
                }
                Err(err) => warn!(error = %err, "Ignoring unknown degraded device type"),
            }
        }
        Self {
            enabled: config.enabled,
            ttl: Duration::from_secs(config.ttl_secs),
            degraded,
            ignore_codes: config.ignore_close_codes.iter().copied().collect(),
        }
    }
}

/// 原因缓存
///
/// category 区分登录失败与断连两个实例，键空间互不干扰
pub struct ReasonCache {
    category: &'static str,
    policy: ReasonCachePolicy,
    store: Arc<dyn ReasonStore>,
}

impl ReasonCache {
    pub fn new(
        category: &'static str,
        policy: ReasonCachePolicy,
        store: Arc<dyn ReasonStore>,
    ) -> Self {
        Self {
            category,
            policy,
            store,
        }
    }

    fn storage_key(&self, user_id: i64, device_type: DeviceType, correlation: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            self.category, user_id, device_type, correlation
        )
    }

    /// 是否应缓存这条原因
    ///
    /// 条件：类别启用、设备类型属于受限集合、关键字段齐备、
    /// 且（断连类别）关闭码不在忽略清单内
    pub fn should_cache(
        &self,
        user_id: i64,
        device_type: DeviceType,
        correlation: &str,
        code: i32,
    ) -> bool {
        self.policy.enabled
            && user_id > 0
            && device_type.is_recognized()
            && self.policy.degraded.contains(&device_type)
            && !correlation.is_empty()
            && !self.policy.ignore_codes.contains(&code)
    }

    /// 写入原因
    ///
    /// 存储错误原样上抛，由调用方决定记日志继续还是失败
    pub async fn cache(
        &self,
        user_id: i64,
        device_type: DeviceType,
        correlation: &str,
        code: i32,
    ) -> std::result::Result<(), ReasonCacheError> {
        if !self.policy.enabled {
            return Err(ReasonCacheError::Disabled);
        }
        let key = self.storage_key(user_id, device_type, correlation);
        self.store
            .put(key, code, self.policy.ttl)
            .await
            .map_err(|err| ReasonCacheError::Store(err.to_string()))?;
        debug!(
            category = self.category,
            user_id = user_id,
            device_type = %device_type,
            code = code,
            "Reason cached"
        );
        Ok(())
    }

    /// 查询原因
    ///
    /// 类别未启用或查询方设备类型不受限时返回可恢复的类型化错误；
    /// TTL 过期或从未缓存返回 Ok(None)
    pub async fn get(
        &self,
        user_id: i64,
        device_type: DeviceType,
        correlation: &str,
    ) -> std::result::Result<Option<i32>, ReasonCacheError> {
        if !self.policy.enabled {
            return Err(ReasonCacheError::Disabled);
        }
        if !self.policy.degraded.contains(&device_type) {
            return Err(ReasonCacheError::ForbiddenDeviceType(device_type));
        }
        let key = self.storage_key(user_id, device_type, correlation);
        self.store
            .get(&key)
            .await
            .map_err(|err| ReasonCacheError::Store(err.to_string()))
    }
}

struct StoreEntry {
    code: i32,
    expires_at: Instant,
}

impl StoreEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// 写入时触发过期清扫的条目数阈值
const SWEEP_THRESHOLD: usize = 1024;

/// 进程内 TTL 原因存储
#[derive(Default)]
pub struct MemoryReasonStore {
    entries: RwLock<HashMap<String, StoreEntry>>,
}

impl MemoryReasonStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReasonStore for MemoryReasonStore {
    async fn put(&self, key: String, code: i32, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if entries.len() >= SWEEP_THRESHOLD {
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired(now));
            debug!(
                removed = before - entries.len(),
                remaining = entries.len(),
                "Swept expired reason entries"
            );
        }
        entries.insert(
            key,
            StoreEntry {
                code,
                expires_at: now
                    .checked_add(ttl)
                    .ok_or_else(|| EmberError::InvalidParameter("ttl overflow".into()))?,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<i32>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.code))
    }
}
