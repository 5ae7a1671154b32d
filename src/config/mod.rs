//! 配置加载
//!
//! 配置来源与优先级：
//! 1. `EMBER_CONFIG` 环境变量指定的配置文件
//! 2. `{dir}/ember.toml`
//! 3. 内置默认值
//!
//! 环境特定覆盖见 [`ConfigManager`]

mod manager;

pub use manager::ConfigManager;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// 服务运行时基础配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRuntimeConfig {
    /// 服务名（用于日志与指标标签）
    #[serde(default = "default_service_name")]
    pub name: String,
}

fn default_service_name() -> String {
    "ember-gateway".to_string()
}

impl Default for ServiceRuntimeConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
        }
    }
}

/// 网关监听与会话策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySectionConfig {
    /// TCP 监听地址（不配置则不开启 TCP 接入）
    pub tcp_bind: Option<String>,
    /// WebSocket 监听地址（不配置则不开启 WS 接入）
    pub ws_bind: Option<String>,
    /// 心跳空闲超时（秒），0 表示不启用空闲超时
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// 单连接出站队列长度
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// 单帧最大字节数
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// 同设备类型登录冲突策略：decline / notify / kick
    #[serde(default = "default_conflict_policy")]
    pub conflict_policy: String,
    /// 是否在服务端错误应答中附带诊断信息（默认关闭，避免泄露内部细节）
    #[serde(default)]
    pub expose_error_detail: bool,
    /// 默认摘要认证器使用的密钥
    pub auth_secret: Option<String>,
}

fn default_heartbeat_timeout_secs() -> u64 {
    60
}

fn default_outbound_queue() -> usize {
    256
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

fn default_conflict_policy() -> String {
    "decline".to_string()
}

impl Default for GatewaySectionConfig {
    fn default() -> Self {
        Self {
            tcp_bind: Some("0.0.0.0:8700".to_string()),
            ws_bind: Some("0.0.0.0:8701".to_string()),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            outbound_queue: default_outbound_queue(),
            max_frame_bytes: default_max_frame_bytes(),
            conflict_policy: default_conflict_policy(),
            expose_error_detail: false,
            auth_secret: None,
        }
    }
}

/// 集群互联配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSectionConfig {
    /// 本节点标识
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// 节点间 RPC 监听地址（不配置则不参与集群投递）
    pub listen: Option<String>,
    /// 对端节点表：节点标识 -> 地址
    #[serde(default)]
    pub peers: HashMap<String, String>,
    /// 节点间 RPC 超时（毫秒）
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// 投递任务去重标签的记忆窗口（秒）
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
}

fn default_node_id() -> String {
    "node-1".to_string()
}

fn default_rpc_timeout_ms() -> u64 {
    3000
}

fn default_dedup_ttl_secs() -> u64 {
    120
}

impl Default for ClusterSectionConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            listen: None,
            peers: HashMap::new(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
        }
    }
}

/// 单个原因缓存类别的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasonCacheCategoryConfig {
    /// 是否启用该类别
    #[serde(default)]
    pub enabled: bool,
    /// 缓存 TTL（秒）
    #[serde(default = "default_reason_ttl_secs")]
    pub ttl_secs: u64,
    /// “受限”设备类型集合（无法直接读取拒绝应答体的客户端，如浏览器）
    #[serde(default = "default_degraded_device_types")]
    pub degraded_device_types: Vec<String>,
    /// 不缓存的关闭码（仅断连类别使用）
    #[serde(default)]
    pub ignore_close_codes: Vec<i32>,
}

fn default_reason_ttl_secs() -> u64 {
    300
}

fn default_degraded_device_types() -> Vec<String> {
    vec!["web".to_string()]
}

impl Default for ReasonCacheCategoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: default_reason_ttl_secs(),
            degraded_device_types: default_degraded_device_types(),
            ignore_close_codes: Vec::new(),
        }
    }
}

/// 原因缓存配置（登录失败 / 断连两个独立实例）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasonCacheSectionConfig {
    #[serde(default)]
    pub login: ReasonCacheCategoryConfig,
    #[serde(default)]
    pub disconnect: ReasonCacheCategoryConfig,
}

/// 应用配置聚合
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmberAppConfig {
    #[serde(default)]
    pub base: ServiceRuntimeConfig,
    #[serde(default)]
    pub gateway: GatewaySectionConfig,
    #[serde(default)]
    pub cluster: ClusterSectionConfig,
    #[serde(default)]
    pub reason_cache: ReasonCacheSectionConfig,
}

impl EmberAppConfig {
    pub fn base(&self) -> &ServiceRuntimeConfig {
        &self.base
    }
}

/// 加载应用配置
///
/// `dir` 为配置目录（默认 `config`），目录下寻找 `ember.toml`；
/// `EMBER_CONFIG` 环境变量可指定完整配置文件路径，优先级最高。
/// 配置文件缺失时回退到内置默认值。
pub fn load_config(dir: Option<&str>) -> EmberAppConfig {
    let path = std::env::var("EMBER_CONFIG")
        .unwrap_or_else(|_| format!("{}/ember.toml", dir.unwrap_or("config")));

    let mut config = if Path::new(&path).exists() {
        match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<EmberAppConfig>(&content) {
                Ok(config) => {
                    info!(path = %path, "Loaded configuration");
                    config
                }
                Err(err) => {
                    warn!(path = %path, error = %err, "Invalid configuration, using defaults");
                    EmberAppConfig::default()
                }
            },
            Err(err) => {
                warn!(path = %path, error = %err, "Failed to read configuration, using defaults");
                EmberAppConfig::default()
            }
        }
    } else {
        info!(path = %path, "Configuration file not found, using defaults");
        EmberAppConfig::default()
    };

    if let Err(err) = ConfigManager::load_environment_config(&mut config) {
        warn!(error = %err, "Failed to merge environment configuration");
    }

    config
}
