//! 网关运行配置
//!
//! 从应用配置聚合出网关实际使用的设置，环境变量可覆盖关键项

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use ember_im_core::config::EmberAppConfig;
use tracing::warn;

use crate::domain::model::ConflictPolicy;
use crate::infrastructure::reason_cache::ReasonCachePolicy;

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// 本节点标识
    pub node_id: String,
    /// TCP 监听地址
    pub tcp_bind: Option<String>,
    /// WebSocket 监听地址
    pub ws_bind: Option<String>,
    /// 心跳空闲超时；None 表示不启用
    pub heartbeat_timeout: Option<Duration>,
    /// 单连接出站队列长度
    pub outbound_queue: usize,
    /// 单帧最大字节数
    pub max_frame_bytes: usize,
    /// 登录冲突策略
    pub conflict_policy: ConflictPolicy,
    /// 服务端错误应答是否附带诊断信息
    pub expose_error_detail: bool,
    /// 摘要认证密钥
    pub auth_secret: String,
    /// 集群 RPC 监听地址
    pub cluster_listen: Option<String>,
    /// 对端节点表
    pub cluster_peers: HashMap<String, String>,
    /// 集群 RPC 超时
    pub rpc_timeout: Duration,
    /// 去重窗口 TTL
    pub dedup_ttl: Duration,
    /// 登录失败原因缓存策略
    pub login_reason_policy: ReasonCachePolicy,
    /// 断连原因缓存策略
    pub disconnect_reason_policy: ReasonCachePolicy,
}

impl GatewaySettings {
    pub fn from_app_config(app: &EmberAppConfig) -> Self {
        let gateway = &app.gateway;
        let cluster = &app.cluster;

        let node_id = std::env::var("EMBER_NODE_ID")
            .ok()
            .unwrap_or_else(|| cluster.node_id.clone());

        let tcp_bind = std::env::var("EMBER_GATEWAY_TCP_BIND")
            .ok()
            .or_else(|| gateway.tcp_bind.clone());

        let ws_bind = std::env::var("EMBER_GATEWAY_WS_BIND")
            .ok()
            .or_else(|| gateway.ws_bind.clone());

        let heartbeat_timeout = match gateway.heartbeat_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let conflict_policy = ConflictPolicy::from_str(&gateway.conflict_policy)
            .unwrap_or_else(|err| {
                warn!(error = %err, "Falling back to decline conflict policy");
                ConflictPolicy::Decline
            });

        let auth_secret = gateway
            .auth_secret
            .clone()
            .or_else(|| std::env::var("EMBER_AUTH_SECRET").ok())
            .unwrap_or_else(|| {
                warn!("No auth secret configured, using insecure default");
                "insecure-secret".to_string()
            });

        Self {
            node_id,
            tcp_bind,
            ws_bind,
            heartbeat_timeout,
            outbound_queue: gateway.outbound_queue,
            max_frame_bytes: gateway.max_frame_bytes,
            conflict_policy,
            expose_error_detail: gateway.expose_error_detail,
            auth_secret,
            cluster_listen: cluster.listen.clone(),
            cluster_peers: cluster.peers.clone(),
            rpc_timeout: Duration::from_millis(cluster.rpc_timeout_ms),
            dedup_ttl: Duration::from_secs(cluster.dedup_ttl_secs),
            login_reason_policy: ReasonCachePolicy::from(&app.reason_cache.login),
            disconnect_reason_policy: ReasonCachePolicy::from(&app.reason_cache.disconnect),
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from_app_config(&EmberAppConfig::default())
    }
}
