//! # Prometheus 指标收集模块
//!
//! 为网关核心提供统一的 Prometheus 指标收集能力。

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// 全局指标注册表
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// 接入网关指标
pub struct GatewayMetrics {
    /// 当前在线会话数
    pub online_sessions: IntGauge,
    /// 累计建立连接数
    pub connections_total: IntCounter,
    /// 累计心跳帧数
    pub heartbeats_total: IntCounter,
    /// 通知投递总数（按路径区分：local / remote）
    pub notifications_delivered_total: IntCounterVec,
    /// 无在线接收方的投递次数
    pub notifications_offline_total: IntCounter,
    /// 集群 RPC 失败次数
    pub cluster_rpc_failure_total: IntCounter,
    /// 协议违规强制断开次数
    pub protocol_violations_total: IntCounter,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let online_sessions = IntGauge::new(
            "gateway_online_sessions",
            "Number of currently online sessions",
        )
        .expect("Failed to create gateway_online_sessions metric");

        let connections_total = IntCounter::new(
            "gateway_connections_total",
            "Total number of accepted client connections",
        )
        .expect("Failed to create gateway_connections_total metric");

        let heartbeats_total = IntCounter::new(
            "gateway_heartbeats_total",
            "Total number of heartbeat frames received",
        )
        .expect("Failed to create gateway_heartbeats_total metric");

        let notifications_delivered_total = IntCounterVec::new(
            Opts::new(
                "gateway_notifications_delivered_total",
                "Total number of notifications delivered to a session",
            ),
            &["path"],
        )
        .expect("Failed to create gateway_notifications_delivered_total metric");

        let notifications_offline_total = IntCounter::new(
            "gateway_notifications_offline_total",
            "Total number of fan-outs where no recipient was online",
        )
        .expect("Failed to create gateway_notifications_offline_total metric");

        let cluster_rpc_failure_total = IntCounter::new(
            "gateway_cluster_rpc_failure_total",
            "Total number of failed cluster delivery RPCs",
        )
        .expect("Failed to create gateway_cluster_rpc_failure_total metric");

        let protocol_violations_total = IntCounter::new(
            "gateway_protocol_violations_total",
            "Total number of connections force-closed for protocol violations",
        )
        .expect("Failed to create gateway_protocol_violations_total metric");

        Self {
            online_sessions,
            connections_total,
            heartbeats_total,
            notifications_delivered_total,
            notifications_offline_total,
            cluster_rpc_failure_total,
            protocol_violations_total,
        }
    }

    /// 将全部指标注册到指定注册表
    pub fn register_to(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.online_sessions.clone()))?;
        registry.register(Box::new(self.connections_total.clone()))?;
        registry.register(Box::new(self.heartbeats_total.clone()))?;
        registry.register(Box::new(self.notifications_delivered_total.clone()))?;
        registry.register(Box::new(self.notifications_offline_total.clone()))?;
        registry.register(Box::new(self.cluster_rpc_failure_total.clone()))?;
        registry.register(Box::new(self.protocol_violations_total.clone()))?;
        Ok(())
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
